//! Aggregation Core - orchestrates registry, publisher and expiry scheduler.
//!
//! This is the in-process API surface handed to scan producers and to
//! presentation consumers.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐  report()   ┌──────────────────────────────────────┐
//! │ BLE producer  │────────────►│            AggregationCore           │
//! └───────────────┘             │  ┌──────────────┐  ┌──────────────┐  │  current_snapshot()
//! ┌───────────────┐  report()   │  │  Observation │─►│   Snapshot   │──┼──────────────────►
//! │ Wi-Fi producer│────────────►│  │   Registry   │  │  Publisher   │  │  subscribe() / watch()
//! └───────────────┘             │  └──────▲───────┘  └──────────────┘  │
//!                               │         │ evict_older_than()         │
//!                               │  ┌──────┴───────┐                    │
//!                               │  │    Expiry    │  start() / stop()  │
//!                               │  │  Scheduler   │                    │
//!                               │  └──────────────┘                    │
//!                               └──────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use nearby_core::{AggregationCore, AggregatorConfig, SourceKind};
//! use nearby_env::TokioContext;
//!
//! let core = AggregationCore::new(TokioContext::shared(), AggregatorConfig::default());
//! core.start()?;
//!
//! let reporter = core.reporter();
//! reporter.report("BLE:AA:BB", Some("Phone"), -62, SourceKind::Ble, now_ms)?;
//!
//! for sighting in core.current_snapshot().iter() {
//!     println!("{} {}", sighting.identity, core.estimate_distance(sighting.signal_strength));
//! }
//! ```

use nearby_env::{EnvError, NearbyContext};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::distance::{DistanceEstimate, PathLossModel};
use crate::publisher::{Snapshot, SnapshotPublisher, SnapshotStream, SubscriptionId};
use crate::registry::{EvictionReport, ObservationRegistry};
use crate::scheduler::{ExpiryScheduler, DEFAULT_SWEEP_INTERVAL};
use crate::sighting::{Identity, Sighting, SightingError, SourceKind};

/// Default age after which a sighting is evicted (60 s).
pub const DEFAULT_EXPIRY_TIMEOUT: Duration = Duration::from_millis(60_000);

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for an aggregation session.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    /// Maximum sighting age before eviction (default: 60 s)
    pub expiry_timeout: Duration,

    /// Delay between expiry sweeps (default: 10 s)
    pub sweep_interval: Duration,

    /// Model used by `estimate_distance`
    pub path_loss: PathLossModel,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            expiry_timeout: DEFAULT_EXPIRY_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            path_loss: PathLossModel::default(),
        }
    }
}

impl AggregatorConfig {
    pub fn with_expiry_timeout(mut self, timeout: Duration) -> Self {
        self.expiry_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_path_loss(mut self, model: PathLossModel) -> Self {
        self.path_loss = model;
        self
    }
}

// ============================================================================
// ERRORS / STATE
// ============================================================================

/// Errors raised by session control.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to start expiry scheduler: {0}")]
    Scheduler(#[from] EnvError),
}

/// Whether the session is currently aggregating.
///
/// Producers watch this as their stop signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
}

// ============================================================================
// SHARED STATE
// ============================================================================

/// Registry and publisher, shared by the core, reporters and the sweep task.
struct Shared {
    registry: ObservationRegistry,
    publisher: SnapshotPublisher,
}

impl Shared {
    fn upsert(&self, sighting: Sighting) {
        self.registry.upsert(sighting);
        self.publisher.publish(&self.registry);
    }

    fn sweep(&self, timeout: Duration, now_ms: u64) -> EvictionReport {
        let report = self.registry.evict_older_than(timeout, now_ms);
        if report.any_removed() {
            debug!(
                removed = report.removed_count(),
                examined = report.examined,
                "evicted stale sightings"
            );
            self.publisher.publish(&self.registry);
        }
        report
    }
}

// ============================================================================
// REPORTER (Producer Handle)
// ============================================================================

/// Cloneable inbound handle given to scan producers.
#[derive(Clone)]
pub struct Reporter {
    shared: Arc<Shared>,
    state: watch::Receiver<SessionState>,
}

impl Reporter {
    /// Records one raw observation.
    ///
    /// Fails only for an empty identity; a 0 dBm reading is accepted as
    /// "distance unknown".
    pub fn report(
        &self,
        identity: &str,
        display_name: Option<&str>,
        signal_strength: i32,
        source_kind: SourceKind,
        observed_at: u64,
    ) -> Result<(), SightingError> {
        let sighting = Sighting::new(
            Identity::new(identity)?,
            display_name.map(str::to_owned),
            signal_strength,
            source_kind,
            observed_at,
        );
        self.upsert(sighting);
        Ok(())
    }

    /// Records an already-built sighting. Always succeeds.
    pub fn upsert(&self, sighting: Sighting) {
        self.shared.upsert(sighting);
    }

    /// False once the session has been stopped.
    pub fn is_active(&self) -> bool {
        *self.state.borrow() == SessionState::Active
    }

    /// Resolves when the session leaves the active state (or the core is dropped).
    pub async fn stopped(&mut self) {
        let _ = self
            .state
            .wait_for(|state| *state != SessionState::Active)
            .await;
    }
}

// ============================================================================
// AGGREGATION CORE
// ============================================================================

/// A Nearby aggregation session.
///
/// Generic over the environment context so the same session code runs
/// against the system clock or a virtual one.
pub struct AggregationCore<Ctx: NearbyContext> {
    /// Environment context (clock + task spawning)
    context: Arc<Ctx>,

    /// Configuration
    config: AggregatorConfig,

    /// Registry + publisher
    shared: Arc<Shared>,

    /// Periodic eviction
    scheduler: ExpiryScheduler<Ctx>,

    /// Session state broadcast to producers
    state: watch::Sender<SessionState>,
}

impl<Ctx: NearbyContext> AggregationCore<Ctx> {
    /// Creates an idle session.
    pub fn new(context: Arc<Ctx>, config: AggregatorConfig) -> Self {
        let scheduler = ExpiryScheduler::new(Arc::clone(&context), config.sweep_interval);
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            context,
            config,
            shared: Arc::new(Shared {
                registry: ObservationRegistry::new(),
                publisher: SnapshotPublisher::new(),
            }),
            scheduler,
            state,
        }
    }

    /// Creates an idle session with default configuration.
    pub fn with_defaults(context: Arc<Ctx>) -> Self {
        Self::new(context, AggregatorConfig::default())
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.context
    }

    // ========================================================================
    // INBOUND (Producers)
    // ========================================================================

    /// Returns a producer handle sharing this session's registry.
    pub fn reporter(&self) -> Reporter {
        Reporter {
            shared: Arc::clone(&self.shared),
            state: self.state.subscribe(),
        }
    }

    /// Records one raw observation. See [`Reporter::report`].
    pub fn report(
        &self,
        identity: &str,
        display_name: Option<&str>,
        signal_strength: i32,
        source_kind: SourceKind,
        observed_at: u64,
    ) -> Result<(), SightingError> {
        self.reporter()
            .report(identity, display_name, signal_strength, source_kind, observed_at)
    }

    /// Inserts or replaces a sighting and republishes.
    pub fn upsert(&self, sighting: Sighting) {
        self.shared.upsert(sighting);
    }

    // ========================================================================
    // EVICTION
    // ========================================================================

    /// Drops sightings older than `timeout` relative to the context clock.
    ///
    /// Republishes only when something was removed.
    pub fn evict_older_than(&self, timeout: Duration) -> EvictionReport {
        self.shared.sweep(timeout, self.context.timestamp_ms())
    }

    /// Evicts with the configured expiry timeout.
    pub fn evict_stale(&self) -> EvictionReport {
        self.evict_older_than(self.config.expiry_timeout)
    }

    // ========================================================================
    // OUTBOUND (Consumers)
    // ========================================================================

    /// Returns the most recently published snapshot.
    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        self.shared.publisher.current()
    }

    /// Registers a synchronous change listener.
    ///
    /// The callback runs outside every internal lock, on whichever thread is
    /// delivering, and may call back into this session (report, query or
    /// stop). Each callback sees strictly increasing versions; bursts of
    /// concurrent publications may be collapsed into the newest one.
    pub fn subscribe<F>(&self, on_change: F) -> SubscriptionId
    where
        F: Fn(&Arc<Snapshot>) + Send + Sync + 'static,
    {
        self.shared.publisher.subscribe(on_change)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.publisher.unsubscribe(id)
    }

    /// Opens an async latest-value snapshot stream.
    pub fn watch(&self) -> SnapshotStream {
        self.shared.publisher.watch()
    }

    /// Rough distance for display, using the configured model.
    pub fn estimate_distance(&self, signal_strength: i32) -> DistanceEstimate {
        self.config.path_loss.estimate(signal_strength)
    }

    pub fn len(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.registry.is_empty()
    }

    // ========================================================================
    // SESSION CONTROL
    // ========================================================================

    /// Starts the expiry scheduler. Idempotent.
    pub fn start(&self) -> Result<(), SessionError> {
        let shared = Arc::clone(&self.shared);
        let context = Arc::clone(&self.context);
        let timeout = self.config.expiry_timeout;

        let started = self.scheduler.start(move || {
            shared.sweep(timeout, context.timestamp_ms());
        })?;

        if started {
            self.state.send_replace(SessionState::Active);
            info!(
                timeout_ms = timeout.as_millis() as u64,
                interval_ms = self.config.sweep_interval.as_millis() as u64,
                seed = self.context.seed(),
                "aggregation session started"
            );
        }
        Ok(())
    }

    /// Stops the expiry scheduler and signals producers. Idempotent.
    ///
    /// Reports arriving after this are still processed.
    pub fn stop(&self) {
        if self.scheduler.stop() {
            self.state.send_replace(SessionState::Idle);
            info!(entries = self.len(), "aggregation session stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        *self.state.borrow() == SessionState::Active
    }

    /// Subscribes to session state changes.
    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}

impl<Ctx: NearbyContext> Drop for AggregationCore<Ctx> {
    fn drop(&mut self) {
        self.stop();
    }
}
