//! Core environment context trait for Nearby sessions.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

use crate::error::EnvError;

/// The central interface for environment interaction.
///
/// This trait abstracts the "real world" so that the aggregation core can
/// run against a production clock or a virtual one.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and the ambient runtime
/// - **Simulation**: `SimContext` (in `nearby_sim`) - manually advanced clock
#[async_trait]
pub trait NearbyContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used to stamp sightings.
    fn system_time(&self) -> SystemTime;

    /// Returns `system_time()` as milliseconds since the UNIX epoch.
    ///
    /// This is the clock eviction compares `last_seen` against. A clock set
    /// before the epoch reads as 0.
    fn timestamp_ms(&self) -> u64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: resolves once the virtual clock reaches the deadline
    async fn sleep(&self, duration: Duration);

    /// Spawns a named background task.
    ///
    /// Returns `EnvError::NoRuntime` instead of panicking when called
    /// outside an async runtime.
    fn spawn<F>(&self, name: &str, future: F) -> Result<JoinHandle<()>, EnvError>
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    /// In simulation, returns the master seed.
    fn seed(&self) -> u64;
}
