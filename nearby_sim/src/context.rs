//! Simulation context implementing NearbyContext for deterministic testing.

use async_trait::async_trait;
use nearby_env::{EnvError, NearbyContext};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Simulation context backed by a manually advanced virtual clock.
///
/// - Time only moves when the harness calls `advance_time` / `set_time`
/// - `sleep` resolves once the virtual clock reaches its deadline
/// - Clones share the same clock
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    clock: Arc<watch::Sender<u64>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        let (clock, _) = watch::channel(0u64);
        Self {
            seed,
            clock: Arc::new(clock),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration, waking due sleepers.
    pub fn advance_time(&self, duration: Duration) {
        let delta = duration.as_nanos() as u64;
        self.clock.send_modify(|time| *time += delta);
    }

    /// Sets the virtual time to a specific value.
    pub fn set_time(&self, time_ns: u64) {
        self.clock.send_replace(time_ns);
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *self.clock.borrow()
    }

    /// Wall-clock milliseconds corresponding to virtual time 0.
    pub fn epoch_ms(&self) -> u64 {
        self.epoch
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            clock: Arc::clone(&self.clock),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl NearbyContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.time_ns() + duration.as_nanos() as u64;
        let mut rx = self.clock.subscribe();
        let _ = rx.wait_for(|now| *now >= deadline).await;
    }

    fn spawn<F>(&self, name: &str, future: F) -> Result<JoinHandle<()>, EnvError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = Handle::try_current().map_err(|_| EnvError::no_runtime(name))?;
        tracing::trace!(task = name, "spawning simulated task");
        Ok(handle.spawn(future))
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
    }

    #[test]
    fn test_sim_context_timestamp_starts_at_epoch() {
        let ctx = SimContext::new(1);
        assert_eq!(ctx.timestamp_ms(), 1_704_067_200_000);
        assert_eq!(ctx.epoch_ms(), 1_704_067_200_000);

        ctx.advance_time(Duration::from_millis(61_000));
        assert_eq!(ctx.timestamp_ms(), 1_704_067_261_000);
    }

    #[test]
    fn test_sim_context_seed() {
        let ctx = SimContext::new(12345);
        assert_eq!(ctx.seed(), 12345);
    }

    #[test]
    fn test_sim_context_clone_shares_time() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5));

        // Both should see the same time
        assert_eq!(ctx1.now(), ctx2.now());
    }

    #[tokio::test]
    async fn test_sleep_waits_for_virtual_clock() {
        let ctx = SimContext::shared(7);
        let woke = Arc::new(AtomicBool::new(false));

        let sleeper = {
            let ctx = Arc::clone(&ctx);
            let woke = Arc::clone(&woke);
            tokio::spawn(async move {
                ctx.sleep(Duration::from_secs(10)).await;
                woke.store(true, Ordering::SeqCst);
            })
        };
        tokio::task::yield_now().await;

        ctx.advance_time(Duration::from_secs(9));
        tokio::task::yield_now().await;
        assert!(!woke.load(Ordering::SeqCst));

        ctx.advance_time(Duration::from_secs(1));
        sleeper.await.unwrap();
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn test_spawn_without_runtime() {
        let ctx = SimContext::new(0);
        assert!(matches!(ctx.spawn("orphan", async {}), Err(EnvError::NoRuntime(_))));
    }
}
