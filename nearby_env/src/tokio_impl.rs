//! Production implementation of NearbyContext using Tokio.

use crate::{EnvError, NearbyContext};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Production context backed by Tokio and the system clock.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl TokioContext {
    /// Creates a new TokioContext.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NearbyContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F) -> Result<JoinHandle<()>, EnvError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = Handle::try_current().map_err(|_| EnvError::no_runtime(name))?;
        tracing::debug!(task = name, "spawning background task");
        Ok(handle.spawn(future.instrument(tracing::debug_span!("task", name = name))))
    }

    fn seed(&self) -> u64 {
        // Production is not seeded
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[test]
    fn test_tokio_context_timestamp_tracks_wall_clock() {
        let ctx = TokioContext::new();
        let before = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let ts = ctx.timestamp_ms();

        assert!(ts >= before);
        assert!(ts - before < 5_000);
    }

    #[tokio::test]
    async fn test_tokio_context_spawn_runs_task() {
        let ctx = TokioContext::new();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let handle = ctx
            .spawn("probe", async move {
                let _ = tx.send(7u8);
            })
            .unwrap();

        assert_eq!(rx.await.unwrap(), 7);
        handle.await.unwrap();
    }

    #[test]
    fn test_tokio_context_spawn_without_runtime() {
        let ctx = TokioContext::new();
        let result = ctx.spawn("orphan", async {});

        assert!(matches!(result, Err(EnvError::NoRuntime(name)) if name == "orphan"));
    }

    #[test]
    fn test_tokio_context_seed() {
        let ctx = TokioContext::new();
        assert_eq!(ctx.seed(), 0);
    }
}
