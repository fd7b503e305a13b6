//! The Expiry Scheduler - periodic eviction while a session is active.
//!
//! Fixed-delay cadence: sleep `interval`, run one sweep, repeat. Drift is
//! not compensated.
//!
//! # Synchronous Stop
//!
//! Each task carries the generation it was started with. A sweep runs while
//! holding the in-flight lock and only if the shared generation still
//! matches. `stop()` bumps the generation, releases the control gate and then
//! waits on the in-flight lock, so once it returns no sweep is running and
//! none will start, even if the aborted task is still being torn down on
//! another worker.
//!
//! The control gate is never held while a sweep runs, so anything the sweep
//! triggers may query or stop the scheduler. A `stop()` issued from inside
//! the sweep itself skips the wait.

use nearby_env::{EnvError, NearbyContext};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default delay between sweeps (10 s).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(10_000);

thread_local! {
    static SWEEPING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running a sweep until dropped.
struct SweepMarker;

impl SweepMarker {
    fn enter() -> Self {
        SWEEPING.with(|flag| flag.set(true));
        SweepMarker
    }
}

impl Drop for SweepMarker {
    fn drop(&mut self) {
        SWEEPING.with(|flag| flag.set(false));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cancellable periodic task that invokes a sweep closure.
pub struct ExpiryScheduler<Ctx: NearbyContext> {
    context: Arc<Ctx>,
    interval: Duration,

    /// Running task, if any
    control: Mutex<Option<JoinHandle<()>>>,

    /// Incremented on every start and stop
    generation: Arc<AtomicU64>,

    /// Held for the duration of each sweep
    in_flight: Arc<Mutex<()>>,
}

impl<Ctx: NearbyContext> ExpiryScheduler<Ctx> {
    /// Creates a stopped scheduler.
    pub fn new(context: Arc<Ctx>, interval: Duration) -> Self {
        Self {
            context,
            interval,
            control: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts the periodic task. Returns `Ok(false)` if already running.
    ///
    /// The first sweep fires one full interval after this call.
    pub fn start<F>(&self, sweep: F) -> Result<bool, EnvError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut control = lock(&self.control);
        if control.is_some() {
            return Ok(false);
        }

        // Published before spawning so a short first sleep cannot race it
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let context = Arc::clone(&self.context);
        let shared_generation = Arc::clone(&self.generation);
        let in_flight = Arc::clone(&self.in_flight);
        let interval = self.interval;

        let task = self.context.spawn("expiry-scheduler", async move {
            loop {
                context.sleep(interval).await;

                let current = {
                    let _sweeping = lock(&in_flight);
                    if shared_generation.load(Ordering::SeqCst) == generation {
                        let _marker = SweepMarker::enter();
                        sweep();
                        true
                    } else {
                        false
                    }
                };
                if !current {
                    break;
                }
            }
        })?;

        *control = Some(task);
        debug!(generation, interval_ms = interval.as_millis() as u64, "expiry scheduler started");
        Ok(true)
    }

    /// Stops the periodic task. Returns false if it was not running.
    ///
    /// After this returns, no further sweep executes. When called from a
    /// thread that is not inside the sweep, it also waits for an in-flight
    /// sweep to finish.
    pub fn stop(&self) -> bool {
        let task = {
            let mut control = lock(&self.control);
            let task = control.take();
            if task.is_some() {
                self.generation.fetch_add(1, Ordering::SeqCst);
            }
            task
        };
        let Some(task) = task else {
            return false;
        };
        task.abort();

        if !SWEEPING.with(Cell::get) {
            drop(lock(&self.in_flight));
        }
        debug!(generation = self.generation.load(Ordering::SeqCst), "expiry scheduler stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        lock(&self.control).is_some()
    }
}

impl<Ctx: NearbyContext> Drop for ExpiryScheduler<Ctx> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearby_env::TokioContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_scheduler(interval_secs: u64) -> (ExpiryScheduler<TokioContext>, Arc<AtomicUsize>) {
        let scheduler = ExpiryScheduler::new(
            TokioContext::shared(),
            Duration::from_secs(interval_secs),
        );
        (scheduler, Arc::new(AtomicUsize::new(0)))
    }

    fn counter_sweep(count: &Arc<AtomicUsize>) -> impl Fn() + Send + Sync + 'static {
        let count = Arc::clone(count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_cadence() {
        let (scheduler, count) = counting_scheduler(10);
        assert!(scheduler.start(counter_sweep(&count)).unwrap());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (scheduler, count) = counting_scheduler(10);
        assert!(scheduler.start(counter_sweep(&count)).unwrap());
        assert!(!scheduler.start(counter_sweep(&count)).unwrap());

        tokio::time::sleep(Duration::from_secs(25)).await;
        // A second task would have doubled the count
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_sweeps() {
        let (scheduler, count) = counting_scheduler(10);
        scheduler.start(counter_sweep(&count)).unwrap();

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(scheduler.stop());
        assert!(!scheduler.is_running());
        let at_stop = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), at_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_stopped_is_noop() {
        let (scheduler, _) = counting_scheduler(10);
        assert!(!scheduler.stop());
        assert!(!scheduler.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resets_cadence() {
        let (scheduler, count) = counting_scheduler(10);
        scheduler.start(counter_sweep(&count)).unwrap();
        tokio::time::sleep(Duration::from_secs(18)).await;
        scheduler.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.start(counter_sweep(&count)).unwrap();
        // Old schedule would have fired at t=20s; the new one waits a full interval
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    fn blocking_sweep(
        started: &Arc<AtomicUsize>,
        finished: &Arc<AtomicUsize>,
    ) -> impl Fn() + Send + Sync + 'static {
        let (started, finished) = (Arc::clone(started), Arc::clone(finished));
        move || {
            started.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_waits_for_in_flight_sweep() {
        let scheduler = ExpiryScheduler::new(TokioContext::shared(), Duration::from_millis(20));
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        scheduler.start(blocking_sweep(&started, &finished)).unwrap();

        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(scheduler.stop());

        // The sweep caught mid-flight completed before stop returned
        let at_stop = started.load(Ordering::SeqCst);
        assert_eq!(finished.load(Ordering::SeqCst), at_stop);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(started.load(Ordering::SeqCst), at_stop);
        assert_eq!(finished.load(Ordering::SeqCst), at_stop);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sweep_may_query_and_stop_its_scheduler() {
        let scheduler = Arc::new(ExpiryScheduler::new(
            TokioContext::shared(),
            Duration::from_millis(10),
        ));
        let count = Arc::new(AtomicUsize::new(0));
        let running_inside = Arc::new(AtomicUsize::new(0));

        let (handle, counter, running) =
            (Arc::downgrade(&scheduler), Arc::clone(&count), Arc::clone(&running_inside));
        scheduler
            .start(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(scheduler) = handle.upgrade() {
                    if scheduler.is_running() {
                        running.fetch_add(1, Ordering::SeqCst);
                    }
                    scheduler.stop();
                }
            })
            .unwrap();

        let stopped = tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(stopped.is_ok());
        assert_eq!(running_inside.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let (scheduler, count) = counting_scheduler(10);
        let result = scheduler.start(counter_sweep(&count));

        assert!(matches!(result, Err(EnvError::NoRuntime(_))));
        assert!(!scheduler.is_running());
    }
}
