//! The Snapshot Publisher - ordered, immutable views of the registry.
//!
//! Two ways to consume:
//! - **Pull**: `current()` returns the latest published `Arc<Snapshot>`
//! - **Push**: synchronous listeners (`subscribe`) or an async latest-value
//!   stream (`watch`) backed by `tokio::sync::watch`
//!
//! # Ordering
//!
//! The snapshot is recomputed, versioned and stored under the publish gate.
//! Listeners never run under that gate. Delivery is latest-wins: whichever
//! publisher finds the delivery slot free hands listeners the newest stored
//! snapshot, then re-checks until nothing newer is left. Publishers that
//! find the slot busy return at once. Each listener therefore sees strictly
//! increasing versions and always sees the final one, though a burst of
//! concurrent publications may be collapsed. Listeners may call back into
//! the core, including publishing.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tokio::sync::watch;
use tracing::debug;

use crate::registry::ObservationRegistry;
use crate::sighting::{Identity, Sighting};

/// Callback invoked with each newly published snapshot.
pub type Listener = Arc<dyn Fn(&Arc<Snapshot>) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// One published, immutable view of the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    /// Publication counter; 0 is the initial empty snapshot
    version: u64,

    /// Sightings ordered by signal strength, descending
    sightings: Vec<Sighting>,
}

impl Snapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn sightings(&self) -> &[Sighting] {
        &self.sightings
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sighting> {
        self.sightings.iter()
    }

    pub fn len(&self) -> usize {
        self.sightings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sightings.is_empty()
    }

    /// Looks up a sighting by identity (linear scan).
    pub fn get(&self, identity: &Identity) -> Option<&Sighting> {
        self.sightings.iter().find(|s| &s.identity == identity)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.get(identity).is_some()
    }
}

/// Async subscription handle yielding the newest snapshot on change.
///
/// Intermediate versions may be skipped by a slow consumer.
pub struct SnapshotStream {
    rx: watch::Receiver<Arc<Snapshot>>,
}

impl SnapshotStream {
    /// Returns the latest snapshot without waiting.
    pub fn current(&self) -> Arc<Snapshot> {
        self.rx.borrow().clone()
    }

    /// Waits for a publication newer than the last one seen.
    ///
    /// Returns `None` once the publisher has been dropped.
    pub async fn changed(&mut self) -> Option<Arc<Snapshot>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// True if a publication happened since the last `changed()`.
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }
}

/// Maintains the current snapshot and fans it out to subscribers.
pub struct SnapshotPublisher {
    /// Current value holder
    current: watch::Sender<Arc<Snapshot>>,

    /// Serializes publications; holds the last issued version
    gate: Mutex<u64>,

    /// Held by the thread currently notifying listeners
    delivery: Mutex<()>,

    /// Last version handed to listeners
    delivered: AtomicU64,

    /// Registered change listeners
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,

    next_subscription: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking listener must not wedge publication
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SnapshotPublisher {
    /// Creates a publisher holding an empty version-0 snapshot.
    pub fn new() -> Self {
        let (current, _) = watch::channel(Arc::new(Snapshot::default()));
        Self {
            current,
            gate: Mutex::new(0),
            delivery: Mutex::new(()),
            delivered: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        }
    }

    /// Returns the most recently published snapshot.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.borrow().clone()
    }

    /// Recomputes the ordered view from `registry` and publishes it.
    ///
    /// Listeners run outside the publish gate, on this thread or on a
    /// concurrent publisher's thread. A slow listener delays only the thread
    /// that is delivering, never `current()` or other writers.
    pub fn publish(&self, registry: &ObservationRegistry) -> Arc<Snapshot> {
        let snapshot = {
            let mut version = lock(&self.gate);
            *version += 1;

            let snapshot = Arc::new(Snapshot {
                version: *version,
                sightings: registry.snapshot(),
            });
            self.current.send_replace(Arc::clone(&snapshot));
            snapshot
        };
        debug!(version = snapshot.version, entries = snapshot.len(), "published snapshot");

        self.deliver();
        snapshot
    }

    /// Hands the newest snapshot to listeners until none is pending.
    fn deliver(&self) {
        loop {
            let slot = match self.delivery.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                // The holder re-checks for newer versions before leaving
                Err(TryLockError::WouldBlock) => return,
            };

            loop {
                let latest = self.current();
                if latest.version <= self.delivered.load(Ordering::SeqCst) {
                    break;
                }
                self.delivered.store(latest.version, Ordering::SeqCst);

                let listeners: Vec<Listener> = lock(&self.listeners)
                    .iter()
                    .map(|(_, listener)| Arc::clone(listener))
                    .collect();
                for listener in &listeners {
                    listener(&latest);
                }
            }
            drop(slot);

            // A publisher may have bounced off the slot after the last check
            if self.current().version <= self.delivered.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    /// Registers a change listener.
    pub fn subscribe<F>(&self, on_change: F) -> SubscriptionId
    where
        F: Fn(&Arc<Snapshot>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, Arc::new(on_change)));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Opens an async latest-value stream.
    pub fn watch(&self) -> SnapshotStream {
        SnapshotStream {
            rx: self.current.subscribe(),
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sighting::SourceKind;
    use std::time::{Duration, Instant};

    fn sighting(id: &str, rssi: i32) -> Sighting {
        Sighting::new(Identity::new(id).unwrap(), None, rssi, SourceKind::Wifi, 0)
    }

    #[test]
    fn test_initial_snapshot_is_empty() {
        let publisher = SnapshotPublisher::new();
        let snapshot = publisher.current();
        assert_eq!(snapshot.version(), 0);
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_publish_reflects_registry_in_order() {
        let registry = ObservationRegistry::new();
        let publisher = SnapshotPublisher::new();
        registry.upsert(sighting("B", -80));
        registry.upsert(sighting("A", -30));

        let published = publisher.publish(&registry);

        assert_eq!(published.version(), 1);
        assert_eq!(publisher.current(), published);
        assert_eq!(published.sightings()[0].identity.as_str(), "A");
        assert!(published.contains(&Identity::new("B").unwrap()));
    }

    #[test]
    fn test_published_snapshot_is_immutable() {
        let registry = ObservationRegistry::new();
        let publisher = SnapshotPublisher::new();
        registry.upsert(sighting("A", -30));
        let first = publisher.publish(&registry);

        registry.upsert(sighting("B", -40));
        publisher.publish(&registry);

        assert_eq!(first.len(), 1);
        assert_eq!(publisher.current().len(), 2);
    }

    #[test]
    fn test_listeners_see_every_version_in_order() {
        let registry = ObservationRegistry::new();
        let publisher = SnapshotPublisher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        publisher.subscribe(move |snapshot| sink.lock().unwrap().push(snapshot.version()));

        for i in 0..5 {
            registry.upsert(sighting(&format!("WIFI:{}", i), -50));
            publisher.publish(&registry);
        }

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_listener_may_publish() {
        let registry = Arc::new(ObservationRegistry::new());
        let publisher = Arc::new(SnapshotPublisher::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (sink, p, r) = (Arc::clone(&seen), Arc::downgrade(&publisher), Arc::clone(&registry));
        publisher.subscribe(move |snapshot| {
            sink.lock().unwrap().push(snapshot.version());
            if snapshot.version() == 1 {
                if let Some(p) = p.upgrade() {
                    r.upsert(sighting("ECHO", -40));
                    p.publish(&r);
                }
            }
        });

        assert_eq!(publisher.publish(&registry).version(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(publisher.current().len(), 1);
    }

    #[test]
    fn test_slow_listener_does_not_block_publication() {
        let registry = Arc::new(ObservationRegistry::new());
        let publisher = Arc::new(SnapshotPublisher::new());
        let entered = Arc::new(AtomicU64::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (flag, sink) = (Arc::clone(&entered), Arc::clone(&seen));
        publisher.subscribe(move |snapshot| {
            if snapshot.version() == 1 {
                flag.store(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(300));
            }
            sink.lock().unwrap().push(snapshot.version());
        });

        let (p, r) = (Arc::clone(&publisher), Arc::clone(&registry));
        let slow = std::thread::spawn(move || {
            p.publish(&r);
        });
        while entered.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        let started = Instant::now();
        registry.upsert(sighting("A", -30));
        assert_eq!(publisher.publish(&registry).version(), 2);
        assert_eq!(publisher.current().version(), 2);
        assert!(started.elapsed() < Duration::from_millis(200));

        slow.join().unwrap();
        // The delivering thread picked up the newer version before leaving
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_unsubscribe() {
        let registry = ObservationRegistry::new();
        let publisher = SnapshotPublisher::new();
        let hits = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&hits);
        let id = publisher.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(publisher.listener_count(), 1);

        publisher.publish(&registry);
        assert!(publisher.unsubscribe(id));
        assert!(!publisher.unsubscribe(id));
        publisher.publish(&registry);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.listener_count(), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_wedge_publisher() {
        let registry = ObservationRegistry::new();
        let publisher = Arc::new(SnapshotPublisher::new());
        publisher.subscribe(|snapshot| {
            if snapshot.version() == 1 {
                panic!("listener failure");
            }
        });

        let p = Arc::clone(&publisher);
        let r = Arc::new(registry);
        let r2 = Arc::clone(&r);
        let result = std::thread::spawn(move || {
            p.publish(&r2);
        })
        .join();
        assert!(result.is_err());

        assert_eq!(publisher.publish(&r).version(), 2);
    }

    #[tokio::test]
    async fn test_watch_stream_receives_latest() {
        let registry = ObservationRegistry::new();
        let publisher = SnapshotPublisher::new();
        let mut stream = publisher.watch();
        assert_eq!(stream.current().version(), 0);
        assert!(!stream.has_changed());

        registry.upsert(sighting("A", -30));
        publisher.publish(&registry);
        publisher.publish(&registry);

        // Latest-value semantics: intermediate version 1 is skipped
        assert!(stream.has_changed());
        let latest = stream.changed().await.unwrap();
        assert_eq!(latest.version(), 2);
        assert!(!stream.has_changed());
    }

    #[tokio::test]
    async fn test_watch_stream_ends_when_publisher_dropped() {
        let publisher = SnapshotPublisher::new();
        let mut stream = publisher.watch();
        drop(publisher);
        assert!(stream.changed().await.is_none());
    }
}
