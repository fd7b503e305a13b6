//! The Observation Registry - latest sighting per identity.
//!
//! Backed by a sharded concurrent map so producers, the expiry sweep and
//! snapshot readers never need to hold a caller-visible lock.
//!
//! # Eviction Safety
//!
//! A sweep first collects *candidate* identities, then removes each one with
//! `remove_if`, which re-evaluates the staleness predicate under the shard's
//! write lock. An upsert that lands between the two phases refreshes
//! `last_seen`, the re-check fails, and the entry survives:
//!
//! ```text
//! sweep                          producer
//!   |-- scan: X is stale            |
//!   |                               |-- upsert(X, t=now)
//!   |-- remove_if(X, stale?) -> no  |
//! ```

use dashmap::DashMap;
use std::cmp::Ordering;
use std::time::Duration;
use tracing::trace;

use crate::sighting::{Identity, Sighting};

/// Outcome of one eviction sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Entries inspected during the scan phase
    pub examined: usize,

    /// Identities actually removed
    pub removed: Vec<Identity>,
}

impl EvictionReport {
    /// True if at least one entry was removed.
    pub fn any_removed(&self) -> bool {
        !self.removed.is_empty()
    }

    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }
}

/// Published ordering: strongest signal first, identity breaks ties.
pub fn by_signal_strength(a: &Sighting, b: &Sighting) -> Ordering {
    b.signal_strength
        .cmp(&a.signal_strength)
        .then_with(|| a.identity.cmp(&b.identity))
}

/// Concurrent key-value store of the latest sighting per identity.
#[derive(Debug, Default)]
pub struct ObservationRegistry {
    entries: DashMap<Identity, Sighting>,
}

impl ObservationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Creates an empty registry sized for `capacity` identities.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity),
        }
    }

    /// Inserts or wholly replaces the entry for `sighting.identity`.
    ///
    /// Last writer wins by arrival order; `last_seen` is not compared.
    /// Returns the replaced sighting, if any.
    pub fn upsert(&self, sighting: Sighting) -> Option<Sighting> {
        trace!(identity = %sighting.identity, rssi = sighting.signal_strength, "upsert");
        self.entries.insert(sighting.identity.clone(), sighting)
    }

    /// Removes every entry with `now_ms - last_seen > timeout`.
    pub fn evict_older_than(&self, timeout: Duration, now_ms: u64) -> EvictionReport {
        let mut examined = 0;
        let candidates: Vec<Identity> = self
            .entries
            .iter()
            .inspect(|_| examined += 1)
            .filter(|entry| entry.value().is_older_than(timeout, now_ms))
            .map(|entry| entry.key().clone())
            .collect();

        // Re-check per entry under the shard lock; refreshed entries stay
        let removed = candidates
            .into_iter()
            .filter_map(|id| {
                self.entries
                    .remove_if(&id, |_, sighting| sighting.is_older_than(timeout, now_ms))
                    .map(|(id, _)| id)
            })
            .collect();

        EvictionReport { examined, removed }
    }

    /// Returns the current sightings ordered by signal strength, descending.
    ///
    /// Single pass over the shards; not atomic across the whole map.
    pub fn snapshot(&self) -> Vec<Sighting> {
        let mut sightings: Vec<Sighting> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sightings.sort_by(by_signal_strength);
        sightings
    }

    /// Returns a copy of the entry for `identity`.
    pub fn get(&self, identity: &Identity) -> Option<Sighting> {
        self.entries.get(identity).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry (registry teardown).
    pub fn clear(&self) {
        self.entries.clear();
    }
}
