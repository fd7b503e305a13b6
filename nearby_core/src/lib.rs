//! Nearby Core - Observation Aggregation for ambient radio sightings
//!
//! Merges asynchronously arriving BLE advertisements and Wi-Fi scan results
//! into one deduplicated, freshness-bounded view of "devices currently nearby":
//! 1. **Registry**: latest sighting per identity, safe for concurrent writers
//! 2. **Publisher**: ordered immutable snapshots, pushed to any number of observers
//! 3. **Expiry**: periodic eviction of identities that went quiet
//! 4. **Distance**: rough log-distance estimate from RSSI, for display

pub mod aggregator;
pub mod distance;
pub mod publisher;
pub mod registry;
pub mod scheduler;
pub mod sighting;

// Re-export key types for convenience
pub use aggregator::{AggregationCore, AggregatorConfig, Reporter, SessionError, SessionState};
pub use distance::{estimate_distance, DistanceEstimate, PathLossModel};
pub use publisher::{Snapshot, SnapshotPublisher, SnapshotStream, SubscriptionId};
pub use registry::{EvictionReport, ObservationRegistry};
pub use scheduler::ExpiryScheduler;
pub use sighting::{Identity, Sighting, SightingError, SourceKind, UNKNOWN_SIGNAL};
