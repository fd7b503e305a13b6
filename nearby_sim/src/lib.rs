//! Nearby Deterministic Simulation Testing (DST) Harness
//!
//! Runs a real `AggregationCore` against a simulated radio field where every
//! source of non-determinism is controlled:
//! - **Time**: Virtual clock that only moves when the runner advances it
//! - **Producers**: Emitters with seeded RSSI noise, periods and presence windows
//! - **Delivery**: Shuffling, delays and thread interleaving drawn from the seed
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                    ScenarioRunner                     │
//! │  ┌────────────┐   readings   ┌─────────────────────┐  │
//! │  │ RadioField ├─────────────►│ Reporter x N        │  │
//! │  └────────────┘              └──────────┬──────────┘  │
//! │                                         ▼             │
//! │  ┌────────────┐   sleep      ┌─────────────────────┐  │
//! │  │ SimContext │◄─────────────┤ AggregationCore     │  │
//! │  │ (clock)    │              │  registry/publisher │  │
//! │  └────────────┘              │  expiry scheduler   │  │
//! │                              └──────────┬──────────┘  │
//! │                            snapshots    ▼             │
//! │                              invariant checks         │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use nearby_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::Churn);
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod field;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use exporter::{FrameSighting, SimEvent, SimExport, SimFrame};
pub use field::{Emitter, FieldReport, RadioField};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
