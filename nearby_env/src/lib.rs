//! Nearby Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the aggregation core
//! run in both **Production** (tokio, real clocks) and **Simulation**
//! (virtual clock driven by a test harness).
//!
//! # Core Concept
//!
//! The aggregation core touches the outside world in exactly two ways:
//! - Time (`now()`, `system_time()`, `sleep()`) for stamping and expiring sightings
//! - Background work (`spawn()`) for the periodic expiry sweep
//!
//! Everything else is pure in-memory state, so swapping the context is
//! enough to make a whole session deterministic.
//!
//! # Example
//!
//! ```ignore
//! use nearby_env::{NearbyContext, TokioContext};
//!
//! async fn sweep_loop<Ctx: NearbyContext>(ctx: &Ctx) {
//!     loop {
//!         ctx.sleep(Duration::from_secs(10)).await;
//!         evict_older_than(ctx.timestamp_ms());
//!     }
//! }
//! ```

mod context;
mod error;
mod tokio_impl;

pub use context::NearbyContext;
pub use error::EnvError;
pub use tokio_impl::TokioContext;
