//! Distance Estimator - log-distance path-loss inversion.
//!
//! ```text
//! d = 10 ^ ((RSSI_1m - RSSI) / (10 * n))
//! ```
//!
//! Deliberately approximate: the result is a "rough estimate" for display
//! only. No clamping is applied, extreme inputs give extreme distances.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::sighting::UNKNOWN_SIGNAL;

/// Expected RSSI at one meter (dBm).
pub const DEFAULT_REFERENCE_RSSI: i32 = -59;

/// Environmental path-loss exponent (2.0 = free space).
pub const DEFAULT_PATH_LOSS_EXPONENT: f64 = 2.7;

/// Parameters of the log-distance path-loss model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathLossModel {
    /// RSSI measured at 1m (default: -59 dBm)
    pub reference_rssi: i32,

    /// Path-loss exponent (default: 2.7)
    pub exponent: f64,
}

impl Default for PathLossModel {
    fn default() -> Self {
        Self {
            reference_rssi: DEFAULT_REFERENCE_RSSI,
            exponent: DEFAULT_PATH_LOSS_EXPONENT,
        }
    }
}

impl PathLossModel {
    /// Creates a model with explicit parameters.
    pub fn new(reference_rssi: i32, exponent: f64) -> Self {
        Self {
            reference_rssi,
            exponent,
        }
    }

    /// Estimates distance for an RSSI reading.
    ///
    /// The 0 dBm sentinel yields `DistanceEstimate::Unknown`.
    pub fn estimate(&self, signal_strength: i32) -> DistanceEstimate {
        if signal_strength == UNKNOWN_SIGNAL {
            return DistanceEstimate::Unknown;
        }
        let exponent = (f64::from(self.reference_rssi) - f64::from(signal_strength))
            / (10.0 * self.exponent);
        DistanceEstimate::Meters(10f64.powf(exponent))
    }
}

/// Result of a distance estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DistanceEstimate {
    /// The reading was the unknown sentinel; never render as a number
    Unknown,
    /// Rough distance in meters
    Meters(f64),
}

impl DistanceEstimate {
    /// Returns the distance in meters, if known.
    pub fn meters(&self) -> Option<f64> {
        match self {
            DistanceEstimate::Unknown => None,
            DistanceEstimate::Meters(m) => Some(*m),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, DistanceEstimate::Unknown)
    }
}

impl fmt::Display for DistanceEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceEstimate::Unknown => f.write_str("?"),
            DistanceEstimate::Meters(m) => write!(f, "~{:.1} m", m),
        }
    }
}

/// Estimates distance with the default reference (-59 dBm) and exponent (2.7).
pub fn estimate_distance(signal_strength: i32) -> DistanceEstimate {
    PathLossModel::default().estimate(signal_strength)
}
