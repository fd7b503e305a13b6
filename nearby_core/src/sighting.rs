//! The Sighting data model - one recorded observation per radio identity.
//!
//! Identities are composed from a source tag and a hardware/broadcast
//! address (`"BLE:AA:BB:CC:DD:EE:FF"`, `"WIFI:<bssid>"`) and act as the merge
//! key of the registry. A sighting carries the *latest* raw reading only.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::distance::{DistanceEstimate, PathLossModel};

/// RSSI value reserved to mean "unknown / invalid reading".
pub const UNKNOWN_SIGNAL: i32 = 0;

// ============================================================================
// ERRORS
// ============================================================================

/// Errors raised while constructing sighting values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SightingError {
    #[error("Identity must not be empty")]
    EmptyIdentity,

    #[error("Address must not be empty for {0} identities")]
    EmptyAddress(SourceKind),

    #[error("Unknown source kind: {0}")]
    UnknownSourceKind(String),
}

// ============================================================================
// SOURCE KIND
// ============================================================================

/// Which scan subsystem produced a sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceKind {
    /// Bluetooth Low Energy advertisement
    Ble,
    /// Wi-Fi access-point scan result
    Wifi,
}

impl SourceKind {
    /// Returns the textual tag used as the identity prefix.
    pub fn tag(&self) -> &'static str {
        match self {
            SourceKind::Ble => "BLE",
            SourceKind::Wifi => "WIFI",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for SourceKind {
    type Err = SightingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BLE" => Ok(SourceKind::Ble),
            "WIFI" | "WI-FI" => Ok(SourceKind::Wifi),
            _ => Err(SightingError::UnknownSourceKind(s.to_string())),
        }
    }
}

// ============================================================================
// IDENTITY
// ============================================================================

/// Stable key distinguishing one physical radio source within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Wraps a raw identity string. The only constraint is non-emptiness.
    pub fn new(raw: impl Into<String>) -> Result<Self, SightingError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(SightingError::EmptyIdentity);
        }
        Ok(Self(raw))
    }

    /// Composes `"<TAG>:<address>"` for the given source.
    pub fn for_source(kind: SourceKind, address: &str) -> Result<Self, SightingError> {
        if address.is_empty() {
            return Err(SightingError::EmptyAddress(kind));
        }
        Ok(Self(format!("{}:{}", kind.tag(), address)))
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recovers the source tag prefix, if the identity carries one.
    pub fn source_kind(&self) -> Option<SourceKind> {
        let (tag, _) = self.0.split_once(':')?;
        tag.parse().ok()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = SightingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// SIGHTING
// ============================================================================

/// The latest known attributes of one identity.
///
/// A newer sighting for the same identity replaces this one wholesale,
/// including `display_name`: a nameless observation erases a known name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
    /// Merge key
    pub identity: Identity,

    /// Human-readable name, absent when the source provides none
    pub display_name: Option<String>,

    /// RSSI in dBm; `UNKNOWN_SIGNAL` (0) means unknown
    pub signal_strength: i32,

    /// Producing scan subsystem
    pub source_kind: SourceKind,

    /// Milliseconds since the UNIX epoch of the most recent update
    pub last_seen: u64,
}

impl Sighting {
    /// Creates a sighting. Blank display names are stored as absent.
    pub fn new(
        identity: Identity,
        display_name: Option<String>,
        signal_strength: i32,
        source_kind: SourceKind,
        last_seen: u64,
    ) -> Self {
        Self {
            identity,
            display_name: display_name.filter(|name| !name.trim().is_empty()),
            signal_strength,
            source_kind,
            last_seen,
        }
    }

    /// False for the 0 dBm "unknown" sentinel.
    #[inline]
    pub fn has_known_signal(&self) -> bool {
        self.signal_strength != UNKNOWN_SIGNAL
    }

    /// Milliseconds elapsed since `last_seen`. Future timestamps read as 0.
    #[inline]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_seen)
    }

    /// True when `now - last_seen` strictly exceeds `timeout`.
    #[inline]
    pub fn is_older_than(&self, timeout: Duration, now_ms: u64) -> bool {
        u128::from(self.age_ms(now_ms)) > timeout.as_millis()
    }

    /// Rough distance derived from the stored RSSI.
    pub fn estimated_distance(&self, model: &PathLossModel) -> DistanceEstimate {
        model.estimate(self.signal_strength)
    }
}
