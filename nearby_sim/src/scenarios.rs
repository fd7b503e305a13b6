//! Simulation scenarios for the aggregation core.

use crate::field::{Emitter, RadioField};
use nearby_core::SourceKind;
use rand::Rng;
use std::fmt;
use std::str::FromStr;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// A handful of emitters that never leave; nothing may be evicted
    Steady,

    /// Emitters arrive and leave; departed ones must disappear in bounded time
    Churn,

    /// Names come and go between readings; the newest reading always wins
    NameFlicker,

    /// Readings delivered shuffled and late; last delivered wins
    Reorder,

    /// Hundreds of emitters reported from several producer threads at once
    Crowd,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Steady,
            ScenarioId::Churn,
            ScenarioId::NameFlicker,
            ScenarioId::Reorder,
            ScenarioId::Crowd,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Steady => "steady",
            ScenarioId::Churn => "churn",
            ScenarioId::NameFlicker => "name_flicker",
            ScenarioId::Reorder => "reorder",
            ScenarioId::Crowd => "crowd",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Steady => "6 named emitters always in range, zero evictions expected",
            ScenarioId::Churn => "30 emitters with short presence windows, departures must expire",
            ScenarioId::NameFlicker => "8 BLE tags dropping their name 40% of the time",
            ScenarioId::Reorder => "12 fast emitters, batches shuffled and held back up to 3 ticks",
            ScenarioId::Crowd => "200 emitters reported by 4 concurrent producer threads",
        }
    }

    /// Number of concurrent producer threads the runner uses.
    pub fn producers(&self) -> usize {
        match self {
            ScenarioId::Crowd => 4,
            _ => 1,
        }
    }

    /// Whether deliveries are shuffled and delayed.
    pub fn reorders(&self) -> bool {
        matches!(self, ScenarioId::Reorder)
    }

    /// Populates a radio field for this scenario.
    pub fn build_field(&self, seed: u64, duration_ms: u64) -> RadioField {
        let mut field = RadioField::new(seed);

        match self {
            ScenarioId::Steady => {
                for name in ["Pixel 8", "Galaxy Buds", "Tile"] {
                    field.spawn_random(SourceKind::Ble, Some(name), (1_000, 5_000));
                }
                for ssid in ["HomeNet", "CoffeeShop", "eduroam"] {
                    field.spawn_random(SourceKind::Wifi, Some(ssid), (2_000, 5_000));
                }
            }
            ScenarioId::Churn => {
                let latest_arrival = (duration_ms / 3).max(1);
                for i in 0..30 {
                    let kind = if i % 3 == 0 { SourceKind::Wifi } else { SourceKind::Ble };
                    let address = field.random_address();
                    let rng = field.rng();
                    let mean_rssi = rng.gen_range(-95.0..-40.0);
                    let period_ms = rng.gen_range(500..=3_000);
                    let from_ms = rng.gen_range(0..latest_arrival);
                    let stay_ms = rng.gen_range(5_000..=30_000);

                    field.add_emitter(
                        Emitter::new(kind, &address, mean_rssi, period_ms)
                            .present(from_ms, Some(from_ms + stay_ms)),
                    );
                }
            }
            ScenarioId::NameFlicker => {
                for i in 0..8 {
                    let address = field.random_address();
                    let mean_rssi = field.rng().gen_range(-85.0..-45.0);
                    field.add_emitter(
                        Emitter::new(SourceKind::Ble, &address, mean_rssi, 1_000)
                            .named(&format!("Tag-{}", i))
                            .with_name_dropout(0.4),
                    );
                }
            }
            ScenarioId::Reorder => {
                for i in 0..12 {
                    let kind = if i % 2 == 0 { SourceKind::Ble } else { SourceKind::Wifi };
                    field.spawn_random(kind, None, (100, 300));
                }
            }
            ScenarioId::Crowd => {
                for i in 0..200 {
                    let kind = if i % 4 == 0 { SourceKind::Wifi } else { SourceKind::Ble };
                    field.spawn_random(kind, None, (500, 3_000));
                }
            }
        }

        field
    }
}

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "steady" => Ok(ScenarioId::Steady),
            "churn" => Ok(ScenarioId::Churn),
            "name_flicker" | "flicker" => Ok(ScenarioId::NameFlicker),
            "reorder" => Ok(ScenarioId::Reorder),
            "crowd" => Ok(ScenarioId::Crowd),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
