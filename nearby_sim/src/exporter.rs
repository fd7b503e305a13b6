//! JSON exporter for simulation runs.
//!
//! Exports periodic snapshot frames so a run can be replayed or plotted
//! outside the harness.

use nearby_core::{PathLossModel, Snapshot, SourceKind};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    /// Version of the captured snapshot
    pub version: u64,

    /// Snapshot contents in published order
    pub sightings: Vec<FrameSighting>,

    /// Events since the previous frame (evictions, check failures)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimEvent>,
}

impl SimFrame {
    /// Captures a published snapshot at the given instant.
    pub fn capture(time_sec: f64, snapshot: &Snapshot, now_ms: u64, model: &PathLossModel) -> Self {
        let sightings = snapshot
            .iter()
            .map(|s| FrameSighting {
                identity: s.identity.to_string(),
                name: s.display_name.clone(),
                rssi: s.signal_strength,
                source: s.source_kind,
                age_ms: s.age_ms(now_ms),
                distance: s.estimated_distance(model).to_string(),
            })
            .collect();

        Self {
            time_sec,
            version: snapshot.version(),
            sightings,
            events: Vec::new(),
        }
    }

    pub fn with_event(mut self, event: SimEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// One row of a captured snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameSighting {
    pub identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub rssi: i32,
    pub source: SourceKind,
    pub age_ms: u64,

    /// Rendered estimate, "?" when unknown
    pub distance: String,
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: Some("error".to_string()),
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = self.to_json()?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearby_core::{Identity, ObservationRegistry, Sighting, SnapshotPublisher};

    fn sample_snapshot() -> std::sync::Arc<Snapshot> {
        let registry = ObservationRegistry::new();
        registry.upsert(Sighting::new(
            Identity::new("BLE:AA").unwrap(),
            Some("Phone".to_string()),
            -59,
            SourceKind::Ble,
            1_000,
        ));
        registry.upsert(Sighting::new(
            Identity::new("WIFI:BB").unwrap(),
            None,
            0,
            SourceKind::Wifi,
            1_500,
        ));
        SnapshotPublisher::new().publish(&registry)
    }

    #[test]
    fn test_capture_renders_distance() {
        let frame = SimFrame::capture(2.0, &sample_snapshot(), 2_000, &PathLossModel::default());

        assert_eq!(frame.version, 1);
        assert_eq!(frame.sightings.len(), 2);
        // 0 dBm sorts first and has no estimate
        assert_eq!(frame.sightings[0].identity, "WIFI:BB");
        assert_eq!(frame.sightings[0].distance, "?");
        assert_eq!(frame.sightings[1].distance, "~1.0 m");
        assert_eq!(frame.sightings[1].age_ms, 1_000);
    }

    #[test]
    fn test_export_json_shape() {
        let mut export = SimExport::new("steady", 42);
        export.add_frame(
            SimFrame::capture(1.5, &sample_snapshot(), 1_500, &PathLossModel::default())
                .with_event(SimEvent::info("evicted 1")),
        );
        export.finalize(true, None);

        let value: serde_json::Value = serde_json::from_str(&export.to_json().unwrap()).unwrap();
        assert_eq!(value["scenario"], "steady");
        assert_eq!(value["duration_sec"], 1.5);
        assert_eq!(value["frames"][0]["sightings"][1]["source"], "BLE");
        assert_eq!(value["frames"][0]["sightings"][1]["name"], "Phone");
        assert!(value.get("failure_reason").is_none());
    }

    #[test]
    fn test_write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let export = SimExport::new("crowd", 7);

        export.write_to_file(path.to_str().unwrap()).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"crowd\""));
    }
}
