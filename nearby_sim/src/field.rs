//! Simulated radio field - the ground truth behind the scan producers.
//!
//! The RadioField holds every emitter in range of the simulated device:
//! - Address, source kind and advertised name
//! - Mean RSSI with Gaussian noise per reading
//! - Report period and presence window
//!
//! All randomness comes from a single ChaCha8 stream, so the same seed
//! always yields the same sequence of reports.

use nearby_core::{SourceKind, UNKNOWN_SIGNAL};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Weakest RSSI a simulated receiver reports.
const FLOOR_RSSI: i32 = -120;

/// A simulated BLE advertiser or Wi-Fi access point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Emitter {
    pub source_kind: SourceKind,

    /// MAC address or BSSID
    pub address: String,

    /// Advertised device name or SSID
    pub name: Option<String>,

    /// Mean received signal strength (dBm)
    pub mean_rssi: f64,

    /// Time between consecutive readings (ms), never zero
    period_ms: u64,

    /// First instant the emitter is in range (virtual ms)
    pub present_from_ms: u64,

    /// Instant the emitter leaves range for good, if ever
    pub present_until_ms: Option<u64>,

    /// Probability that a reading arrives without the name
    pub name_dropout: f64,

    #[serde(skip)]
    next_report_ms: u64,
}

impl Emitter {
    pub fn new(source_kind: SourceKind, address: &str, mean_rssi: f64, period_ms: u64) -> Self {
        Self {
            source_kind,
            address: address.to_string(),
            name: None,
            mean_rssi,
            period_ms: period_ms.max(1),
            present_from_ms: 0,
            present_until_ms: None,
            name_dropout: 0.0,
            next_report_ms: 0,
        }
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    /// Changes the reading period, clamped to at least 1 ms.
    pub fn set_period_ms(&mut self, period_ms: u64) {
        self.period_ms = period_ms.max(1);
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Restricts the emitter to `[from_ms, until_ms)`.
    pub fn present(mut self, from_ms: u64, until_ms: Option<u64>) -> Self {
        self.present_from_ms = from_ms;
        self.present_until_ms = until_ms;
        self
    }

    pub fn with_name_dropout(mut self, probability: f64) -> Self {
        self.name_dropout = probability.clamp(0.0, 1.0);
        self
    }

    /// Identity string the producer reports for this emitter.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.source_kind.tag(), self.address)
    }

    pub fn is_present(&self, t_ms: u64) -> bool {
        t_ms >= self.present_from_ms && !self.has_departed(t_ms)
    }

    pub fn has_departed(&self, t_ms: u64) -> bool {
        matches!(self.present_until_ms, Some(until) if t_ms >= until)
    }
}

/// One producer tuple, ready to hand to a `Reporter`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldReport {
    /// Index of the emitting emitter in the field
    pub emitter: usize,
    pub identity: String,
    pub display_name: Option<String>,
    pub signal_strength: i32,
    pub source_kind: SourceKind,

    /// Virtual time the reading was taken (ms)
    pub at_ms: u64,
}

/// The simulated radio environment.
pub struct RadioField {
    rng: ChaCha8Rng,
    emitters: Vec<Emitter>,

    /// Standard deviation of per-reading RSSI noise (dB)
    rssi_noise_std: f64,

    /// Probability that a reading carries no usable RSSI (0 dBm)
    unknown_rssi_probability: f64,
}

impl RadioField {
    /// Creates an empty field with 4 dB noise and a 2% unknown-RSSI rate.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            emitters: Vec::new(),
            rssi_noise_std: 4.0,
            unknown_rssi_probability: 0.02,
        }
    }

    pub fn with_noise(mut self, std_db: f64) -> Self {
        self.rssi_noise_std = std_db.max(0.0);
        self
    }

    pub fn with_unknown_rssi_probability(mut self, probability: f64) -> Self {
        self.unknown_rssi_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Adds an emitter with a random phase inside its first period.
    pub fn add_emitter(&mut self, mut emitter: Emitter) -> usize {
        // Deserialized emitters bypass the constructor clamp
        emitter.period_ms = emitter.period_ms.max(1);
        let phase = self.rng.gen_range(0..emitter.period_ms);
        emitter.next_report_ms = emitter.present_from_ms + phase;
        self.emitters.push(emitter);
        self.emitters.len() - 1
    }

    /// Adds an emitter with a random address, mean RSSI and period.
    pub fn spawn_random(
        &mut self,
        source_kind: SourceKind,
        name: Option<&str>,
        period_range_ms: (u64, u64),
    ) -> usize {
        let address = self.random_address();
        let mean_rssi = self.rng.gen_range(-95.0..-35.0);
        let (low, high) = period_range_ms;
        let period_ms = self.rng.gen_range(low.max(1)..=high.max(low.max(1)));

        let mut emitter = Emitter::new(source_kind, &address, mean_rssi, period_ms);
        if let Some(name) = name {
            emitter = emitter.named(name);
        }
        self.add_emitter(emitter)
    }

    /// Random colon-separated hardware address.
    pub fn random_address(&mut self) -> String {
        let bytes: [u8; 6] = self.rng.gen();
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Shared access to the scenario's RNG stream.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    pub fn emitters(&self) -> &[Emitter] {
        &self.emitters
    }

    pub fn emitter_mut(&mut self, index: usize) -> Option<&mut Emitter> {
        self.emitters.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.emitters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emitters.is_empty()
    }

    /// Returns every reading due at or before `t_ms`, in emitter order.
    ///
    /// Readings are taken on each emitter's own period; readings that fall
    /// outside the presence window are skipped.
    pub fn reports_at(&mut self, t_ms: u64) -> Vec<FieldReport> {
        let noise = Normal::new(0.0, self.rssi_noise_std).ok();
        let unknown_probability = self.unknown_rssi_probability;
        let Self { rng, emitters, .. } = self;

        let mut reports = Vec::new();
        for (index, emitter) in emitters.iter_mut().enumerate() {
            while emitter.next_report_ms <= t_ms {
                let at_ms = emitter.next_report_ms;
                emitter.next_report_ms += emitter.period_ms;
                if !emitter.is_present(at_ms) {
                    continue;
                }

                let jitter = noise.as_ref().map(|n| n.sample(&mut *rng)).unwrap_or(0.0);
                let signal_strength = if rng.gen_bool(unknown_probability) {
                    UNKNOWN_SIGNAL
                } else {
                    ((emitter.mean_rssi + jitter).round() as i32).clamp(FLOOR_RSSI, -1)
                };
                let display_name = match &emitter.name {
                    Some(_) if rng.gen_bool(emitter.name_dropout) => None,
                    name => name.clone(),
                };

                reports.push(FieldReport {
                    emitter: index,
                    identity: emitter.identity(),
                    display_name,
                    signal_strength,
                    source_kind: emitter.source_kind,
                    at_ms,
                });
            }
        }
        reports
    }
}
