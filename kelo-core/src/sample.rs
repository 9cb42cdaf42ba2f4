//! Telemetry sample model, MQTT wire codec and synthetic generator.
//!
//! The wire field names (`nid`, `humidite`, `tension`, `horodatage`) are the
//! ones the deployed dashboards already consume.

use crate::cache::LatestCache;
use crate::error::TelemetryError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::sync::Arc;

pub const UNKNOWN_NODE: &str = "unknown";

pub const TEMPERATURE_RANGE: RangeInclusive<f64> = 20.0..=30.0;
pub const HUMIDITY_RANGE: RangeInclusive<u32> = 70..=90;
pub const VIBRATION_RANGE: RangeInclusive<f64> = 3.5..=4.2;
pub const VOLTAGE_RANGE: RangeInclusive<f64> = 0.0..=4.2;

/// One reading of a sensor node. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    #[serde(rename = "nid", default = "unknown_node")]
    pub node_id: String,
    pub temperature: f64,
    #[serde(rename = "humidite")]
    pub humidity: f64,
    pub vibration: f64,
    #[serde(rename = "tension")]
    pub voltage: f64,
    #[serde(rename = "horodatage")]
    pub timestamp: String,
}

fn unknown_node() -> String {
    UNKNOWN_NODE.to_string()
}

impl TelemetrySample {
    /// Decodes a broker payload (UTF-8 JSON). A missing `nid` becomes `"unknown"`.
    pub fn from_payload(payload: &[u8]) -> Result<Self, TelemetryError> {
        serde_json::from_slice(payload).map_err(TelemetryError::Decode)
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, TelemetryError> {
        serde_json::to_vec(self).map_err(TelemetryError::Encode)
    }
}

/// ISO-8601 UTC with microseconds and a trailing `Z`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Produces random samples for simulated nodes.
///
/// When built with [`SampleGenerator::with_snapshot`], every sample is also
/// stored in that cache so the simulator can answer local status queries.
pub struct SampleGenerator {
    rng: Mutex<StdRng>,
    snapshot: Option<Arc<LatestCache>>,
}

impl SampleGenerator {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
            snapshot: None,
        }
    }

    /// Deterministic generator for tests and replays.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            snapshot: None,
        }
    }

    pub fn with_snapshot(mut self, cache: Arc<LatestCache>) -> Self {
        self.snapshot = Some(cache);
        self
    }

    pub fn generate(&self, node_id: &str) -> TelemetrySample {
        self.generate_at(node_id, Utc::now())
    }

    pub fn generate_at(&self, node_id: &str, at: DateTime<Utc>) -> TelemetrySample {
        let sample = {
            let mut rng = self.rng.lock();
            TelemetrySample {
                node_id: node_id.to_string(),
                temperature: round2(rng.gen_range(TEMPERATURE_RANGE)),
                humidity: f64::from(rng.gen_range(HUMIDITY_RANGE)),
                vibration: round2(rng.gen_range(VIBRATION_RANGE)),
                voltage: round2(rng.gen_range(VOLTAGE_RANGE)),
                timestamp: format_timestamp(at),
            }
        };

        if let Some(cache) = &self.snapshot {
            cache.put(sample.clone());
        }
        sample
    }
}

impl Default for SampleGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn has_two_decimals(value: f64) -> bool {
        ((value * 100.0).round() - value * 100.0).abs() < 1e-6
    }

    #[test]
    fn test_generated_fields_stay_in_range() {
        let generator = SampleGenerator::seeded(7);
        for _ in 0..500 {
            let s = generator.generate("A12");
            assert_eq!(s.node_id, "A12");
            assert!(TEMPERATURE_RANGE.contains(&s.temperature), "temperature {}", s.temperature);
            assert!(VIBRATION_RANGE.contains(&s.vibration), "vibration {}", s.vibration);
            assert!(VOLTAGE_RANGE.contains(&s.voltage), "voltage {}", s.voltage);
            assert!((70.0..=90.0).contains(&s.humidity), "humidity {}", s.humidity);
            assert_eq!(s.humidity.fract(), 0.0);
            assert!(has_two_decimals(s.temperature));
            assert!(has_two_decimals(s.vibration));
            assert!(has_two_decimals(s.voltage));
        }
    }

    #[test]
    fn test_timestamp_is_utc_iso8601_with_z() {
        let s = SampleGenerator::seeded(1).generate("A12");
        assert!(s.timestamp.ends_with('Z'));
        let parsed = DateTime::parse_from_rfc3339(&s.timestamp).unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_generate_at_uses_given_instant() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let s = SampleGenerator::seeded(1).generate_at("B7", at);
        assert_eq!(s.timestamp, "2024-05-01T12:00:00.000000Z");
    }

    #[test]
    fn test_wire_field_names() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let s = SampleGenerator::seeded(3).generate_at("A12", at);
        let value: serde_json::Value = serde_json::from_slice(&s.to_payload().unwrap()).unwrap();
        for key in ["nid", "temperature", "humidite", "vibration", "tension", "horodatage"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["nid"], "A12");
    }

    #[test]
    fn test_decode_defaults_missing_nid() {
        let payload = br#"{"temperature":24.5,"humidite":80,"vibration":3.9,"tension":1.2,"horodatage":"2024-05-01T12:00:00Z"}"#;
        let s = TelemetrySample::from_payload(payload).unwrap();
        assert_eq!(s.node_id, UNKNOWN_NODE);
        assert_eq!(s.humidity, 80.0);
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        assert!(TelemetrySample::from_payload(b"{not json").is_err());
        assert!(TelemetrySample::from_payload(&[0xff, 0xfe, 0x00]).is_err());
        assert!(TelemetrySample::from_payload(br#"{"nid":"A12"}"#).is_err());
        assert!(TelemetrySample::from_payload(b"[1,2,3]").is_err());
    }

    #[test]
    fn test_snapshot_cache_receives_generated_sample() {
        let cache = Arc::new(LatestCache::new());
        let generator = SampleGenerator::seeded(9).with_snapshot(cache.clone());
        assert!(cache.get().is_none());
        let s = generator.generate("A12");
        assert_eq!(cache.get(), Some(s));
    }
}
