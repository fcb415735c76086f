use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Schema version this core understands.
pub const EXPECTED_SCHEMA_VERSION: u32 = 1;

/// Fractional digits used for every float in the canonical encoding.
pub const CANONICAL_FLOAT_DIGITS: usize = 8;

/// Metrics block of a telemetry snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMetrics {
    /// Precision on the evaluation split.
    pub precision: f64,
    /// Recall on the evaluation split.
    pub recall: f64,
    /// KL divergence against the reference distribution.
    pub kl_divergence: f64,
    /// Expected calibration error.
    pub ece: f64,
    /// Training loss.
    pub loss: f64,
    /// Hottest GPU reading, in degrees Celsius.
    pub gpu_temperature: f64,
}

/// Snapshot published by the external training loop.
///
/// Field names are shared with the producer and must stay stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Producer schema version.
    pub schema_version: u32,
    /// Whether the determinism validator passed for this run.
    pub determinism_status: bool,
    /// Whether the checkpoint is certified frozen.
    pub freeze_status: bool,
    /// Metrics block.
    pub metrics: TelemetryMetrics,
    /// Training epoch.
    pub epoch: u64,
    /// Batch size.
    pub batch_size: u64,
    /// Producer wall-clock time, seconds since the Unix epoch.
    pub wall_timestamp: f64,
    /// Producer monotonic clock reading, seconds.
    pub monotonic_timestamp: f64,
    /// Hex SHA-256 over [`TelemetrySnapshot::canonical_encoding`].
    pub integrity_checksum: String,
    /// Hex HMAC-SHA256 over [`signature_payload`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

fn float(value: f64) -> String {
    format!("{value:.prec$}", prec = CANONICAL_FLOAT_DIGITS)
}

impl TelemetrySnapshot {
    /// Canonical encoding of the numeric and boolean fields.
    ///
    /// `key:value` pairs joined by `|` in a fixed order; floats carry exactly
    /// eight fractional digits. Both old and new producers hash this exact
    /// byte string.
    #[must_use]
    pub fn canonical_encoding(&self) -> String {
        let m = &self.metrics;
        let fields: [(&str, String); 13] = [
            ("schema_version", self.schema_version.to_string()),
            ("determinism_status", self.determinism_status.to_string()),
            ("freeze_status", self.freeze_status.to_string()),
            ("precision", float(m.precision)),
            ("recall", float(m.recall)),
            ("kl_divergence", float(m.kl_divergence)),
            ("ece", float(m.ece)),
            ("loss", float(m.loss)),
            ("gpu_temperature", float(m.gpu_temperature)),
            ("epoch", self.epoch.to_string()),
            ("batch_size", self.batch_size.to_string()),
            ("wall_timestamp", float(self.wall_timestamp)),
            ("monotonic_timestamp", float(self.monotonic_timestamp)),
        ];
        let mut out = String::with_capacity(320);
        for (idx, (key, value)) in fields.iter().enumerate() {
            if idx > 0 {
                out.push('|');
            }
            let _ = write!(out, "{key}:{value}");
        }
        out
    }

    /// Whether every float in the snapshot is finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        let m = &self.metrics;
        [
            m.precision,
            m.recall,
            m.kl_divergence,
            m.ece,
            m.loss,
            m.gpu_temperature,
            self.wall_timestamp,
            self.monotonic_timestamp,
        ]
        .iter()
        .all(|value| value.is_finite())
    }
}

/// Bytes covered by the signature.
#[must_use]
pub fn signature_payload(schema_version: u32, checksum: &str, wall_timestamp: f64) -> String {
    format!(
        "schema_version:{schema_version}|checksum:{checksum}|wall_timestamp:{}",
        float(wall_timestamp)
    )
}

#[cfg(test)]
pub(crate) fn sample_snapshot(monotonic_timestamp: f64) -> TelemetrySnapshot {
    TelemetrySnapshot {
        schema_version: EXPECTED_SCHEMA_VERSION,
        determinism_status: true,
        freeze_status: true,
        metrics: TelemetryMetrics {
            precision: 0.91,
            recall: 0.87,
            kl_divergence: 0.04,
            ece: 0.021,
            loss: 0.3125,
            gpu_temperature: 71.5,
        },
        epoch: 12,
        batch_size: 256,
        wall_timestamp: 1_760_000_000.25,
        monotonic_timestamp,
        integrity_checksum: String::new(),
        signature: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_encoding_is_fixed_precision_and_ordered() {
        let snapshot = sample_snapshot(5.0);
        assert_eq!(
            snapshot.canonical_encoding(),
            "schema_version:1|determinism_status:true|freeze_status:true|\
             precision:0.91000000|recall:0.87000000|kl_divergence:0.04000000|\
             ece:0.02100000|loss:0.31250000|gpu_temperature:71.50000000|\
             epoch:12|batch_size:256|wall_timestamp:1760000000.25000000|\
             monotonic_timestamp:5.00000000"
        );
    }

    #[test]
    fn signature_payload_layout() {
        assert_eq!(
            signature_payload(1, "abc", 2.5),
            "schema_version:1|checksum:abc|wall_timestamp:2.50000000"
        );
    }

    #[test]
    fn signature_is_optional_on_the_wire() {
        let mut value = serde_json::to_value(sample_snapshot(1.0)).unwrap();
        assert!(value.get("signature").is_none());
        value["signature"] = serde_json::json!("00");
        let parsed: TelemetrySnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.signature.as_deref(), Some("00"));
    }

    #[test]
    fn missing_required_field_does_not_parse() {
        let mut value = serde_json::to_value(sample_snapshot(1.0)).unwrap();
        value.as_object_mut().unwrap().remove("epoch");
        assert!(serde_json::from_value::<TelemetrySnapshot>(value).is_err());
    }
}
