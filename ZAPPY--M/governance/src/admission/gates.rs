use std::fmt;

use indexmap::IndexMap;
use serde::Serialize;

/// The twelve admission gates, in report order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateId {
    /// CI fully green.
    CiGreen,
    /// Determinism validator passed.
    DeterminismPass,
    /// Cross-device validator passed.
    CrossDevicePass,
    /// Telemetry certified frozen.
    FreezeValid,
    /// No containment record.
    NoContainment,
    /// Telemetry parses with the expected schema version.
    TelemetrySchema,
    /// Mode mutex is not in HUNT.
    MutexNotHunt,
    /// Thermal guard not paused.
    ThermalClear,
    /// Telemetry checksum and signature valid.
    SignatureValid,
    /// Secret key usable.
    SecretKeyValid,
    /// Drift detector quiet.
    NoDriftAlert,
    /// Stability counter has reached the window.
    StabilityWindow,
}

impl GateId {
    /// Every gate in report order.
    pub const ALL: [Self; 12] = [
        Self::CiGreen,
        Self::DeterminismPass,
        Self::CrossDevicePass,
        Self::FreezeValid,
        Self::NoContainment,
        Self::TelemetrySchema,
        Self::MutexNotHunt,
        Self::ThermalClear,
        Self::SignatureValid,
        Self::SecretKeyValid,
        Self::NoDriftAlert,
        Self::StabilityWindow,
    ];

    /// Stable label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::CiGreen => "ci_green",
            Self::DeterminismPass => "determinism_pass",
            Self::CrossDevicePass => "cross_device_pass",
            Self::FreezeValid => "freeze_valid",
            Self::NoContainment => "no_containment",
            Self::TelemetrySchema => "telemetry_schema",
            Self::MutexNotHunt => "mutex_not_hunt",
            Self::ThermalClear => "thermal_clear",
            Self::SignatureValid => "signature_valid",
            Self::SecretKeyValid => "secret_key_valid",
            Self::NoDriftAlert => "no_drift_alert",
            Self::StabilityWindow => "stability_window",
        }
    }
}

impl fmt::Display for GateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

/// Outcome of one gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateResult {
    /// Whether the gate passed.
    pub passed: bool,
    /// Explanation shown to operators.
    pub detail: String,
}

impl GateResult {
    /// Builds a result from a check.
    #[must_use]
    pub fn from_check(check: Result<(), String>, pass_detail: &str) -> Self {
        match check {
            Ok(()) => Self {
                passed: true,
                detail: pass_detail.to_string(),
            },
            Err(detail) => Self {
                passed: false,
                detail,
            },
        }
    }
}

/// Itemized admission report. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct GateReport {
    results: IndexMap<GateId, GateResult>,
}

impl GateReport {
    /// Records a gate outcome, replacing any earlier one for the same gate.
    pub fn record(&mut self, gate: GateId, result: GateResult) {
        self.results.insert(gate, result);
    }

    /// Outcome for `gate`.
    #[must_use]
    pub fn get(&self, gate: GateId) -> Option<&GateResult> {
        self.results.get(&gate)
    }

    /// Whether all twelve gates were recorded and passed.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        GateId::ALL
            .iter()
            .all(|gate| self.results.get(gate).is_some_and(|result| result.passed))
    }

    /// Gates that failed, in report order.
    #[must_use]
    pub fn failures(&self) -> Vec<GateId> {
        self.results
            .iter()
            .filter(|(_, result)| !result.passed)
            .map(|(gate, _)| *gate)
            .collect()
    }

    /// Iterates outcomes in report order.
    pub fn entries(&self) -> impl Iterator<Item = (GateId, &GateResult)> {
        self.results.iter().map(|(gate, result)| (*gate, result))
    }
}

impl fmt::Display for GateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (gate, result) in self.entries() {
            let mark = if result.passed { "PASS" } else { "FAIL" };
            writeln!(f, "[{mark}] {gate:<18} {}", result.detail)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_report_does_not_pass() {
        let mut report = GateReport::default();
        for gate in &GateId::ALL[..11] {
            report.record(*gate, GateResult::from_check(Ok(()), "ok"));
        }
        assert!(!report.all_passed());
        report.record(
            GateId::StabilityWindow,
            GateResult::from_check(Err("counter 2 of 5".into()), "ok"),
        );
        assert!(!report.all_passed());
        assert_eq!(report.failures(), vec![GateId::StabilityWindow]);
        report.record(GateId::StabilityWindow, GateResult::from_check(Ok(()), "ok"));
        assert!(report.all_passed());
    }

    #[test]
    fn serializes_in_gate_order() {
        let mut report = GateReport::default();
        report.record(GateId::CiGreen, GateResult::from_check(Ok(()), "green"));
        report.record(
            GateId::NoDriftAlert,
            GateResult::from_check(Err("drift".into()), ""),
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["ci_green"]["passed"], true);
        assert_eq!(value["no_drift_alert"]["detail"], "drift");
        assert!(report.to_string().starts_with("[PASS] ci_green"));
    }
}
