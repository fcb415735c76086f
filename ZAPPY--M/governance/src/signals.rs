//! Readers for status files published by external validators.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use serde_json::Value;

use crate::{error::GovernanceResult, store::write_json_atomic};

/// File names inside the signals directory.
pub mod files {
    /// CI pipeline status.
    pub const CI: &str = "ci.json";
    /// Determinism validator status.
    pub const DETERMINISM: &str = "determinism.json";
    /// Cross-device validator status.
    pub const CROSS_DEVICE: &str = "cross_device.json";
    /// Thermal guard status.
    pub const THERMAL: &str = "thermal.json";
    /// Drift detector status.
    pub const DRIFT: &str = "drift.json";
    /// Operator governance lock.
    pub const GOVERNANCE_LOCK: &str = "governance_lock.json";
}

/// Result of reading one signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalReading {
    /// Whether the signal permits progress.
    pub ok: bool,
    /// Short explanation for reports.
    pub detail: String,
}

impl SignalReading {
    fn pass(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for SignalReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", if self.ok { "ok" } else { "blocked" }, self.detail)
    }
}

#[derive(Debug, Deserialize)]
struct StatusSignal {
    status: String,
}

#[derive(Debug, Deserialize)]
struct AlertSignal {
    alert: bool,
}

#[derive(Debug, Deserialize)]
struct LockSignal {
    active: bool,
}

enum Raw<T> {
    Missing,
    Invalid(String),
    Present(T),
}

/// Read-only view over the signals directory.
///
/// Every reading is fresh from disk. Missing or malformed files block,
/// except the governance lock, whose absence means no lock is held.
#[derive(Debug, Clone)]
pub struct GateSignals {
    dir: PathBuf,
}

impl GateSignals {
    /// Reader rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory being read.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Raw<T> {
        let path = self.dir.join(name);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Raw::Missing,
            Err(err) => return Raw::Invalid(format!("{name} unreadable: {err}")),
        };
        match serde_json::from_slice::<T>(&raw) {
            Ok(value) => Raw::Present(value),
            Err(err) => Raw::Invalid(format!("{name} malformed: {err}")),
        }
    }

    fn expect_status(&self, name: &str, wanted: &str) -> SignalReading {
        match self.read::<StatusSignal>(name) {
            Raw::Missing => SignalReading::fail(format!("{name} missing")),
            Raw::Invalid(detail) => SignalReading::fail(detail),
            Raw::Present(signal) if signal.status.eq_ignore_ascii_case(wanted) => {
                SignalReading::pass(format!("status {}", signal.status))
            }
            Raw::Present(signal) => {
                SignalReading::fail(format!("status {} (need {wanted})", signal.status))
            }
        }
    }

    /// CI fully green.
    #[must_use]
    pub fn ci_green(&self) -> SignalReading {
        self.expect_status(files::CI, "green")
    }

    /// Determinism validator passed.
    #[must_use]
    pub fn determinism_pass(&self) -> SignalReading {
        self.expect_status(files::DETERMINISM, "pass")
    }

    /// Cross-device validator passed.
    #[must_use]
    pub fn cross_device_pass(&self) -> SignalReading {
        self.expect_status(files::CROSS_DEVICE, "pass")
    }

    /// Thermal guard is not pausing work.
    #[must_use]
    pub fn thermal_clear(&self) -> SignalReading {
        self.expect_status(files::THERMAL, "ok")
    }

    /// No drift alert raised.
    #[must_use]
    pub fn drift_clear(&self) -> SignalReading {
        match self.read::<AlertSignal>(files::DRIFT) {
            Raw::Missing => SignalReading::fail(format!("{} missing", files::DRIFT)),
            Raw::Invalid(detail) => SignalReading::fail(detail),
            Raw::Present(AlertSignal { alert: true }) => SignalReading::fail("drift alert active"),
            Raw::Present(AlertSignal { alert: false }) => SignalReading::pass("no drift alert"),
        }
    }

    /// No operator governance lock held.
    #[must_use]
    pub fn governance_unlocked(&self) -> SignalReading {
        match self.read::<LockSignal>(files::GOVERNANCE_LOCK) {
            Raw::Missing => SignalReading::pass("no governance lock"),
            Raw::Invalid(detail) => SignalReading::fail(detail),
            Raw::Present(LockSignal { active: true }) => {
                SignalReading::fail("governance lock active")
            }
            Raw::Present(LockSignal { active: false }) => {
                SignalReading::pass("governance lock released")
            }
        }
    }

    /// Writes a signal file. Used by operators and tests to publish status.
    pub fn publish(&self, name: &str, value: &Value) -> GovernanceResult<()> {
        write_json_atomic(&self.dir.join(name), value)
    }
}
