use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use super::{
    seal::{self, load_secret_key, SecretKey},
    snapshot::{TelemetrySnapshot, EXPECTED_SCHEMA_VERSION},
};
use crate::{
    containment::ContainmentStore,
    context::GovernanceContext,
    error::{GovernanceError, GovernanceResult},
    signals::GateSignals,
    store::write_json_atomic,
};

const COMPONENT: &str = "telemetry_validator";

/// GPU temperature at or above which telemetry is rejected.
pub const THERMAL_CEILING_CELSIUS: f64 = 88.0;

/// Integrity checks, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TelemetryCheck {
    /// Secret key present, well formed, and privately stored.
    KeyHygiene,
    /// Snapshot parses with every required field.
    Malformed,
    /// Schema version matches [`EXPECTED_SCHEMA_VERSION`].
    SchemaVersion,
    /// Determinism validator passed.
    Determinism,
    /// Checkpoint certified frozen.
    Freeze,
    /// Stored checksum matches the canonical encoding.
    Checksum,
    /// Stored signature matches the key.
    Signature,
    /// Monotonic timestamp is strictly newer than the last accepted one.
    Replay,
    /// GPU below the thermal ceiling.
    ThermalHalt,
    /// No operator governance lock.
    GovernanceLock,
}

impl TelemetryCheck {
    /// All checks in execution order.
    pub const ORDER: [Self; 10] = [
        Self::KeyHygiene,
        Self::Malformed,
        Self::SchemaVersion,
        Self::Determinism,
        Self::Freeze,
        Self::Checksum,
        Self::Signature,
        Self::Replay,
        Self::ThermalHalt,
        Self::GovernanceLock,
    ];

    /// One-based position in [`Self::ORDER`].
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        match self {
            Self::KeyHygiene => 1,
            Self::Malformed => 2,
            Self::SchemaVersion => 3,
            Self::Determinism => 4,
            Self::Freeze => 5,
            Self::Checksum => 6,
            Self::Signature => 7,
            Self::Replay => 8,
            Self::ThermalHalt => 9,
            Self::GovernanceLock => 10,
        }
    }

    /// Stable code written to the incident trail.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::KeyHygiene => "KEY_HYGIENE",
            Self::Malformed => "MALFORMED",
            Self::SchemaVersion => "SCHEMA_VERSION",
            Self::Determinism => "DETERMINISM",
            Self::Freeze => "FREEZE",
            Self::Checksum => "CHECKSUM",
            Self::Signature => "SIGNATURE",
            Self::Replay => "REPLAY",
            Self::ThermalHalt => "THERMAL_HALT",
            Self::GovernanceLock => "GOVERNANCE_LOCK",
        }
    }
}

impl fmt::Display for TelemetryCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// First check that rejected a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    /// Failing check.
    pub check: TelemetryCheck,
    /// Human-readable detail.
    pub reason: String,
}

impl ValidationFailure {
    fn new(check: TelemetryCheck, reason: impl Into<String>) -> Self {
        Self {
            check,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.check, self.reason)
    }
}

/// Verdict on one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// Every check passed.
    Passed {
        /// Accepted monotonic timestamp.
        monotonic_timestamp: f64,
    },
    /// A check failed; later checks did not run.
    Failed(ValidationFailure),
}

impl ValidationOutcome {
    /// Whether every check passed.
    #[must_use]
    pub const fn is_passed(&self) -> bool {
        matches!(self, Self::Passed { .. })
    }

    /// Failure, if any.
    #[must_use]
    pub const fn failure(&self) -> Option<&ValidationFailure> {
        match self {
            Self::Passed { .. } => None,
            Self::Failed(failure) => Some(failure),
        }
    }
}

/// Replay-protection baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LastSeenBaseline {
    /// Newest monotonic timestamp accepted so far.
    pub last_accepted_monotonic_timestamp: Option<f64>,
}

enum BaselineRead {
    Absent,
    Present(LastSeenBaseline),
    Corrupt(String),
}

/// Per-gate view of the telemetry artifact, used by admission.
///
/// Unlike [`ValidationOutcome`] nothing short-circuits: each field is
/// evaluated on its own so the gate report can itemize every problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryAssessment {
    /// Secret key usable.
    pub key: Result<(), String>,
    /// Snapshot parses and carries the expected schema version.
    pub schema: Result<(), String>,
    /// Snapshot certified frozen.
    pub freeze: Result<(), String>,
    /// Checksum and signature present and valid.
    pub signature: Result<(), String>,
}

/// Validates telemetry snapshots and contains the system when one fails.
#[derive(Debug, Clone)]
pub struct TelemetryIntegrityValidator {
    ctx: Arc<GovernanceContext>,
    containment: ContainmentStore,
    signals: GateSignals,
}

impl TelemetryIntegrityValidator {
    /// Creates a validator.
    #[must_use]
    pub fn new(ctx: Arc<GovernanceContext>) -> Self {
        let containment = ContainmentStore::new(Arc::clone(&ctx));
        let signals = GateSignals::new(&ctx.paths().signals_dir);
        Self {
            ctx,
            containment,
            signals,
        }
    }

    /// Validates the published telemetry artifact.
    ///
    /// A failure engages containment and records an incident before the
    /// outcome is returned. A pass advances the replay baseline.
    pub fn validate(&self) -> GovernanceResult<ValidationOutcome> {
        let _guard = self.ctx.exclusive()?;
        let raw = self.read_artifact()?;
        let outcome = self.evaluate(raw.as_deref());
        self.apply(&outcome)?;
        Ok(outcome)
    }

    /// Validates a snapshot supplied directly rather than read from disk.
    pub fn validate_bytes(&self, raw: &[u8]) -> GovernanceResult<ValidationOutcome> {
        let _guard = self.ctx.exclusive()?;
        let outcome = self.evaluate(Some(raw));
        self.apply(&outcome)?;
        Ok(outcome)
    }

    /// Runs every check against the published artifact without writing
    /// anything.
    pub fn inspect(&self) -> GovernanceResult<ValidationOutcome> {
        let raw = self.read_artifact()?;
        Ok(self.evaluate(raw.as_deref()))
    }

    /// Itemized, side-effect-free view for the admission gates.
    pub fn assess(&self) -> GovernanceResult<TelemetryAssessment> {
        let key = self.load_key();
        let snapshot = match self.read_artifact()? {
            None => Err("telemetry snapshot missing".to_string()),
            Some(raw) => parse_snapshot(&raw).map_err(|failure| failure.reason),
        };

        let schema = match &snapshot {
            Ok(snapshot) => check_schema(snapshot).map_err(|failure| failure.reason),
            Err(reason) => Err(reason.clone()),
        };
        let freeze = match &snapshot {
            Ok(snapshot) if snapshot.freeze_status => Ok(()),
            Ok(_) => Err("freeze_status is false".to_string()),
            Err(reason) => Err(reason.clone()),
        };
        let signature = match (&key, &snapshot) {
            (Ok(key), Ok(snapshot)) => seal::verify_seal(key, snapshot),
            (Err(_), _) => Err("secret key unavailable".to_string()),
            (_, Err(reason)) => Err(reason.clone()),
        };
        Ok(TelemetryAssessment {
            key: key.map(|_| ()).map_err(|err| err.to_string()),
            schema,
            freeze,
            signature,
        })
    }

    /// Current replay baseline; `None` when absent or unreadable.
    #[must_use]
    pub fn baseline(&self) -> Option<LastSeenBaseline> {
        match self.read_baseline() {
            BaselineRead::Present(baseline) => Some(baseline),
            BaselineRead::Absent | BaselineRead::Corrupt(_) => None,
        }
    }

    fn load_key(&self) -> Result<SecretKey, seal::KeyError> {
        load_secret_key(&self.ctx.config().key, &self.ctx.paths().secret_key)
    }

    fn read_artifact(&self) -> GovernanceResult<Option<Vec<u8>>> {
        let path = &self.ctx.paths().telemetry_snapshot;
        match std::fs::read(path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(GovernanceError::io(path, err)),
        }
    }

    fn read_baseline(&self) -> BaselineRead {
        let path = &self.ctx.paths().telemetry_baseline;
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return BaselineRead::Absent,
            Err(err) => return BaselineRead::Corrupt(format!("baseline unreadable: {err}")),
        };
        match serde_json::from_slice::<LastSeenBaseline>(&raw) {
            Ok(baseline) => BaselineRead::Present(baseline),
            Err(err) => BaselineRead::Corrupt(format!("baseline unparsable: {err}")),
        }
    }

    fn evaluate(&self, raw: Option<&[u8]>) -> ValidationOutcome {
        match self.run_checks(raw) {
            Ok(snapshot) => ValidationOutcome::Passed {
                monotonic_timestamp: snapshot.monotonic_timestamp,
            },
            Err(failure) => ValidationOutcome::Failed(failure),
        }
    }

    fn run_checks(&self, raw: Option<&[u8]>) -> Result<TelemetrySnapshot, ValidationFailure> {
        use TelemetryCheck as Check;

        let key = self
            .load_key()
            .map_err(|err| ValidationFailure::new(Check::KeyHygiene, err.to_string()))?;
        let raw = raw.ok_or_else(|| {
            ValidationFailure::new(Check::Malformed, "telemetry snapshot missing")
        })?;
        let snapshot = parse_snapshot(raw)?;
        check_schema(&snapshot)?;
        if !snapshot.determinism_status {
            return Err(ValidationFailure::new(
                Check::Determinism,
                "determinism_status is false",
            ));
        }
        if !snapshot.freeze_status {
            return Err(ValidationFailure::new(Check::Freeze, "freeze_status is false"));
        }
        if !seal::checksum_matches(&snapshot) {
            return Err(ValidationFailure::new(Check::Checksum, "checksum mismatch"));
        }
        seal::verify_signature(&key, &snapshot)
            .map_err(|fault| ValidationFailure::new(Check::Signature, fault.to_string()))?;

        match self.read_baseline() {
            BaselineRead::Absent => {}
            BaselineRead::Corrupt(reason) => {
                return Err(ValidationFailure::new(Check::Replay, reason));
            }
            BaselineRead::Present(LastSeenBaseline {
                last_accepted_monotonic_timestamp: Some(last),
            }) if snapshot.monotonic_timestamp <= last => {
                return Err(ValidationFailure::new(
                    Check::Replay,
                    format!(
                        "monotonic_timestamp {} is not newer than {last}",
                        snapshot.monotonic_timestamp
                    ),
                ));
            }
            BaselineRead::Present(_) => {}
        }

        if snapshot.metrics.gpu_temperature >= THERMAL_CEILING_CELSIUS {
            return Err(ValidationFailure::new(
                Check::ThermalHalt,
                format!(
                    "gpu_temperature {:.1} reached the {THERMAL_CEILING_CELSIUS:.1} ceiling",
                    snapshot.metrics.gpu_temperature
                ),
            ));
        }
        let lock = self.signals.governance_unlocked();
        if !lock.ok {
            return Err(ValidationFailure::new(Check::GovernanceLock, lock.detail));
        }
        Ok(snapshot)
    }

    fn apply(&self, outcome: &ValidationOutcome) -> GovernanceResult<()> {
        match outcome {
            ValidationOutcome::Passed {
                monotonic_timestamp,
            } => {
                write_json_atomic(
                    &self.ctx.paths().telemetry_baseline,
                    &LastSeenBaseline {
                        last_accepted_monotonic_timestamp: Some(*monotonic_timestamp),
                    },
                )?;
                self.ctx.journal().log(
                    LogLevel::Info,
                    "governance.telemetry.accepted",
                    json!({ "monotonic_timestamp": monotonic_timestamp }),
                );
            }
            ValidationOutcome::Failed(failure) => {
                self.containment
                    .engage(COMPONENT, &failure.to_string())?;
                self.ctx.journal().incident(
                    COMPONENT,
                    failure.check.code(),
                    &failure.reason,
                    json!({
                        "check": failure.check.ordinal(),
                        "code": failure.check.code(),
                    }),
                )?;
            }
        }
        Ok(())
    }
}

fn parse_snapshot(raw: &[u8]) -> Result<TelemetrySnapshot, ValidationFailure> {
    let snapshot: TelemetrySnapshot = serde_json::from_slice(raw).map_err(|err| {
        ValidationFailure::new(TelemetryCheck::Malformed, format!("snapshot unparsable: {err}"))
    })?;
    if !snapshot.is_finite() {
        return Err(ValidationFailure::new(
            TelemetryCheck::Malformed,
            "snapshot carries non-finite values",
        ));
    }
    Ok(snapshot)
}

fn check_schema(snapshot: &TelemetrySnapshot) -> Result<(), ValidationFailure> {
    if snapshot.schema_version == EXPECTED_SCHEMA_VERSION {
        Ok(())
    } else {
        Err(ValidationFailure::new(
            TelemetryCheck::SchemaVersion,
            format!(
                "schema_version {} (expected {EXPECTED_SCHEMA_VERSION})",
                snapshot.schema_version
            ),
        ))
    }
}
