//! Telemetry integrity: snapshot model, sealing, and validation.

pub mod seal;
/// Telemetry snapshot model and canonical encoding.
pub mod snapshot;
/// Ordered integrity checks over the published snapshot.
pub mod validator;

pub use seal::{load_secret_key, seal_snapshot, write_secret_key, KeyError, SecretKey};
pub use snapshot::{TelemetryMetrics, TelemetrySnapshot, EXPECTED_SCHEMA_VERSION};
pub use validator::{
    LastSeenBaseline, TelemetryAssessment, TelemetryCheck, TelemetryIntegrityValidator,
    ValidationFailure, ValidationOutcome, THERMAL_CEILING_CELSIUS,
};
