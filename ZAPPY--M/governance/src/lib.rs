#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Zappy training/hunting governance kernel.
//!
//! Decides, from local durable records only, whether the agent may train,
//! how far its trust tier has progressed, and when it may enter HUNT.

/// Trust tiers, admission gates, and the training protocol.
pub mod admission;
/// Injected time sources.
pub mod clock;
/// Record locations and TOML configuration.
pub mod config;
/// Containment (safe-tier override) record.
pub mod containment;
/// Explicit context shared by every component.
pub mod context;
/// Error types.
pub mod error;
/// Telemetry snapshot model, sealing, and validation.
pub mod integrity;
/// Operational log, audit trails, and events.
pub mod journal;
/// Mutual exclusion between IDLE, TRAIN, and HUNT.
pub mod mode_mutex;
/// Startup crash recovery.
pub mod recovery;
/// Facade over the components.
pub mod runtime;
/// External gate-status signals.
pub mod signals;
/// Atomic record storage and the cross-process lock.
pub mod store;

pub use admission::{
    AdmissionOutcome, AdvanceOutcome, EvaluationMetrics, GateId, GateReport, HuntEligibility,
    ProtocolRejection, ProtocolState, StopOutcome, TrainingAdmissionProtocol, TrustTier,
    HUNT_LOCKOUT_SECS, STABILITY_WINDOW,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{GovernanceConfig, GovernancePaths, KeySettings};
pub use containment::{ContainmentRecord, ContainmentStore};
pub use context::GovernanceContext;
pub use error::{GovernanceError, GovernanceResult};
pub use integrity::{
    SecretKey, TelemetryCheck, TelemetryIntegrityValidator, TelemetrySnapshot, ValidationOutcome,
};
pub use journal::GovernanceJournal;
pub use mode_mutex::{ModeMutex, MutexOutcome, MutexRecord, MutexRejection, OperatingMode};
pub use recovery::{RecoveryAction, RecoveryGuard, RecoveryReport};
pub use runtime::{GovernanceRuntime, GovernanceStatus, HuntEntry, HuntRefusal};
pub use signals::GateSignals;
