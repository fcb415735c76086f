//! Startup self-healing after a crash or tampering.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    admission::TrainingAdmissionProtocol,
    containment::ContainmentStore,
    context::GovernanceContext,
    error::{GovernanceError, GovernanceResult},
    integrity::{
        seal::{self, load_secret_key, SecretKey},
        TelemetrySnapshot,
    },
    store::{remove_if_exists, write_json_atomic},
};

const COMPONENT: &str = "recovery_guard";

/// One corrective action taken by a recovery pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryAction {
    /// Training was recorded active with no live process behind it.
    OrphanedTraining {
        /// Whether the telemetry freeze flag was withdrawn.
        freeze_invalidated: bool,
    },
    /// The telemetry artifact failed its seal check and was removed.
    TelemetryCorrupted {
        /// What failed.
        reason: String,
    },
}

/// Summary of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Actions taken, in order.
    pub actions: Vec<RecoveryAction>,
}

impl RecoveryReport {
    /// Whether nothing needed fixing.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Detects orphaned training and corrupted telemetry at startup.
///
/// Idempotent: a second pass with no external change reports clean.
#[derive(Debug, Clone)]
pub struct RecoveryGuard {
    ctx: Arc<GovernanceContext>,
    protocol: TrainingAdmissionProtocol,
    containment: ContainmentStore,
}

impl RecoveryGuard {
    /// Creates the guard.
    #[must_use]
    pub fn new(ctx: Arc<GovernanceContext>) -> Self {
        Self {
            protocol: TrainingAdmissionProtocol::new(Arc::clone(&ctx)),
            containment: ContainmentStore::new(Arc::clone(&ctx)),
            ctx,
        }
    }

    /// Runs both checks; each logs its own recovery entry.
    pub fn run(&self) -> GovernanceResult<RecoveryReport> {
        let _guard = self.ctx.exclusive()?;
        let mut report = RecoveryReport::default();
        if let Some(action) = self.check_orphaned_training()? {
            report.actions.push(action);
        }
        if let Some(action) = self.check_telemetry()? {
            report.actions.push(action);
        }
        if report.is_clean() {
            self.ctx
                .journal()
                .log(LogLevel::Info, "governance.recovery.clean", json!({}));
        }
        Ok(report)
    }

    fn load_key(&self) -> Option<SecretKey> {
        load_secret_key(&self.ctx.config().key, &self.ctx.paths().secret_key).ok()
    }

    fn read_snapshot(&self) -> GovernanceResult<Option<Result<TelemetrySnapshot, String>>> {
        let path = &self.ctx.paths().telemetry_snapshot;
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(GovernanceError::io(path, err)),
        };
        Ok(Some(
            serde_json::from_slice(&raw).map_err(|err| format!("snapshot unparsable: {err}")),
        ))
    }

    fn check_orphaned_training(&self) -> GovernanceResult<Option<RecoveryAction>> {
        let state = self.protocol.state();
        if !state.training_active || self.ctx.paths().liveness_marker.exists() {
            return Ok(None);
        }

        let reason = "training recorded active but liveness marker is absent";
        self.containment.engage(COMPONENT, reason)?;
        let freeze_invalidated = self.invalidate_freeze()?;
        self.protocol.reset(reason)?;
        self.ctx.journal().recovery(
            COMPONENT,
            "ORPHANED_TRAINING",
            reason,
            json!({
                "freeze_invalidated": freeze_invalidated,
                "trust_tier": state.trust_tier.label(),
                "training_start_monotonic": state.training_start_monotonic,
            }),
        )?;
        Ok(Some(RecoveryAction::OrphanedTraining { freeze_invalidated }))
    }

    /// Clears the freeze flag and re-seals, so the artifact fails the freeze
    /// check instead of looking corrupted. Unverifiable artifacts are left
    /// to the corruption check.
    fn invalidate_freeze(&self) -> GovernanceResult<bool> {
        let Some(Ok(mut snapshot)) = self.read_snapshot()? else {
            return Ok(false);
        };
        let Some(key) = self.load_key() else {
            return Ok(false);
        };
        if !snapshot.freeze_status || seal::verify_seal(&key, &snapshot).is_err() {
            return Ok(false);
        }
        snapshot.freeze_status = false;
        seal::seal_snapshot(&mut snapshot, &key);
        write_json_atomic(&self.ctx.paths().telemetry_snapshot, &snapshot)?;
        Ok(true)
    }

    fn check_telemetry(&self) -> GovernanceResult<Option<RecoveryAction>> {
        let Some(parsed) = self.read_snapshot()? else {
            return Ok(None);
        };
        let verdict = parsed.and_then(|snapshot| match self.load_key() {
            Some(key) => seal::verify_seal(&key, &snapshot),
            None => Err("secret key unavailable".to_string()),
        });
        let Err(reason) = verdict else {
            return Ok(None);
        };

        remove_if_exists(&self.ctx.paths().telemetry_snapshot)?;
        self.protocol.reset(&reason)?;
        self.containment
            .engage(COMPONENT, &format!("telemetry corrupted: {reason}"))?;
        self.ctx.journal().recovery(
            COMPONENT,
            "TELEMETRY_CORRUPTED",
            &reason,
            json!({ "artifact": self.ctx.paths().telemetry_snapshot }),
        )?;
        Ok(Some(RecoveryAction::TelemetryCorrupted { reason }))
    }
}
