use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    context::GovernanceContext,
    error::GovernanceResult,
    store::{load_json, write_json_atomic},
};

const COMPONENT: &str = "mode_mutex";

/// Operating mode of the agent. TRAIN and HUNT are mutually exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum OperatingMode {
    /// Neither training nor hunting.
    #[default]
    Idle,
    /// Restricted training mode.
    Train,
    /// Live action-taking mode.
    Hunt,
}

impl OperatingMode {
    /// Upper-case name persisted next to the numeric code.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Train => "TRAIN",
            Self::Hunt => "HUNT",
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<OperatingMode> for u8 {
    fn from(mode: OperatingMode) -> Self {
        match mode {
            OperatingMode::Idle => 0,
            OperatingMode::Train => 1,
            OperatingMode::Hunt => 2,
        }
    }
}

impl TryFrom<u8> for OperatingMode {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Idle),
            1 => Ok(Self::Train),
            2 => Ok(Self::Hunt),
            other => Err(format!("unknown operating mode code {other}")),
        }
    }
}

/// Persisted mutex state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutexRecord {
    /// Active mode.
    pub mode: OperatingMode,
    /// Human-readable copy of `mode`; informational only.
    pub mode_name: String,
    /// When the active mode was entered. `None` while idle.
    pub entry_timestamp: Option<DateTime<Utc>>,
    /// Who performed the last transition.
    pub source: String,
}

impl MutexRecord {
    fn new(mode: OperatingMode, entry_timestamp: Option<DateTime<Utc>>, source: &str) -> Self {
        Self {
            mode,
            mode_name: mode.name().to_string(),
            entry_timestamp,
            source: source.to_string(),
        }
    }

    /// Fail-safe record used when nothing valid is on disk.
    #[must_use]
    pub fn idle(source: &str) -> Self {
        Self::new(OperatingMode::Idle, None, source)
    }
}

/// Why a mutex request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexRejection {
    /// The requested mode is already active.
    AlreadyActive,
    /// The other exclusive mode is active.
    MutexBlocked,
    /// Release requested while idle.
    AlreadyIdle,
}

impl MutexRejection {
    /// Stable reason code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::AlreadyActive => "ALREADY_ACTIVE",
            Self::MutexBlocked => "MUTEX_BLOCKED",
            Self::AlreadyIdle => "ALREADY_IDLE",
        }
    }
}

impl fmt::Display for MutexRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of a mutex request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutexOutcome {
    /// Transition applied; carries the new record.
    Granted(MutexRecord),
    /// Transition refused; nothing was written.
    Rejected {
        /// Refusal reason.
        reason: MutexRejection,
        /// Record as it stands.
        current: MutexRecord,
    },
}

impl MutexOutcome {
    /// Whether the transition was applied.
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    /// Refusal reason, if any.
    #[must_use]
    pub const fn rejection(&self) -> Option<MutexRejection> {
        match self {
            Self::Granted(_) => None,
            Self::Rejected { reason, .. } => Some(*reason),
        }
    }
}

/// Persistent mutual exclusion between IDLE, TRAIN, and HUNT.
#[derive(Debug, Clone)]
pub struct ModeMutex {
    ctx: Arc<GovernanceContext>,
}

impl ModeMutex {
    /// Creates a mutex bound to the context's record.
    #[must_use]
    pub const fn new(ctx: Arc<GovernanceContext>) -> Self {
        Self { ctx }
    }

    /// Current record; missing or unparsable state reads as IDLE.
    #[must_use]
    pub fn current(&self) -> MutexRecord {
        load_json(&self.ctx.paths().mutex_record)
            .unwrap_or_else(|| MutexRecord::idle(self.ctx.source()))
    }

    /// Requests TRAIN.
    pub fn request_train(&self) -> GovernanceResult<MutexOutcome> {
        self.request(OperatingMode::Train)
    }

    /// Requests HUNT.
    pub fn request_hunt(&self) -> GovernanceResult<MutexOutcome> {
        self.request(OperatingMode::Hunt)
    }

    fn request(&self, target: OperatingMode) -> GovernanceResult<MutexOutcome> {
        let _guard = self.ctx.exclusive()?;
        let current = self.current();

        if current.mode == target {
            return Ok(MutexOutcome::Rejected {
                reason: MutexRejection::AlreadyActive,
                current,
            });
        }
        if current.mode != OperatingMode::Idle {
            self.ctx.journal().incident(
                COMPONENT,
                MutexRejection::MutexBlocked.code(),
                &format!("{target} requested while {} is active", current.mode),
                json!({ "requested": target.name(), "active": current.mode.name() }),
            )?;
            return Ok(MutexOutcome::Rejected {
                reason: MutexRejection::MutexBlocked,
                current,
            });
        }

        let record = MutexRecord::new(target, Some(self.ctx.clock().wall_now()), self.ctx.source());
        self.persist_transition(current.mode, &record, "request")?;
        Ok(MutexOutcome::Granted(record))
    }

    /// Returns from TRAIN or HUNT to IDLE.
    pub fn release(&self) -> GovernanceResult<MutexOutcome> {
        let _guard = self.ctx.exclusive()?;
        let current = self.current();
        if current.mode == OperatingMode::Idle {
            return Ok(MutexOutcome::Rejected {
                reason: MutexRejection::AlreadyIdle,
                current,
            });
        }
        let record = MutexRecord::idle(self.ctx.source());
        self.persist_transition(current.mode, &record, "release")?;
        Ok(MutexOutcome::Granted(record))
    }

    /// Forces IDLE regardless of the active mode. Idempotent.
    ///
    /// Returns `true` when a TRAIN or HUNT mode was actually cleared.
    pub fn force_idle(&self, reason: &str) -> GovernanceResult<bool> {
        let _guard = self.ctx.exclusive()?;
        let stored: Option<MutexRecord> = load_json(&self.ctx.paths().mutex_record);
        let from = match stored {
            Some(record) if record.mode == OperatingMode::Idle => return Ok(false),
            Some(record) => record.mode,
            None => OperatingMode::Idle,
        };
        let record = MutexRecord::idle(self.ctx.source());
        self.persist_transition(from, &record, reason)?;
        Ok(from != OperatingMode::Idle)
    }

    fn persist_transition(
        &self,
        from: OperatingMode,
        record: &MutexRecord,
        cause: &str,
    ) -> GovernanceResult<()> {
        write_json_atomic(&self.ctx.paths().mutex_record, record)?;
        let payload = json!({
            "from": from.name(),
            "to": record.mode.name(),
            "cause": cause,
            "source": record.source,
        });
        self.ctx
            .journal()
            .log(LogLevel::Info, "governance.mode.transition", payload.clone());
        self.ctx.journal().event("governance.mode.transition", payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::Harness;
    use shared_logging::AuditLog;

    fn incidents(h: &Harness) -> Vec<String> {
        AuditLog::read_all(&h.ctx.paths().incident_log)
            .unwrap()
            .into_iter()
            .map(|entry| entry.event)
            .collect()
    }

    #[test]
    fn starts_idle_and_grants_from_idle() {
        let h = Harness::new();
        let mutex = ModeMutex::new(h.ctx.clone());
        assert_eq!(mutex.current().mode, OperatingMode::Idle);

        let outcome = mutex.request_train().unwrap();
        assert!(outcome.is_granted());
        let record = mutex.current();
        assert_eq!(record.mode, OperatingMode::Train);
        assert_eq!(record.mode_name, "TRAIN");
        assert!(record.entry_timestamp.is_some());
    }

    #[test]
    fn duplicate_request_is_already_active_without_incident() {
        let h = Harness::new();
        let mutex = ModeMutex::new(h.ctx.clone());
        mutex.request_hunt().unwrap();
        let before = mutex.current();
        let outcome = mutex.request_hunt().unwrap();
        assert_eq!(outcome.rejection(), Some(MutexRejection::AlreadyActive));
        assert_eq!(mutex.current(), before);
        assert!(incidents(&h).is_empty());
    }

    #[test]
    fn cross_mode_request_is_blocked_and_audited() {
        let h = Harness::new();
        let mutex = ModeMutex::new(h.ctx.clone());
        mutex.request_train().unwrap();
        let outcome = mutex.request_hunt().unwrap();
        assert_eq!(outcome.rejection(), Some(MutexRejection::MutexBlocked));
        assert_eq!(mutex.current().mode, OperatingMode::Train);
        assert_eq!(incidents(&h), ["MUTEX_BLOCKED"]);
    }

    #[test]
    fn release_round_trip() {
        let h = Harness::new();
        let mutex = ModeMutex::new(h.ctx.clone());
        assert_eq!(
            mutex.release().unwrap().rejection(),
            Some(MutexRejection::AlreadyIdle)
        );
        mutex.request_train().unwrap();
        assert!(mutex.release().unwrap().is_granted());
        let record = mutex.current();
        assert_eq!(record.mode, OperatingMode::Idle);
        assert!(record.entry_timestamp.is_none());
        assert!(mutex.request_hunt().unwrap().is_granted());
    }

    #[test]
    fn never_reports_both_modes_over_any_sequence() {
        let h = Harness::new();
        let mutex = ModeMutex::new(h.ctx.clone());
        let ops: [fn(&ModeMutex) -> MutexOutcome; 3] = [
            |m| m.request_train().unwrap(),
            |m| m.request_hunt().unwrap(),
            |m| m.release().unwrap(),
        ];
        // Deterministic walk over every 4-step sequence of operations.
        for seq in 0..81_u32 {
            mutex.force_idle("reset").unwrap();
            let mut code = seq;
            for _ in 0..4 {
                let before = mutex.current().mode;
                let op = (code % 3) as usize;
                code /= 3;
                let outcome = ops[op](&mutex);
                let after = mutex.current().mode;
                if op < 2 && before != OperatingMode::Idle {
                    assert!(!outcome.is_granted());
                    assert_eq!(before, after);
                }
                assert!(matches!(
                    after,
                    OperatingMode::Idle | OperatingMode::Train | OperatingMode::Hunt
                ));
            }
        }
    }

    #[test]
    fn corrupt_record_fails_safe_to_idle() {
        let h = Harness::new();
        let mutex = ModeMutex::new(h.ctx.clone());
        let path = &h.ctx.paths().mutex_record;
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, br#"{"mode": 2, "mode_name": "HU"#).unwrap();
        assert_eq!(mutex.current().mode, OperatingMode::Idle);
        std::fs::write(
            path,
            br#"{"mode": 9, "mode_name": "HUNT", "entry_timestamp": null, "source": "x"}"#,
        )
        .unwrap();
        assert_eq!(mutex.current().mode, OperatingMode::Idle);
    }

    #[test]
    fn force_idle_is_idempotent() {
        let h = Harness::new();
        let mutex = ModeMutex::new(h.ctx.clone());
        mutex.request_hunt().unwrap();
        assert!(mutex.force_idle("containment").unwrap());
        assert!(!mutex.force_idle("containment").unwrap());
        assert_eq!(mutex.current().mode, OperatingMode::Idle);
    }

    #[test]
    fn persisted_mode_uses_numeric_code() {
        let h = Harness::new();
        let mutex = ModeMutex::new(h.ctx.clone());
        mutex.request_hunt().unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&h.ctx.paths().mutex_record).unwrap()).unwrap();
        assert_eq!(raw["mode"], 2);
        assert_eq!(raw["mode_name"], "HUNT");
    }
}
