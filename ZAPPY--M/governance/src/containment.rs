use std::{fs, io::ErrorKind, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use tracing::warn;

use crate::{
    admission::{tiers::TrustTier, ProtocolState},
    context::GovernanceContext,
    error::GovernanceResult,
    mode_mutex::ModeMutex,
    store::{load_json, remove_if_exists, write_json_atomic},
};

const COMPONENT: &str = "containment";

/// Persisted override forcing the system into its safe tier.
///
/// Its presence alone means containment is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainmentRecord {
    /// Tier the system is held at.
    pub forced_tier: TrustTier,
    /// Triggering cause.
    pub reason: String,
    /// When containment was (re)engaged.
    pub timestamp: DateTime<Utc>,
    /// Component that engaged it.
    pub source: String,
}

/// Reads, engages, and clears containment.
#[derive(Debug, Clone)]
pub struct ContainmentStore {
    ctx: Arc<GovernanceContext>,
    mutex: ModeMutex,
}

impl ContainmentStore {
    /// Creates the store.
    #[must_use]
    pub fn new(ctx: Arc<GovernanceContext>) -> Self {
        let mutex = ModeMutex::new(Arc::clone(&ctx));
        Self { ctx, mutex }
    }

    /// Active containment, if any.
    ///
    /// A record that exists but cannot be parsed, or whose presence cannot
    /// be determined, still counts as active.
    #[must_use]
    pub fn current(&self) -> Option<ContainmentRecord> {
        let path = &self.ctx.paths().containment;
        match fs::metadata(path) {
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "containment record unreadable");
            }
            Ok(_) => {}
        }
        Some(load_json(path).unwrap_or_else(|| ContainmentRecord {
            forced_tier: TrustTier::None,
            reason: "containment record unreadable".into(),
            timestamp: self.ctx.clock().wall_now(),
            source: COMPONENT.into(),
        }))
    }

    /// Whether containment is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.current().is_some()
    }

    /// Forces the safe tier and disables HUNT. Safe to call repeatedly; the
    /// record always carries the most recent cause.
    ///
    /// Any persisted trust progress is dropped: the tier falls to NONE and
    /// the stability counter restarts from zero.
    pub fn engage(&self, origin: &str, reason: &str) -> GovernanceResult<ContainmentRecord> {
        let _guard = self.ctx.exclusive()?;
        let record = ContainmentRecord {
            forced_tier: TrustTier::None,
            reason: reason.to_string(),
            timestamp: self.ctx.clock().wall_now(),
            source: origin.to_string(),
        };
        write_json_atomic(&self.ctx.paths().containment, &record)?;
        let cleared_mode = self.mutex.force_idle(&format!("containment: {reason}"))?;
        let demoted_from = self.hold_safe_tier()?;
        let payload = json!({
            "origin": origin,
            "reason": reason,
            "forced_tier": record.forced_tier.label(),
            "mode_cleared": cleared_mode,
            "demoted_from": demoted_from.map(TrustTier::label),
        });
        self.ctx
            .journal()
            .log(LogLevel::Warn, "governance.containment.engaged", payload.clone());
        self.ctx
            .journal()
            .event("governance.containment.engaged", payload);
        Ok(record)
    }

    /// Drops persisted trust progress. Returns the previous tier when
    /// anything changed.
    fn hold_safe_tier(&self) -> GovernanceResult<Option<TrustTier>> {
        let path = &self.ctx.paths().protocol_state;
        let Some(mut state) = load_json::<ProtocolState>(path) else {
            return Ok(None);
        };
        if state.trust_tier == TrustTier::None && state.stability_counter == 0 {
            return Ok(None);
        }
        let previous = state.trust_tier;
        state.trust_tier = TrustTier::None;
        state.stability_counter = 0;
        write_json_atomic(path, &state)?;
        Ok(Some(previous))
    }

    /// Lifts containment after operator review. Returns whether a record was
    /// removed; the lift is written to the incident trail.
    pub fn clear(&self, operator_reason: &str) -> GovernanceResult<bool> {
        let _guard = self.ctx.exclusive()?;
        let previous = self.current();
        let removed = remove_if_exists(&self.ctx.paths().containment)?;
        if removed {
            self.ctx.journal().incident(
                COMPONENT,
                "CONTAINMENT_CLEARED",
                operator_reason,
                json!({ "previous_reason": previous.map(|record| record.reason) }),
            )?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::testing::Harness, mode_mutex::OperatingMode};
    use shared_logging::AuditLog;

    #[test]
    fn engage_forces_idle_and_is_idempotent() {
        let h = Harness::new();
        let store = ContainmentStore::new(h.ctx.clone());
        let mutex = ModeMutex::new(h.ctx.clone());
        mutex.request_hunt().unwrap();

        store.engage("validator", "checksum mismatch").unwrap();
        assert_eq!(mutex.current().mode, OperatingMode::Idle);
        let second = store.engage("validator", "signature mismatch").unwrap();
        assert!(store.is_active());
        assert_eq!(store.current().unwrap(), second);
        assert_eq!(second.forced_tier, TrustTier::None);
    }

    #[test]
    fn engage_drops_trust_progress() {
        let h = Harness::new();
        write_json_atomic(
            &h.ctx.paths().protocol_state,
            &ProtocolState {
                training_active: true,
                trust_tier: TrustTier::B,
                stability_counter: 4,
                ..ProtocolState::default()
            },
        )
        .unwrap();

        ContainmentStore::new(h.ctx.clone())
            .engage("telemetry_validator", "signature mismatch")
            .unwrap();
        let state: ProtocolState = load_json(&h.ctx.paths().protocol_state).unwrap();
        assert_eq!(state.trust_tier, TrustTier::None);
        assert_eq!(state.stability_counter, 0);
        assert!(state.training_active);
    }

    #[test]
    fn unreadable_record_counts_as_active() {
        let h = Harness::new();
        let store = ContainmentStore::new(h.ctx.clone());
        let path = &h.ctx.paths().containment;
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"garbage").unwrap();
        assert!(store.is_active());
    }

    #[cfg(unix)]
    #[test]
    fn unstattable_record_counts_as_active() {
        use std::os::unix::fs::PermissionsExt;

        let h = Harness::new();
        let store = ContainmentStore::new(h.ctx.clone());
        store.engage("validator", "checksum mismatch").unwrap();
        let dir = h.ctx.paths().containment.parent().unwrap().to_path_buf();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o000)).unwrap();
        // Root bypasses directory permissions; the record stays readable there.
        let active = store.is_active();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(active);
    }

    #[test]
    fn clear_is_audited_once() {
        let h = Harness::new();
        let store = ContainmentStore::new(h.ctx.clone());
        assert!(!store.clear("nothing to clear").unwrap());
        store.engage("recovery", "orphaned training").unwrap();
        assert!(store.clear("operator reviewed crash").unwrap());
        assert!(!store.is_active());
        let trail = AuditLog::read_all(&h.ctx.paths().incident_log).unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].event, "CONTAINMENT_CLEARED");
        assert_eq!(trail[0].details["previous_reason"], "orphaned training");
    }
}
