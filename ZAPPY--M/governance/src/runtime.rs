use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use shared_event_bus::EventPublisher;
use shared_logging::LogLevel;

use crate::{
    admission::{HuntEligibility, ProtocolState, TrainingAdmissionProtocol},
    clock::{Clock, SystemClock},
    config::GovernanceConfig,
    containment::{ContainmentRecord, ContainmentStore},
    context::GovernanceContext,
    error::GovernanceResult,
    integrity::TelemetryIntegrityValidator,
    journal::GovernanceJournal,
    mode_mutex::{ModeMutex, MutexRecord, MutexRejection},
    recovery::{RecoveryGuard, RecoveryReport},
};

/// Builder for [`GovernanceRuntime`].
pub struct GovernanceRuntimeBuilder {
    config: GovernanceConfig,
    clock: Option<Arc<dyn Clock>>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl GovernanceRuntimeBuilder {
    /// Starts from a configuration.
    #[must_use]
    pub fn new(config: GovernanceConfig) -> Self {
        Self {
            config,
            clock: None,
            event_publisher: None,
        }
    }

    /// Overrides the time source.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Publishes governance events to `publisher` instead of the configured
    /// event log.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Opens the sinks and wires the components.
    pub fn build(self) -> GovernanceResult<GovernanceRuntime> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let journal = match self.event_publisher {
            Some(publisher) => {
                let paths = &self.config.paths;
                GovernanceJournal::builder(
                    &self.config.source,
                    &paths.incident_log,
                    &paths.recovery_log,
                )
                .operational_log(&paths.operational_log)
                .event_publisher(publisher)
                .clock(Arc::clone(&clock))
                .build()?
            }
            None => GovernanceJournal::from_config(&self.config, Arc::clone(&clock))?,
        };
        let ctx = Arc::new(GovernanceContext::from_parts(self.config, clock, journal));
        Ok(GovernanceRuntime::from_context(ctx))
    }
}

/// Why HUNT entry was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum HuntRefusal {
    /// Containment is active.
    Contained(ContainmentRecord),
    /// The lockout has not elapsed, or the clock looks rolled back.
    LockedOut(HuntEligibility),
    /// The mode mutex refused the transition.
    Mutex(MutexRejection),
}

impl fmt::Display for HuntRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contained(record) => write!(f, "containment active: {}", record.reason),
            Self::LockedOut(HuntEligibility::Locked { remaining, .. }) => {
                write!(f, "hunt lockout: {remaining:.0}s remaining")
            }
            Self::LockedOut(HuntEligibility::ClockRollback { .. }) => {
                f.write_str("hunt denied: monotonic clock regressed")
            }
            Self::LockedOut(_) => f.write_str("hunt denied: no training start recorded"),
            Self::Mutex(rejection) => write!(f, "mode mutex: {rejection}"),
        }
    }
}

/// Result of [`GovernanceRuntime::enter_hunt`].
#[derive(Debug, Clone, PartialEq)]
pub enum HuntEntry {
    /// HUNT is now the active mode.
    Entered(MutexRecord),
    /// Nothing changed.
    Refused(HuntRefusal),
}

/// Point-in-time view of every governance record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GovernanceStatus {
    /// Mode mutex record.
    pub mode: MutexRecord,
    /// Admission protocol state.
    pub protocol: ProtocolState,
    /// Active containment, if any.
    pub containment: Option<ContainmentRecord>,
    /// HUNT eligibility at the time of the snapshot.
    pub hunt: HuntEligibility,
}

/// Facade wiring the governance components over one context.
#[derive(Debug)]
pub struct GovernanceRuntime {
    ctx: Arc<GovernanceContext>,
    mutex: ModeMutex,
    validator: TelemetryIntegrityValidator,
    recovery: RecoveryGuard,
    protocol: TrainingAdmissionProtocol,
    containment: ContainmentStore,
    startup: Mutex<Option<RecoveryReport>>,
}

impl GovernanceRuntime {
    /// Returns a builder.
    #[must_use]
    pub fn builder(config: GovernanceConfig) -> GovernanceRuntimeBuilder {
        GovernanceRuntimeBuilder::new(config)
    }

    /// Wires components over an existing context.
    #[must_use]
    pub fn from_context(ctx: Arc<GovernanceContext>) -> Self {
        Self {
            mutex: ModeMutex::new(Arc::clone(&ctx)),
            validator: TelemetryIntegrityValidator::new(Arc::clone(&ctx)),
            recovery: RecoveryGuard::new(Arc::clone(&ctx)),
            protocol: TrainingAdmissionProtocol::new(Arc::clone(&ctx)),
            containment: ContainmentStore::new(Arc::clone(&ctx)),
            startup: Mutex::new(None),
            ctx,
        }
    }

    /// Runs crash recovery once per runtime; later calls return the first
    /// report.
    pub fn startup(&self) -> GovernanceResult<RecoveryReport> {
        let mut startup = self.startup.lock();
        if let Some(report) = startup.as_ref() {
            return Ok(report.clone());
        }
        let report = self.recovery.run()?;
        self.ctx.journal().log(
            LogLevel::Info,
            "governance.runtime.started",
            json!({ "recovery": &report }),
        );
        *startup = Some(report.clone());
        Ok(report)
    }

    /// Enters HUNT if containment is clear and the lockout has elapsed.
    pub fn enter_hunt(&self) -> GovernanceResult<HuntEntry> {
        let _guard = self.ctx.exclusive()?;
        if let Some(record) = self.containment.current() {
            return Ok(HuntEntry::Refused(HuntRefusal::Contained(record)));
        }
        if !self.protocol.is_hunt_allowed()? {
            return Ok(HuntEntry::Refused(HuntRefusal::LockedOut(
                self.protocol.hunt_eligibility(),
            )));
        }
        let outcome = self.mutex.request_hunt()?;
        Ok(match outcome.rejection() {
            Some(rejection) => HuntEntry::Refused(HuntRefusal::Mutex(rejection)),
            None => HuntEntry::Entered(self.mutex.current()),
        })
    }

    /// Snapshot of every record. Writes nothing.
    #[must_use]
    pub fn status(&self) -> GovernanceStatus {
        GovernanceStatus {
            mode: self.mutex.current(),
            protocol: self.protocol.state(),
            containment: self.containment.current(),
            hunt: self.protocol.hunt_eligibility(),
        }
    }

    /// Lifts containment after operator review.
    pub fn clear_containment(&self, reason: &str) -> GovernanceResult<bool> {
        self.containment.clear(reason)
    }

    /// Shared context.
    #[must_use]
    pub const fn context(&self) -> &Arc<GovernanceContext> {
        &self.ctx
    }

    /// Mode mutex.
    #[must_use]
    pub const fn mode_mutex(&self) -> &ModeMutex {
        &self.mutex
    }

    /// Telemetry validator.
    #[must_use]
    pub const fn validator(&self) -> &TelemetryIntegrityValidator {
        &self.validator
    }

    /// Recovery guard.
    #[must_use]
    pub const fn recovery(&self) -> &RecoveryGuard {
        &self.recovery
    }

    /// Admission protocol.
    #[must_use]
    pub const fn protocol(&self) -> &TrainingAdmissionProtocol {
        &self.protocol
    }

    /// Containment store.
    #[must_use]
    pub const fn containment(&self) -> &ContainmentStore {
        &self.containment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        admission::{AdmissionOutcome, EvaluationMetrics, HUNT_LOCKOUT_SECS, STABILITY_WINDOW},
        clock::ManualClock,
        context::testing::Harness,
        mode_mutex::OperatingMode,
    };
    use shared_event_bus::MemoryEventBus;

    fn runtime(h: &Harness) -> GovernanceRuntime {
        GovernanceRuntime::from_context(h.ctx.clone())
    }

    fn train_then_stop(h: &Harness, rt: &GovernanceRuntime) {
        let key = h.install_key();
        h.publish_snapshot(&key, 10.0, |_| {});
        h.publish_green_signals();
        let metrics = EvaluationMetrics {
            precision: 0.9,
            recall: 0.9,
            false_positive_rate: 0.01,
            kl_divergence: 0.01,
        };
        for _ in 0..STABILITY_WINDOW {
            rt.protocol().record_evaluation(&metrics, false).unwrap();
        }
        assert!(matches!(
            rt.protocol().start_training().unwrap(),
            AdmissionOutcome::Started { .. }
        ));
        rt.protocol().stop_training().unwrap();
    }

    #[test]
    fn startup_runs_recovery_once() {
        let h = Harness::new();
        let rt = runtime(&h);
        assert!(rt.startup().unwrap().is_clean());
        assert!(rt.startup().unwrap().is_clean());
    }

    #[test]
    fn hunt_waits_for_the_lockout() {
        let h = Harness::new();
        let rt = runtime(&h);
        assert!(matches!(
            rt.enter_hunt().unwrap(),
            HuntEntry::Refused(HuntRefusal::LockedOut(HuntEligibility::NoTrainingStart))
        ));

        train_then_stop(&h, &rt);
        let refused = rt.enter_hunt().unwrap();
        let HuntEntry::Refused(refusal) = refused else {
            panic!("hunt entered during lockout");
        };
        assert!(refusal.to_string().contains("remaining"));

        h.clock.advance(HUNT_LOCKOUT_SECS);
        let HuntEntry::Entered(record) = rt.enter_hunt().unwrap() else {
            panic!("hunt refused after lockout");
        };
        assert_eq!(record.mode, OperatingMode::Hunt);
        assert_eq!(rt.status().mode.mode, OperatingMode::Hunt);
    }

    #[test]
    fn containment_blocks_hunt_until_cleared() {
        let h = Harness::new();
        let rt = runtime(&h);
        train_then_stop(&h, &rt);
        h.clock.advance(HUNT_LOCKOUT_SECS);
        rt.containment().engage("operator", "audit hold").unwrap();
        assert!(matches!(
            rt.enter_hunt().unwrap(),
            HuntEntry::Refused(HuntRefusal::Contained(_))
        ));
        assert!(rt.status().containment.is_some());

        assert!(rt.clear_containment("audit complete").unwrap());
        assert!(matches!(rt.enter_hunt().unwrap(), HuntEntry::Entered(_)));
    }

    #[test]
    fn hunt_blocked_while_training_holds_the_mutex() {
        let h = Harness::new();
        let rt = runtime(&h);
        train_then_stop(&h, &rt);
        rt.mode_mutex().request_train().unwrap();
        h.clock.advance(HUNT_LOCKOUT_SECS);
        assert!(matches!(
            rt.enter_hunt().unwrap(),
            HuntEntry::Refused(HuntRefusal::Mutex(MutexRejection::MutexBlocked))
        ));
    }

    #[test]
    fn builder_routes_events_to_injected_publisher() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MemoryEventBus::new(32));
        let rt = GovernanceRuntime::builder(
            GovernanceConfig::rooted_at(dir.path()).without_key_env(),
        )
        .clock(Arc::new(ManualClock::new(5.0)))
        .event_publisher(bus.clone())
        .build()
        .unwrap();
        rt.mode_mutex().request_train().unwrap();
        assert_eq!(bus.of_type("governance.mode.transition").len(), 1);
        let status = serde_json::to_value(rt.status()).unwrap();
        assert_eq!(status["mode"]["mode"], 1);
        assert_eq!(status["hunt"]["status"], "no_training_start");
    }
}
