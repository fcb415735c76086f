//! Training admission: the twelve gates, trust-tier progression, and the
//! HUNT lockout.
//!
//! [`TrainingAdmissionProtocol`] is the only writer of [`ProtocolState`]
//! apart from crash recovery. Every mutation is a locked read-modify-write
//! followed by an atomic replace of the state file.

/// The twelve admission gates and their report.
pub mod gates;
/// Trust tiers and promotion thresholds.
pub mod tiers;

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

pub use gates::{GateId, GateReport, GateResult};
pub use tiers::{EvaluationMetrics, TierThresholds, TrustTier, STABILITY_WINDOW};

use crate::{
    containment::ContainmentStore,
    context::GovernanceContext,
    error::GovernanceResult,
    integrity::TelemetryIntegrityValidator,
    mode_mutex::{ModeMutex, MutexRejection, OperatingMode},
    signals::GateSignals,
    store::{load_json, write_json_atomic},
};

const COMPONENT: &str = "admission";

/// Minimum monotonic time between training start and HUNT: 72 hours.
pub const HUNT_LOCKOUT_SECS: f64 = 259_200.0;

/// Persisted training and trust state.
///
/// A missing or unreadable file loads as the inactive default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolState {
    /// Whether a training run is in progress.
    pub training_active: bool,
    /// Wall-clock start of the latest run.
    pub training_start_wall_time: Option<DateTime<Utc>>,
    /// Monotonic start of the latest run, seconds.
    pub training_start_monotonic: Option<f64>,
    /// Monotonic seconds since start, as of the last HUNT check.
    pub elapsed_monotonic: f64,
    /// Monotonic instant at which the HUNT lockout ends.
    pub hunt_lockout_deadline_monotonic: Option<f64>,
    /// Whether HUNT is still locked out.
    pub hunt_locked: bool,
    /// Current trust tier.
    pub trust_tier: TrustTier,
    /// Consecutive qualifying evaluations.
    pub stability_counter: u32,
}

/// Why the protocol refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolRejection {
    /// Start requested during an active run.
    TrainingAlreadyActive,
    /// Stop or promotion requested with no active run.
    TrainingInactive,
    /// At least one admission gate failed.
    GatesUnmet,
    /// Containment holds the system at the safe tier.
    Contained,
}

impl ProtocolRejection {
    /// Stable reason code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::TrainingAlreadyActive => "TRAINING_ALREADY_ACTIVE",
            Self::TrainingInactive => "TRAINING_INACTIVE",
            Self::GatesUnmet => "GATES_UNMET",
            Self::Contained => "CONTAINED",
        }
    }
}

impl fmt::Display for ProtocolRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of [`TrainingAdmissionProtocol::start_training`].
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionOutcome {
    /// Training started.
    Started {
        /// State after the start.
        state: ProtocolState,
        /// Gate report that admitted the run.
        report: GateReport,
    },
    /// Nothing was written.
    Rejected {
        /// Refusal reason.
        reason: ProtocolRejection,
        /// Fresh gate report; empty when gates were not evaluated.
        report: GateReport,
    },
}

impl AdmissionOutcome {
    /// Whether training started.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        matches!(self, Self::Started { .. })
    }

    /// The gate report either way.
    #[must_use]
    pub const fn report(&self) -> &GateReport {
        match self {
            Self::Started { report, .. } | Self::Rejected { report, .. } => report,
        }
    }
}

/// Result of [`TrainingAdmissionProtocol::record_evaluation`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationRecord {
    /// Whether the batch met the target thresholds.
    pub qualified: bool,
    /// Whether a drift alert forced a reset.
    pub drift_alert: bool,
    /// Counter after the update.
    pub stability_counter: u32,
    /// Thresholds the batch was judged against.
    pub target: TierThresholds,
}

/// Result of [`TrainingAdmissionProtocol::try_advance_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Promoted one tier; the counter restarted at zero.
    Promoted {
        /// Tier before.
        from: TrustTier,
        /// Tier after.
        to: TrustTier,
    },
    /// The stability window has not been reached.
    Insufficient {
        /// Current counter.
        stability_counter: u32,
    },
    /// Already at C.
    Terminal,
    /// Refused without inspection.
    Rejected(ProtocolRejection),
}

/// Result of [`TrainingAdmissionProtocol::stop_training`].
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    /// Training stopped.
    Stopped(ProtocolState),
    /// Nothing was written.
    Rejected(ProtocolRejection),
}

/// HUNT eligibility computed from protocol state and a monotonic reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HuntEligibility {
    /// No training start was ever recorded.
    NoTrainingStart,
    /// The monotonic clock reads earlier than the recorded start.
    ClockRollback {
        /// Recorded start.
        start: f64,
        /// Current reading.
        now: f64,
    },
    /// Lockout still running.
    Locked {
        /// Seconds since start.
        elapsed: f64,
        /// Seconds left.
        remaining: f64,
    },
    /// Lockout elapsed.
    Allowed {
        /// Seconds since start.
        elapsed: f64,
    },
}

impl HuntEligibility {
    /// Whether HUNT may be entered.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Pure lockout decision; never grants on an apparent clock regression.
#[must_use]
pub fn hunt_eligibility(state: &ProtocolState, now: f64) -> HuntEligibility {
    let Some(start) = state.training_start_monotonic else {
        return HuntEligibility::NoTrainingStart;
    };
    if !now.is_finite() || !start.is_finite() || now < start {
        return HuntEligibility::ClockRollback { start, now };
    }
    let elapsed = now - start;
    if elapsed >= HUNT_LOCKOUT_SECS {
        HuntEligibility::Allowed { elapsed }
    } else {
        HuntEligibility::Locked {
            elapsed,
            remaining: HUNT_LOCKOUT_SECS - elapsed,
        }
    }
}

/// The single authority for starting training, progressing trust, and
/// unlocking HUNT.
#[derive(Debug, Clone)]
pub struct TrainingAdmissionProtocol {
    ctx: Arc<GovernanceContext>,
    mutex: ModeMutex,
    containment: ContainmentStore,
    validator: TelemetryIntegrityValidator,
    signals: GateSignals,
}

impl TrainingAdmissionProtocol {
    /// Creates the protocol.
    #[must_use]
    pub fn new(ctx: Arc<GovernanceContext>) -> Self {
        Self {
            mutex: ModeMutex::new(Arc::clone(&ctx)),
            containment: ContainmentStore::new(Arc::clone(&ctx)),
            validator: TelemetryIntegrityValidator::new(Arc::clone(&ctx)),
            signals: GateSignals::new(&ctx.paths().signals_dir),
            ctx,
        }
    }

    /// Persisted state, or the inactive default.
    #[must_use]
    pub fn state(&self) -> ProtocolState {
        load_json(&self.ctx.paths().protocol_state).unwrap_or_default()
    }

    fn persist(&self, state: &ProtocolState) -> GovernanceResult<()> {
        write_json_atomic(&self.ctx.paths().protocol_state, state)
    }

    /// Evaluates all twelve gates fresh. Writes nothing.
    pub fn evaluate_gates(&self) -> GovernanceResult<GateReport> {
        let state = self.state();
        let telemetry = self.validator.assess()?;
        let mode = self.mutex.current().mode;
        let containment = self.containment.current();
        let mut report = GateReport::default();

        let signal = |reading: crate::signals::SignalReading| {
            GateResult::from_check(
                if reading.ok { Ok(()) } else { Err(reading.detail.clone()) },
                &reading.detail,
            )
        };
        report.record(GateId::CiGreen, signal(self.signals.ci_green()));
        report.record(GateId::DeterminismPass, signal(self.signals.determinism_pass()));
        report.record(GateId::CrossDevicePass, signal(self.signals.cross_device_pass()));
        report.record(
            GateId::FreezeValid,
            GateResult::from_check(telemetry.freeze, "telemetry frozen"),
        );
        report.record(
            GateId::NoContainment,
            GateResult::from_check(
                containment.map_or(Ok(()), |record| {
                    Err(format!("containment active: {}", record.reason))
                }),
                "no containment",
            ),
        );
        report.record(
            GateId::TelemetrySchema,
            GateResult::from_check(telemetry.schema, "schema valid"),
        );
        report.record(
            GateId::MutexNotHunt,
            GateResult::from_check(
                if mode == OperatingMode::Hunt {
                    Err("mode mutex is in HUNT".to_string())
                } else {
                    Ok(())
                },
                &format!("mode {mode}"),
            ),
        );
        report.record(GateId::ThermalClear, signal(self.signals.thermal_clear()));
        report.record(
            GateId::SignatureValid,
            GateResult::from_check(telemetry.signature, "signature valid"),
        );
        report.record(
            GateId::SecretKeyValid,
            GateResult::from_check(telemetry.key, "secret key valid"),
        );
        report.record(GateId::NoDriftAlert, signal(self.signals.drift_clear()));
        report.record(
            GateId::StabilityWindow,
            GateResult::from_check(
                if state.stability_counter >= STABILITY_WINDOW {
                    Ok(())
                } else {
                    Err(format!(
                        "stability counter {} of {STABILITY_WINDOW}",
                        state.stability_counter
                    ))
                },
                &format!("stability counter {}", state.stability_counter),
            ),
        );
        Ok(report)
    }

    /// Starts a training run if every gate passes.
    ///
    /// The stability counter carries over into the run.
    pub fn start_training(&self) -> GovernanceResult<AdmissionOutcome> {
        let _guard = self.ctx.exclusive()?;
        let mut state = self.state();
        if state.training_active {
            return Ok(AdmissionOutcome::Rejected {
                reason: ProtocolRejection::TrainingAlreadyActive,
                report: GateReport::default(),
            });
        }

        let report = self.evaluate_gates()?;
        if !report.all_passed() {
            let failed: Vec<&str> = report.failures().iter().map(|gate| gate.label()).collect();
            self.ctx.journal().log(
                LogLevel::Warn,
                "governance.training.rejected",
                json!({ "reason": ProtocolRejection::GatesUnmet.code(), "failed_gates": failed }),
            );
            return Ok(AdmissionOutcome::Rejected {
                reason: ProtocolRejection::GatesUnmet,
                report,
            });
        }

        match self.mutex.request_train()? {
            outcome if outcome.is_granted() => {}
            outcome if outcome.rejection() == Some(MutexRejection::AlreadyActive) => {}
            _ => {
                // HUNT was ruled out by the gates under this same lock.
                return Ok(AdmissionOutcome::Rejected {
                    reason: ProtocolRejection::GatesUnmet,
                    report,
                });
            }
        }

        let clock = self.ctx.clock();
        let start = clock.monotonic_secs();
        state.training_active = true;
        state.trust_tier = TrustTier::A;
        state.training_start_wall_time = Some(clock.wall_now());
        state.training_start_monotonic = Some(start);
        state.elapsed_monotonic = 0.0;
        state.hunt_lockout_deadline_monotonic = Some(start + HUNT_LOCKOUT_SECS);
        state.hunt_locked = true;
        self.persist(&state)?;

        let payload = json!({
            "trust_tier": state.trust_tier.label(),
            "start_monotonic": start,
            "hunt_lockout_deadline_monotonic": state.hunt_lockout_deadline_monotonic,
            "stability_counter": state.stability_counter,
        });
        self.ctx
            .journal()
            .log(LogLevel::Info, "governance.training.started", payload.clone());
        self.ctx.journal().event("governance.training.started", payload);
        Ok(AdmissionOutcome::Started { state, report })
    }

    /// Scores one evaluation batch against the next tier's thresholds.
    ///
    /// Runs whether or not training is active: the stability gate needs a
    /// counter before the first start. Nothing counts while contained.
    pub fn record_evaluation(
        &self,
        metrics: &EvaluationMetrics,
        drift_alert: bool,
    ) -> GovernanceResult<EvaluationRecord> {
        let _guard = self.ctx.exclusive()?;
        let mut state = self.state();
        let contained = self.containment.is_active();
        let target = TierThresholds::target_for(state.trust_tier);
        let qualified = !contained && !drift_alert && target.qualifies(metrics);
        state.stability_counter = if qualified {
            state.stability_counter.saturating_add(1)
        } else {
            0
        };
        self.persist(&state)?;

        let record = EvaluationRecord {
            qualified,
            drift_alert,
            stability_counter: state.stability_counter,
            target,
        };
        self.ctx.journal().log(
            if qualified { LogLevel::Info } else { LogLevel::Warn },
            "governance.evaluation.recorded",
            json!({
                "qualified": qualified,
                "drift_alert": drift_alert,
                "contained": contained,
                "stability_counter": state.stability_counter,
                "trust_tier": state.trust_tier.label(),
                "metrics": metrics,
            }),
        );
        Ok(record)
    }

    /// Promotes one tier once the stability window is met.
    pub fn try_advance_mode(&self) -> GovernanceResult<AdvanceOutcome> {
        let _guard = self.ctx.exclusive()?;
        let mut state = self.state();
        if !state.training_active {
            return Ok(AdvanceOutcome::Rejected(ProtocolRejection::TrainingInactive));
        }
        if self.containment.is_active() {
            return Ok(AdvanceOutcome::Rejected(ProtocolRejection::Contained));
        }
        let Some(next) = state.trust_tier.next() else {
            return Ok(AdvanceOutcome::Terminal);
        };
        if state.stability_counter < STABILITY_WINDOW {
            return Ok(AdvanceOutcome::Insufficient {
                stability_counter: state.stability_counter,
            });
        }

        let from = state.trust_tier;
        state.trust_tier = next;
        state.stability_counter = 0;
        self.persist(&state)?;

        let payload = json!({ "from": from.label(), "to": next.label() });
        self.ctx
            .journal()
            .log(LogLevel::Info, "governance.tier.promoted", payload.clone());
        self.ctx.journal().event("governance.tier.promoted", payload);
        Ok(AdvanceOutcome::Promoted { from, to: next })
    }

    /// Whether HUNT may be entered now. Refreshes the persisted lockout
    /// fields; an apparent clock rollback is denied and audited.
    pub fn is_hunt_allowed(&self) -> GovernanceResult<bool> {
        let _guard = self.ctx.exclusive()?;
        let mut state = self.state();
        let now = self.ctx.clock().monotonic_secs();
        let eligibility = hunt_eligibility(&state, now);

        match eligibility {
            HuntEligibility::NoTrainingStart => return Ok(false),
            HuntEligibility::ClockRollback { start, now } => {
                self.ctx.journal().incident(
                    COMPONENT,
                    "CLOCK_ROLLBACK",
                    "monotonic clock reads earlier than the recorded training start",
                    json!({ "start_monotonic": start, "now_monotonic": now }),
                )?;
                if !state.hunt_locked {
                    state.hunt_locked = true;
                    self.persist(&state)?;
                }
                return Ok(false);
            }
            HuntEligibility::Locked { elapsed, .. } | HuntEligibility::Allowed { elapsed } => {
                let locked = !eligibility.is_allowed();
                let elapsed_changed = state.elapsed_monotonic.to_bits() != elapsed.to_bits();
                if state.hunt_locked != locked || elapsed_changed {
                    state.elapsed_monotonic = elapsed;
                    state.hunt_locked = locked;
                    self.persist(&state)?;
                }
            }
        }
        Ok(eligibility.is_allowed())
    }

    /// Read-only lockout view for status reports.
    #[must_use]
    pub fn hunt_eligibility(&self) -> HuntEligibility {
        hunt_eligibility(&self.state(), self.ctx.clock().monotonic_secs())
    }

    /// Ends the run. Start times stay so the lockout keeps counting.
    pub fn stop_training(&self) -> GovernanceResult<StopOutcome> {
        let _guard = self.ctx.exclusive()?;
        let mut state = self.state();
        if !state.training_active {
            return Ok(StopOutcome::Rejected(ProtocolRejection::TrainingInactive));
        }
        state.training_active = false;
        state.trust_tier = TrustTier::None;
        state.stability_counter = 0;
        self.persist(&state)?;

        if self.mutex.current().mode == OperatingMode::Train {
            self.mutex.release()?;
        }
        self.ctx
            .journal()
            .log(LogLevel::Info, "governance.training.stopped", json!({}));
        self.ctx
            .journal()
            .event("governance.training.stopped", json!({}));
        Ok(StopOutcome::Stopped(state))
    }

    /// Replaces the state with the inactive default. Used by recovery.
    pub fn reset(&self, reason: &str) -> GovernanceResult<()> {
        let _guard = self.ctx.exclusive()?;
        self.persist(&ProtocolState::default())?;
        self.ctx.journal().log(
            LogLevel::Warn,
            "governance.protocol.reset",
            json!({ "reason": reason }),
        );
        Ok(())
    }
}
