use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zappy_governance::{
    integrity::{write_secret_key, SecretKey},
    AdmissionOutcome, AdvanceOutcome, EvaluationMetrics, GovernanceConfig, GovernanceRuntime,
    HuntEntry, MutexOutcome, StopOutcome, ValidationOutcome,
};

#[derive(Parser, Debug)]
#[command(name = "govctl", version, about = "Zappy training/hunting governance control")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Governance root when no configuration file is given.
    #[arg(long, global = true, default_value = "ZAPPY--M/governance/var")]
    root: PathBuf,
    /// Durable event log.
    #[arg(long, global = true)]
    event_log: Option<PathBuf>,
    /// Print machine-readable JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs crash recovery.
    Recover,
    /// Shows mutex, protocol, containment, and hunt status.
    Status,
    /// Inspects or changes the operating mode.
    Mode {
        #[command(subcommand)]
        action: ModeAction,
    },
    /// Validates the published telemetry snapshot.
    Validate {
        /// Report without engaging containment or moving the baseline.
        #[arg(long)]
        dry_run: bool,
    },
    /// Evaluates the twelve admission gates.
    Gates,
    /// Starts training if every gate passes.
    StartTraining,
    /// Stops the active training run.
    StopTraining,
    /// Records one evaluation batch.
    Evaluate {
        #[arg(long)]
        precision: f64,
        #[arg(long)]
        recall: f64,
        #[arg(long)]
        fpr: f64,
        #[arg(long)]
        kl: f64,
        /// Drift detector raised an alert for this batch.
        #[arg(long)]
        drift: bool,
    },
    /// Promotes the trust tier when the stability window is met.
    Advance,
    /// Reports whether the HUNT lockout has elapsed.
    HuntStatus,
    /// Lifts containment after review.
    ClearContainment {
        #[arg(long)]
        reason: String,
    },
    /// Generates a fresh signing key.
    Keygen {
        /// Replace an existing key.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ModeAction {
    /// Prints the mutex record.
    Show,
    /// Requests TRAIN.
    RequestTrain,
    /// Requests HUNT through the lockout and containment checks.
    RequestHunt,
    /// Returns to IDLE.
    Release,
}

impl Commands {
    /// Read-only commands skip the startup recovery pass.
    fn mutates(&self) -> bool {
        !matches!(
            self,
            Self::Status
                | Self::Gates
                | Self::Keygen { .. }
                | Self::Validate { dry_run: true }
                | Self::Mode {
                    action: ModeAction::Show
                }
        )
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => GovernanceConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => GovernanceConfig::rooted_at(&cli.root),
    };
    if let Some(event_log) = &cli.event_log {
        config = config.with_event_log(event_log);
    }

    if let Commands::Keygen { force } = cli.command {
        return keygen(&config, force);
    }

    let runtime = GovernanceRuntime::builder(config)
        .build()
        .context("opening governance state")?;
    if cli.command.mutates() && !matches!(cli.command, Commands::Recover) {
        let report = runtime.startup().context("startup recovery")?;
        if !report.is_clean() {
            eprintln!("recovery: {} action(s) taken", report.actions.len());
        }
    }
    run(&runtime, cli.command, cli.json)
}

fn keygen(config: &GovernanceConfig, force: bool) -> Result<()> {
    let path = &config.paths.secret_key;
    if path.exists() && !force {
        bail!("{} already exists; pass --force to replace it", path.display());
    }
    write_secret_key(path, &SecretKey::generate())
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "signing key generated");
    println!("wrote {}", path.display());
    Ok(())
}

fn emit(as_json: bool, value: &serde_json::Value, text: impl FnOnce() -> String) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

fn mode_outcome(as_json: bool, outcome: &MutexOutcome) -> Result<()> {
    match outcome {
        MutexOutcome::Granted(record) => emit(
            as_json,
            &json!({ "granted": true, "record": record }),
            || format!("granted: mode {}", record.mode),
        ),
        MutexOutcome::Rejected { reason, current } => emit(
            as_json,
            &json!({ "granted": false, "reason": reason.code(), "record": current }),
            || format!("rejected: {reason} (mode {})", current.mode),
        ),
    }
}

#[allow(clippy::too_many_lines)]
fn run(runtime: &GovernanceRuntime, command: Commands, as_json: bool) -> Result<()> {
    match command {
        Commands::Recover => {
            let report = runtime.startup()?;
            emit(as_json, &serde_json::to_value(&report)?, || {
                if report.is_clean() {
                    "recovery: clean".to_string()
                } else {
                    format!("recovery: {:?}", report.actions)
                }
            })
        }
        Commands::Status => {
            let status = runtime.status();
            let value = serde_json::to_value(&status)?;
            emit(as_json, &value, || {
                serde_json::to_string_pretty(&value).unwrap_or_default()
            })
        }
        Commands::Mode { action } => {
            let mutex = runtime.mode_mutex();
            match action {
                ModeAction::Show => {
                    let record = mutex.current();
                    emit(as_json, &serde_json::to_value(&record)?, || {
                        format!("mode {} (source {})", record.mode, record.source)
                    })
                }
                ModeAction::RequestTrain => mode_outcome(as_json, &mutex.request_train()?),
                ModeAction::Release => mode_outcome(as_json, &mutex.release()?),
                ModeAction::RequestHunt => match runtime.enter_hunt()? {
                    HuntEntry::Entered(record) => emit(
                        as_json,
                        &json!({ "granted": true, "record": record }),
                        || "granted: mode HUNT".to_string(),
                    ),
                    HuntEntry::Refused(refusal) => emit(
                        as_json,
                        &json!({ "granted": false, "reason": refusal.to_string() }),
                        || format!("refused: {refusal}"),
                    ),
                },
            }
        }
        Commands::Validate { dry_run } => {
            let validator = runtime.validator();
            let outcome = if dry_run {
                validator.inspect()?
            } else {
                validator.validate()?
            };
            match outcome {
                ValidationOutcome::Passed {
                    monotonic_timestamp,
                } => emit(
                    as_json,
                    &json!({ "passed": true, "monotonic_timestamp": monotonic_timestamp }),
                    || format!("telemetry valid (monotonic {monotonic_timestamp})"),
                ),
                ValidationOutcome::Failed(failure) => {
                    emit(
                        as_json,
                        &json!({ "passed": false, "failure": failure }),
                        || {
                            format!(
                                "check {} failed: {failure}{}",
                                failure.check.ordinal(),
                                if dry_run { "" } else { " (containment engaged)" }
                            )
                        },
                    )?;
                    std::process::exit(2);
                }
            }
        }
        Commands::Gates => {
            let report = runtime.protocol().evaluate_gates()?;
            emit(as_json, &serde_json::to_value(&report)?, || {
                report.to_string().trim_end().to_string()
            })
        }
        Commands::StartTraining => match runtime.protocol().start_training()? {
            AdmissionOutcome::Started { state, .. } => emit(
                as_json,
                &json!({ "started": true, "state": state }),
                || {
                    format!(
                        "training started at tier {}; hunt locked until monotonic {:?}",
                        state.trust_tier, state.hunt_lockout_deadline_monotonic
                    )
                },
            ),
            AdmissionOutcome::Rejected { reason, report } => {
                emit(
                    as_json,
                    &json!({ "started": false, "reason": reason.code(), "gates": report }),
                    || format!("rejected: {reason}\n{}", report.to_string().trim_end()),
                )?;
                std::process::exit(2);
            }
        },
        Commands::StopTraining => match runtime.protocol().stop_training()? {
            StopOutcome::Stopped(state) => emit(
                as_json,
                &json!({ "stopped": true, "state": state }),
                || "training stopped".to_string(),
            ),
            StopOutcome::Rejected(reason) => emit(
                as_json,
                &json!({ "stopped": false, "reason": reason.code() }),
                || format!("rejected: {reason}"),
            ),
        },
        Commands::Evaluate {
            precision,
            recall,
            fpr,
            kl,
            drift,
        } => {
            let metrics = EvaluationMetrics {
                precision,
                recall,
                false_positive_rate: fpr,
                kl_divergence: kl,
            };
            let record = runtime.protocol().record_evaluation(&metrics, drift)?;
            emit(
                as_json,
                &json!({
                    "qualified": record.qualified,
                    "drift_alert": record.drift_alert,
                    "stability_counter": record.stability_counter,
                    "target": record.target,
                }),
                || {
                    format!(
                        "{} (stability counter {})",
                        if record.qualified { "qualified" } else { "reset" },
                        record.stability_counter
                    )
                },
            )
        }
        Commands::Advance => {
            let outcome = runtime.protocol().try_advance_mode()?;
            let (value, text) = match outcome {
                AdvanceOutcome::Promoted { from, to } => (
                    json!({ "promoted": true, "from": from, "to": to }),
                    format!("promoted {from} -> {to}"),
                ),
                AdvanceOutcome::Insufficient { stability_counter } => (
                    json!({ "promoted": false, "stability_counter": stability_counter }),
                    format!("not promoted: stability counter {stability_counter}"),
                ),
                AdvanceOutcome::Terminal => (
                    json!({ "promoted": false, "reason": "TERMINAL" }),
                    "not promoted: tier C is terminal".to_string(),
                ),
                AdvanceOutcome::Rejected(reason) => (
                    json!({ "promoted": false, "reason": reason.code() }),
                    format!("rejected: {reason}"),
                ),
            };
            emit(as_json, &value, || text)
        }
        Commands::HuntStatus => {
            let allowed = runtime.protocol().is_hunt_allowed()?;
            let eligibility = runtime.protocol().hunt_eligibility();
            emit(
                as_json,
                &json!({ "allowed": allowed, "eligibility": eligibility }),
                || format!("hunt allowed: {allowed} ({eligibility:?})"),
            )
        }
        Commands::ClearContainment { reason } => {
            let cleared = runtime.clear_containment(&reason)?;
            emit(as_json, &json!({ "cleared": cleared }), || {
                if cleared {
                    "containment cleared".to_string()
                } else {
                    "no containment was active".to_string()
                }
            })
        }
        Commands::Keygen { .. } => unreachable!("handled before the runtime is opened"),
    }
}
