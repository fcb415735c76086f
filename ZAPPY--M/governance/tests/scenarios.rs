use std::{path::Path, sync::Arc};

use serde_json::json;
use shared_logging::AuditLog;
use tempfile::tempdir;
use zappy_governance::{
    integrity::{
        seal::{compute_checksum, seal_snapshot, write_secret_key},
        TelemetryMetrics,
    },
    signals::files,
    AdmissionOutcome, EvaluationMetrics, GateSignals, GovernanceConfig, GovernanceRuntime,
    HuntEntry, ManualClock, OperatingMode, SecretKey, TelemetryCheck, TelemetrySnapshot,
    TrustTier, ValidationOutcome, HUNT_LOCKOUT_SECS, STABILITY_WINDOW,
};

fn runtime(root: &Path, clock: Arc<ManualClock>) -> GovernanceRuntime {
    GovernanceRuntime::builder(GovernanceConfig::rooted_at(root).without_key_env())
        .clock(clock)
        .build()
        .expect("runtime")
}

fn snapshot(monotonic_timestamp: f64) -> TelemetrySnapshot {
    TelemetrySnapshot {
        schema_version: 1,
        determinism_status: true,
        freeze_status: true,
        metrics: TelemetryMetrics {
            precision: 0.93,
            recall: 0.88,
            kl_divergence: 0.03,
            ece: 0.015,
            loss: 0.21,
            gpu_temperature: 64.0,
        },
        epoch: 3,
        batch_size: 128,
        wall_timestamp: 1_760_000_123.5,
        monotonic_timestamp,
        integrity_checksum: String::new(),
        signature: None,
    }
}

fn write_snapshot(rt: &GovernanceRuntime, snapshot: &TelemetrySnapshot) {
    let path = &rt.context().paths().telemetry_snapshot;
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_vec_pretty(snapshot).unwrap()).unwrap();
}

fn publish_green(rt: &GovernanceRuntime) {
    let signals = GateSignals::new(&rt.context().paths().signals_dir);
    signals.publish(files::CI, &json!({ "status": "green" })).unwrap();
    signals
        .publish(files::DETERMINISM, &json!({ "status": "pass" }))
        .unwrap();
    signals
        .publish(files::CROSS_DEVICE, &json!({ "status": "pass" }))
        .unwrap();
    signals
        .publish(files::THERMAL, &json!({ "status": "ok" }))
        .unwrap();
    signals.publish(files::DRIFT, &json!({ "alert": false })).unwrap();
}

#[test]
fn all_gates_green_admits_training_with_lockout() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(50_000.0));
    let rt = runtime(dir.path(), clock.clone());
    assert!(rt.startup().unwrap().is_clean());

    let key = SecretKey::generate();
    write_secret_key(&rt.context().paths().secret_key, &key).unwrap();
    let mut sealed = snapshot(12.0);
    seal_snapshot(&mut sealed, &key);
    write_snapshot(&rt, &sealed);
    publish_green(&rt);

    assert!(rt.validator().validate().unwrap().is_passed());
    let metrics = EvaluationMetrics {
        precision: 0.82,
        recall: 0.78,
        false_positive_rate: 0.09,
        kl_divergence: 0.18,
    };
    for _ in 0..STABILITY_WINDOW {
        rt.protocol().record_evaluation(&metrics, false).unwrap();
    }

    let report = rt.protocol().evaluate_gates().unwrap();
    assert!(report.all_passed(), "{report}");
    let AdmissionOutcome::Started { state, .. } = rt.protocol().start_training().unwrap() else {
        panic!("training was not admitted");
    };
    assert_eq!(state.trust_tier, TrustTier::A);
    assert!(state.hunt_locked);
    assert_eq!(
        state.hunt_lockout_deadline_monotonic,
        Some(50_000.0 + HUNT_LOCKOUT_SECS)
    );
    assert_eq!(rt.status().mode.mode, OperatingMode::Train);

    // Lockout still running after training stops.
    rt.protocol().stop_training().unwrap();
    clock.advance(HUNT_LOCKOUT_SECS - 1.0);
    assert!(matches!(rt.enter_hunt().unwrap(), HuntEntry::Refused(_)));
    clock.advance(1.0);
    assert!(matches!(rt.enter_hunt().unwrap(), HuntEntry::Entered(_)));
}

#[test]
fn unsigned_telemetry_is_contained() {
    let dir = tempdir().unwrap();
    let rt = runtime(dir.path(), Arc::new(ManualClock::new(10.0)));
    let key = SecretKey::generate();
    write_secret_key(&rt.context().paths().secret_key, &key).unwrap();
    assert!(rt.mode_mutex().request_hunt().unwrap().is_granted());

    let mut unsigned = snapshot(7.0);
    unsigned.integrity_checksum = compute_checksum(&unsigned);
    write_snapshot(&rt, &unsigned);

    let outcome = rt.validator().validate().unwrap();
    let ValidationOutcome::Failed(failure) = outcome else {
        panic!("unsigned telemetry passed validation");
    };
    assert_eq!(failure.check, TelemetryCheck::Signature);

    let status = rt.status();
    let containment = status.containment.expect("containment record");
    assert_eq!(containment.forced_tier, TrustTier::None);
    assert_eq!(status.mode.mode, OperatingMode::Idle);

    let incidents = AuditLog::read_all(&rt.context().paths().incident_log).unwrap();
    assert!(incidents.iter().any(|entry| entry.event == "SIGNATURE"));
}

#[test]
fn crash_recovery_is_idempotent_across_restarts() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(100.0));
    let key = SecretKey::generate();
    {
        let rt = runtime(dir.path(), clock.clone());
        write_secret_key(&rt.context().paths().secret_key, &key).unwrap();
        let mut sealed = snapshot(1.0);
        seal_snapshot(&mut sealed, &key);
        write_snapshot(&rt, &sealed);
        publish_green(&rt);
        let metrics = EvaluationMetrics {
            precision: 0.9,
            recall: 0.9,
            false_positive_rate: 0.01,
            kl_divergence: 0.01,
        };
        for _ in 0..STABILITY_WINDOW {
            rt.protocol().record_evaluation(&metrics, false).unwrap();
        }
        assert!(rt.protocol().start_training().unwrap().is_started());
        // Process dies here; the supervisor never wrote a liveness marker.
    }

    let restarted = runtime(dir.path(), clock.clone());
    let report = restarted.startup().unwrap();
    assert!(!report.is_clean());
    assert!(!restarted.status().protocol.training_active);
    assert!(restarted.status().containment.is_some());
    let inspected = restarted.validator().inspect().unwrap();
    assert_eq!(
        inspected.failure().map(|failure| failure.check),
        Some(TelemetryCheck::Freeze)
    );

    let again = runtime(dir.path(), clock);
    assert!(again.startup().unwrap().is_clean());
    let recoveries = AuditLog::read_all(&again.context().paths().recovery_log).unwrap();
    assert_eq!(recoveries.len(), 1);
}
