//! ---
//! ward_section: "15-testing-qa-runbook"
//! ward_subsection: "integration-tests"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Mode determinism, feature purity, backoff bounds, and retry budget."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use ward_resilience::{
    action_fn, features_for_mode, AppFeature, BackoffPolicy, DegradationController,
    DegradationPolicy, ErrorCategory, ErrorCounts, ErrorKind, Fault, OperationMode,
    RecoveryFailure, RecoveryOrchestrator, RecoveryResult, SystemHealth,
};

fn health_grid() -> Vec<SystemHealth> {
    let mut samples = Vec::new();
    for memory in [0.1, 0.72, 0.85, 0.95] {
        for cpu in [0.05, 0.8, 0.9, 0.99] {
            for disk in [0.05, 0.15, 0.6] {
                for network in [true, false] {
                    samples.push(SystemHealth::new(memory, cpu, disk, network, 0.9));
                }
            }
        }
    }
    samples
}

#[test]
fn evaluation_is_deterministic() {
    let policy = DegradationPolicy::default();
    let errors = ErrorCounts::default();
    for health in health_grid() {
        for mode in [
            OperationMode::Normal,
            OperationMode::ReducedFunctionality,
            OperationMode::Minimal,
            OperationMode::Offline,
            OperationMode::Emergency,
        ] {
            assert_eq!(
                policy.next(mode, &health, &errors),
                policy.next(mode, &health, &errors),
                "{health:?} from {mode}"
            );
        }

        let first = DegradationController::new(policy, 100, None);
        let second = DegradationController::new(policy, 100, None);
        assert_eq!(first.evaluate(health), second.evaluate(health));
    }
}

#[test]
fn features_depend_only_on_mode() {
    let emergency = SystemHealth::new(0.95, 0.3, 0.9, true, 1.0);
    let expected: BTreeSet<AppFeature> =
        [AppFeature::BasicTimeTracking, AppFeature::EmergencyBackup].into_iter().collect();

    for start in [
        OperationMode::Normal,
        OperationMode::Minimal,
        OperationMode::Offline,
    ] {
        let controller = DegradationController::new(DegradationPolicy::default(), 100, None);
        controller.force_mode(start, "test setup");
        assert_eq!(controller.evaluate(emergency), OperationMode::Emergency);
        assert_eq!(controller.active_features(), expected);
    }

    let controller = DegradationController::new(DegradationPolicy::default(), 100, None);
    for health in health_grid() {
        let mode = controller.evaluate(health);
        assert_eq!(controller.active_features(), features_for_mode(mode));
    }
}

#[test]
fn backoff_stays_inside_window() {
    let policy = BackoffPolicy::default();
    for seed in 0..200 {
        let mut rng = StdRng::seed_from_u64(seed);
        for attempt in 1..=3u32 {
            let window = Duration::from_secs(1) * 2u32.pow(attempt - 1);
            let delay = policy.delay(attempt as usize, &mut rng);
            assert!(delay >= window / 2, "attempt {attempt}: {delay:?}");
            assert!(delay <= window.min(Duration::from_secs(60)), "attempt {attempt}: {delay:?}");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn failing_strategy_runs_exactly_three_times() {
    let orchestrator = RecoveryOrchestrator::new(BackoffPolicy::default(), 100, None).with_seed(11);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let retry = action_fn(move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
    });

    let fault = Fault::new(ErrorCategory::Datastore, ErrorKind::TransientIo, "write")
        .with_context("table", "time_entries");
    let result = orchestrator.attempt_recovery(fault, Some(retry)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match result {
        RecoveryResult::Failure {
            cause: RecoveryFailure::AttemptsExhausted { attempts, .. },
            attempts_used,
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(attempts_used, 3);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(orchestrator.statistics().failures, 1);
    assert!(orchestrator.in_flight().is_empty());
}
