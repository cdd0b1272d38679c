//! ---
//! ward_section: "01-core-functionality"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Facade, crash recovery, and scheduler behaviour on a scratch directory."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::tempdir;
use tokio::sync::broadcast::error::TryRecvError;
use ward_common::config::AppConfig;
use ward_core::{ResilienceEvent, ResilienceFacade};
use ward_metrics::new_registry;
use ward_persistence::{
    ActiveSessionProbe, BackupError, BackupKind, PersistenceError, Project, SessionState,
    TimerSession,
};
use ward_resilience::{
    AppFeature, ErrorCategory, ErrorKind, Fault, OperationMode, RecoveryFailure, Severity,
    StaticSampler, SystemHealth,
};

fn config_in(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.data.directory = root.join("data");
    config.backup.directory = root.join("backups");
    config.logging.directory = root.join("logs");
    config
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<ResilienceEvent>) -> Vec<ResilienceEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

#[tokio::test]
async fn crash_flag_lifecycle() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    let flag_path = config.dirty_flag_path();

    let facade = ResilienceFacade::open(config.clone(), None).unwrap();
    assert!(!flag_path.exists());
    let report = facade.run_startup().await.unwrap();
    assert!(!report.unclean_shutdown);
    assert!(report.emergency_backup.is_none());
    assert!(flag_path.exists());
    facade.shutdown(None).await.unwrap();
    assert!(!flag_path.exists());

    // Second run exits without a clean shutdown while a timer is running.
    let facade = ResilienceFacade::open(config.clone(), None).unwrap();
    facade.run_startup().await.unwrap();
    let project = Project::new("Client");
    let started = Utc::now() - chrono::Duration::hours(1);
    let mut session = TimerSession::start(Some(project.id), started);
    session.last_heartbeat = started + chrono::Duration::minutes(40);
    facade.datastore().update(|data| {
        data.projects.push(project.clone());
        data.sessions.push(session.clone());
    });
    facade.datastore().save().unwrap();
    drop(facade);
    assert!(flag_path.exists());

    let facade = ResilienceFacade::open(config, None).unwrap();
    let mut events = facade.subscribe();
    let report = facade.run_startup().await.unwrap();
    assert!(report.unclean_shutdown);
    assert_eq!(report.recovered_sessions, 1);
    assert_eq!(report.failed_sessions, 0);
    let backup = report.emergency_backup.clone().unwrap();
    assert_eq!(backup.kind, BackupKind::Emergency);
    assert!(flag_path.exists());

    let data = facade.datastore().snapshot();
    assert_eq!(data.sessions[0].state, SessionState::Recovered);
    assert_eq!(data.sessions[0].ended_at, Some(session.last_heartbeat));
    assert_eq!(data.time_entries.len(), 1);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, ResilienceEvent::BackupCompleted { info } if info.id == backup.id)));
}

#[tokio::test]
async fn faults_follow_severity_policy() {
    let dir = tempdir().unwrap();
    let registry = new_registry();
    let facade = ResilienceFacade::open(config_in(dir.path()), Some(registry.clone())).unwrap();
    let mut events = facade.subscribe();

    let low = Fault::new(ErrorCategory::Search, ErrorKind::TransientIo, "index_read");
    let outcome = facade.handle_fault(low, None).await;
    assert!(outcome.is_absorbed());
    assert!(!outcome.alerted);
    assert_eq!(outcome.mode, OperationMode::Normal);

    let denied = Fault::new(ErrorCategory::Datastore, ErrorKind::PermissionDenied, "write")
        .with_severity(Severity::Medium);
    let outcome = facade.handle_fault(denied, None).await;
    assert!(outcome.alerted);
    assert_eq!(
        outcome.result.unwrap().failure(),
        Some(&RecoveryFailure::UserActionRequired("request_permission".into()))
    );

    let corrupt = Fault::new(ErrorCategory::Datastore, ErrorKind::Corruption, "checksum");
    let outcome = facade.handle_fault(corrupt, None).await;
    assert!(outcome.result.unwrap().is_success());
    assert!(!outcome.alerted);
    assert_eq!(outcome.mode, OperationMode::Minimal);
    assert!(!facade.is_feature_available(AppFeature::AdvancedSearch));

    let stats = facade.statistics();
    assert_eq!(stats.total_errors, 3);
    assert_eq!(stats.critical_errors, 1);
    assert_eq!(stats.errors_by_category[&ErrorCategory::Datastore], 2);
    assert_eq!(stats.current_mode, OperationMode::Minimal);
    assert!((stats.recovery_success_rate - 0.5).abs() < 1e-9);
    assert_eq!(stats.system_health_score, None);

    let names: Vec<&str> = drain(&mut events).iter().map(|event| event.name()).collect();
    assert_eq!(
        names,
        vec![
            "recovery_finished",
            "alert_raised",
            "mode_changed",
            "recovery_finished"
        ]
    );
    let text = ward_metrics::render_text(&registry).unwrap();
    assert!(text.contains("ward_resilience_faults_total"));
}

#[tokio::test]
async fn fatal_system_fault_requests_restart() {
    let dir = tempdir().unwrap();
    let facade = ResilienceFacade::open(config_in(dir.path()), None).unwrap();
    let mut events = facade.subscribe();

    let fatal = Fault::new(ErrorCategory::System, ErrorKind::ResourceExhausted, "fatal")
        .with_severity(Severity::Medium);
    let outcome = facade.handle_fault(fatal, None).await;
    assert!(outcome.alerted);
    assert_eq!(outcome.result.unwrap().failure(), Some(&RecoveryFailure::RestartRequired));
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, ResilienceEvent::RestartRequested { .. })));
}

#[tokio::test]
async fn medium_faults_recover_without_changing_mode() {
    let dir = tempdir().unwrap();
    let facade = ResilienceFacade::open(config_in(dir.path()), None).unwrap();
    let mut events = facade.subscribe();
    assert!(facade.is_rule_engine_enabled());

    let rules = Fault::new(ErrorCategory::RuleEngine, ErrorKind::Timeout, "evaluate")
        .with_severity(Severity::Medium);
    let outcome = facade.handle_fault(rules, None).await;
    assert!(outcome.result.unwrap().is_success());
    assert_eq!(outcome.mode, OperationMode::Normal);
    assert!(!facade.is_rule_engine_enabled());
    assert!(facade.is_feature_available(AppFeature::RuleEngine));

    let memory = Fault::new(ErrorCategory::System, ErrorKind::ResourceExhausted, "memory")
        .with_severity(Severity::Medium);
    let outcome = facade.handle_fault(memory, None).await;
    assert!(outcome.result.unwrap().is_success());
    assert_eq!(outcome.mode, OperationMode::Normal);
    assert_eq!(facade.current_mode(), OperationMode::Normal);
    assert!(!drain(&mut events)
        .iter()
        .any(|event| matches!(event, ResilienceEvent::ModeChanged { .. })));

    // Returning to normal mode lifts the suspension.
    facade.force_mode(OperationMode::Offline, "network lost");
    facade.force_mode(OperationMode::Normal, "network back");
    assert!(facade.is_rule_engine_enabled());
}

#[tokio::test]
async fn emergency_backup_stops_running_timer() {
    let dir = tempdir().unwrap();
    let facade = ResilienceFacade::open(config_in(dir.path()), None).unwrap();
    facade
        .datastore()
        .update(|data| data.sessions.push(TimerSession::start(None, Utc::now())));

    let info = facade.emergency_backup().await.unwrap();
    assert_eq!(info.kind, BackupKind::Emergency);
    assert!(facade.datastore().active_session().is_none());

    let payload = facade.backups().restore_from_backup(&info).unwrap();
    assert_eq!(payload.data.sessions[0].state, SessionState::Completed);
}

#[test]
fn emergency_backup_inside_a_datastore_update_does_not_block() {
    let dir = tempdir().unwrap();
    let facade = ResilienceFacade::open(config_in(dir.path()), None).unwrap();
    let emergency = facade.emergency_handle();

    // Same shape as a panic raised inside an update closure.
    let outcome = facade.datastore().update(|data| {
        data.sessions.push(TimerSession::start(None, Utc::now()));
        emergency.run()
    });
    assert!(matches!(
        outcome,
        Err(BackupError::Datastore(PersistenceError::Busy(_)))
    ));
    assert!(facade.datastore().active_session().is_some());
    assert!(facade.backups().list_backups().is_empty());
    assert!(!facade.backups().is_busy());

    let info = emergency.run().unwrap();
    assert_eq!(info.kind, BackupKind::Emergency);
    assert!(facade.datastore().active_session().is_none());
}

#[tokio::test]
async fn scheduler_applies_health_samples() {
    let dir = tempdir().unwrap();
    let facade = ResilienceFacade::open(config_in(dir.path()), None).unwrap();
    let mut events = facade.subscribe();
    let sampler = Arc::new(StaticSampler::new(SystemHealth::new(0.95, 0.3, 0.9, true, 1.0)));

    let handle = facade.start(sampler);
    assert_eq!(handle.task_names(), vec!["health", "cleanup", "backup", "integrity"]);
    let mode = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ResilienceEvent::ModeChanged { mode, .. }) = events.recv().await {
                return mode;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(mode, OperationMode::Emergency);
    assert_eq!(
        facade.degradation().active_features().into_iter().collect::<Vec<_>>(),
        vec![AppFeature::BasicTimeTracking, AppFeature::EmergencyBackup]
    );

    facade.shutdown(Some(handle)).await.unwrap();
    assert!(!facade.config().dirty_flag_path().exists());
}
