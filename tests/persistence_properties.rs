//! ---
//! ward_section: "15-testing-qa-runbook"
//! ward_subsection: "integration-tests"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Backup round trip, retention, auto-fix isolation, and crash flag lifecycle."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::tempdir;
use uuid::Uuid;
use ward_common::config::BackupConfig;
use ward_core::CrashRecoveryService;
use ward_integrity::issue::EntityRef;
use ward_integrity::IntegrityValidator;
use ward_persistence::{
    Activity, BackupEngine, BackupError, BackupKind, DataSnapshot, Datastore, DirtyFlag, Project,
    TimeEntry, TimerSession,
};

fn populated_snapshot() -> DataSnapshot {
    let now = Utc::now();
    let client = Project::new("Client");
    let support = Project::new("Support").with_parent(client.id);
    let mut entry = TimeEntry::new(client.id, now - Duration::hours(4), now - Duration::hours(3));
    entry.notes = Some("kick-off".into());
    DataSnapshot {
        time_entries: vec![
            entry,
            TimeEntry::new(support.id, now - Duration::hours(2), now - Duration::hours(1)),
        ],
        activities: vec![Activity::new("terminal", Some(support.id), now - Duration::minutes(20))],
        sessions: vec![TimerSession::start(Some(client.id), now - Duration::minutes(3))],
        projects: vec![client, support],
    }
}

fn engine_at(root: &Path, snapshot: DataSnapshot) -> BackupEngine {
    let datastore = Arc::new(Datastore::open(root.join("data").join("datastore.json")).unwrap());
    datastore.replace(snapshot);
    let config = BackupConfig {
        directory: root.join("backups"),
        max_backups: 10,
        ..Default::default()
    };
    BackupEngine::open(&config, datastore, None).unwrap()
}

#[test]
fn restore_reproduces_snapshot_and_rejects_corruption() {
    let dir = tempdir().unwrap();
    let snapshot = populated_snapshot();
    let engine = engine_at(dir.path(), snapshot.clone());

    let info = engine.create_backup(BackupKind::Manual).unwrap();
    let payload = engine.restore_from_backup(&info).unwrap();
    assert_eq!(payload.data, snapshot);

    let mut bytes = fs::read(&info.storage_location).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    fs::write(&info.storage_location, &bytes).unwrap();

    match engine.restore_from_backup(&info) {
        Err(BackupError::Corrupted(_)) => {}
        other => panic!("expected corruption, got {other:?}"),
    }
}

#[test]
fn eleventh_backup_evicts_only_the_oldest() {
    let dir = tempdir().unwrap();
    let engine = engine_at(dir.path(), populated_snapshot());
    let mut created = Vec::new();
    for _ in 0..11 {
        created.push(engine.create_backup(BackupKind::Automatic).unwrap());
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    let mut kept = engine.list_backups();
    kept.reverse();
    assert_eq!(kept, created[1..].to_vec());
    assert!(!created[0].storage_location.exists());
    assert!(kept.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
}

#[test]
fn one_failing_fix_leaves_the_rest_applied() {
    let now = Utc::now();
    let project = Project::new("Keep");
    let orphan_a = TimeEntry::new(Uuid::new_v4(), now - Duration::hours(3), now - Duration::hours(2));
    let orphan_b = TimeEntry::new(Uuid::new_v4(), now - Duration::hours(2), now - Duration::hours(1));
    let orphan_c = TimeEntry::new(Uuid::new_v4(), now - Duration::hours(1), now);
    let datastore = Arc::new(Datastore::in_memory(DataSnapshot {
        projects: vec![project],
        time_entries: vec![orphan_a.clone(), orphan_b.clone(), orphan_c.clone()],
        ..Default::default()
    }));
    let validator = IntegrityValidator::new(datastore.clone(), None);
    let report = validator.perform_full_check();
    let issue_for = |id: Uuid| {
        report
            .issues
            .iter()
            .find(|issue| issue.affected_entities == vec![EntityRef::TimeEntry(id)])
            .cloned()
            .unwrap()
    };
    let (a, mut b, c) = (issue_for(orphan_a.id), issue_for(orphan_b.id), issue_for(orphan_c.id));
    // Point B at an entity that never existed so its fix fails.
    b.affected_entities = vec![EntityRef::TimeEntry(Uuid::new_v4())];

    let result = validator.auto_fix_issues(&[a.clone(), b.clone(), c.clone()]);
    let fixed: Vec<u64> = result.fixed.iter().map(|issue| issue.id).collect();
    assert_eq!(fixed, vec![a.id, c.id]);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].issue.id, b.id);
    assert_eq!(datastore.snapshot().time_entries, vec![orphan_b]);
}

#[test]
fn dirty_flag_lifecycle_drives_crash_recovery() {
    let dir = tempdir().unwrap();
    let flag_path = dir.path().join("data").join("ward.dirty");
    let service = |snapshot: DataSnapshot| {
        let engine = Arc::new(engine_at(dir.path(), snapshot));
        let validator = Arc::new(IntegrityValidator::new(engine.datastore().clone(), None));
        CrashRecoveryService::new(DirtyFlag::new(&flag_path), validator, engine)
    };

    // Clean run: flag armed at startup, cleared on shutdown.
    let clean = service(populated_snapshot());
    let report = clean.run_startup().unwrap();
    assert!(!report.unclean_shutdown);
    assert_eq!(report.recovered_sessions, 0);
    assert!(flag_path.exists());
    clean.mark_clean_shutdown().unwrap();
    assert!(!flag_path.exists());

    // Unclean run: the process dies with the flag still set.
    let crashed = service(populated_snapshot());
    crashed.run_startup().unwrap();
    drop(crashed);
    assert!(flag_path.exists());

    let recovering = service(populated_snapshot());
    let report = recovering.run_startup().unwrap();
    assert!(report.unclean_shutdown);
    assert_eq!(report.recovered_sessions, 1);
    assert_eq!(report.closed_activities, 1);
    assert!(report.emergency_backup.is_some());
    assert!(flag_path.exists());
}
