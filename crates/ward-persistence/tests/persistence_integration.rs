//! ---
//! ward_section: "03-persistence-logging"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Backup engine behaviour against a real directory."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use prometheus::Registry;
use tempfile::tempdir;
use ward_common::config::BackupConfig;
use ward_persistence::index::INDEX_FILE;
use ward_persistence::{
    Activity, BackupEngine, BackupError, BackupKind, DataSnapshot, Datastore, PersistenceMetrics,
    Project, TimeEntry, TimerSession,
};

fn sample_snapshot() -> DataSnapshot {
    let now = Utc::now();
    let client = Project::new("Client work");
    let design = Project::new("Design").with_parent(client.id);
    DataSnapshot {
        time_entries: vec![
            TimeEntry::new(client.id, now - Duration::hours(3), now - Duration::hours(2)),
            TimeEntry::new(design.id, now - Duration::hours(2), now - Duration::hours(1)),
        ],
        activities: vec![Activity::new("editor", Some(design.id), now - Duration::minutes(30))],
        sessions: vec![TimerSession::start(Some(client.id), now - Duration::minutes(5))],
        projects: vec![client, design],
    }
}

fn open_engine(root: &Path, registry: Option<Arc<Registry>>) -> BackupEngine {
    let datastore = Arc::new(Datastore::open(root.join("data/datastore.json")).unwrap());
    datastore.replace(sample_snapshot());
    let config = BackupConfig {
        directory: root.join("backups"),
        ..Default::default()
    };
    let metrics = registry.map(|registry| PersistenceMetrics::new(registry).unwrap());
    BackupEngine::open(&config, datastore, metrics).unwrap()
}

fn metric_total(registry: &Registry, name: &str) -> f64 {
    registry
        .gather()
        .iter()
        .filter(|family| family.get_name() == name)
        .flat_map(|family| family.get_metric())
        .map(|metric| metric.get_counter().get_value())
        .sum()
}

#[test]
fn restore_reproduces_snapshot() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path(), None);
    let expected = engine.datastore().snapshot();

    let info = engine.create_backup(BackupKind::Manual).unwrap();
    engine.datastore().replace(DataSnapshot::default());

    let payload = engine.restore_into(&info).unwrap();
    assert_eq!(payload.data, expected);
    assert_eq!(engine.datastore().snapshot(), expected);
    assert!(dir.path().join("data/datastore.json").exists());
}

#[test]
fn single_corrupted_byte_fails_with_corruption() {
    let dir = tempdir().unwrap();
    let registry = Arc::new(Registry::new());
    let engine = open_engine(dir.path(), Some(registry.clone()));
    let info = engine.create_backup(BackupKind::Manual).unwrap();

    let mut bytes = fs::read(&info.storage_location).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] = bytes[middle].wrapping_add(1);
    fs::write(&info.storage_location, bytes).unwrap();

    let err = engine.restore_from_backup(&info).unwrap_err();
    assert!(matches!(err, BackupError::Corrupted(_)), "{err}");
    assert!(engine.verify_backup(&info).unwrap_err().is_corruption());
    assert_eq!(metric_total(&registry, "ward_backup_failures_total"), 1.0);
}

#[test]
fn eleventh_backup_evicts_the_oldest() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path(), None);
    let mut created = Vec::new();
    for _ in 0..11 {
        created.push(engine.create_backup(BackupKind::Automatic).unwrap());
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    let listed = engine.list_backups();
    assert_eq!(listed.len(), 10);
    assert!(!created[0].storage_location.exists());
    assert!(listed.iter().all(|info| info.id != created[0].id));
    assert_eq!(engine.latest_backup().unwrap().id, created[10].id);

    let blobs = fs::read_dir(engine.directory())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "wbk"))
        .count();
    assert_eq!(blobs, 10);
}

#[test]
fn lost_manifest_is_rebuilt_from_filenames() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path(), None);
    let first = engine.create_backup(BackupKind::Manual).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(2));
    let second = engine.create_backup(BackupKind::Emergency).unwrap();
    drop(engine);

    fs::remove_file(dir.path().join("backups").join(INDEX_FILE)).unwrap();
    let reopened = open_engine(dir.path(), None);
    let listed = reopened.list_backups();
    assert_eq!(listed, vec![second.clone(), first.clone()]);
    reopened.verify_backup(&listed[0]).unwrap();

    fs::write(dir.path().join("backups").join(INDEX_FILE), b"not json").unwrap();
    assert_eq!(reopened.rebuild_index().unwrap(), 2);
    let restored = reopened.restore_from_backup(&first).unwrap();
    assert_eq!(restored.metadata.kind, BackupKind::Manual);
}
