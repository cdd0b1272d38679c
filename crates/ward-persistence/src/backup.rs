//! ---
//! ward_section: "03-persistence-logging"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Backup engine: create, restore, verify, retention, manifest upkeep."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use ward_common::config::BackupConfig;

use crate::archive::{self, BackupPayload};
use crate::model::DataSnapshot;
use crate::datastore::{tmp_path, Datastore};
use crate::index::{backup_file_name, BackupIndex, BackupInfo, BackupKind};
use crate::metrics::PersistenceMetrics;
use crate::BackupError;

/// Owns one backup directory. Create, restore, delete, and manifest rebuilds
/// are mutually exclusive; a second caller fails with
/// [`BackupError::OperationInProgress`] instead of waiting.
pub struct BackupEngine {
    directory: PathBuf,
    max_backups: usize,
    automatic_interval: Duration,
    app_version: String,
    datastore: Arc<Datastore>,
    index: Mutex<BackupIndex>,
    busy: AtomicBool,
    metrics: Option<PersistenceMetrics>,
}

struct OperationGuard<'a>(&'a AtomicBool);

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BackupEngine {
    /// Open the backup directory, rebuilding the manifest when it is missing
    /// or unreadable.
    pub fn open(
        config: &BackupConfig,
        datastore: Arc<Datastore>,
        metrics: Option<PersistenceMetrics>,
    ) -> Result<Self, BackupError> {
        fs::create_dir_all(&config.directory)?;
        let index = match BackupIndex::load(&config.directory) {
            Ok(Some(index)) => index,
            Ok(None) => {
                let index = BackupIndex::rebuild(&config.directory)?;
                if !index.is_empty() {
                    warn!(
                        target: "ward::backup",
                        entries = index.len(),
                        "manifest missing; rebuilt from backup files"
                    );
                    index.save(&config.directory)?;
                }
                index
            }
            Err(err) => {
                warn!(target: "ward::backup", error = %err, "manifest unreadable; rebuilding");
                let index = BackupIndex::rebuild(&config.directory)?;
                index.save(&config.directory)?;
                index
            }
        };
        if let Some(metrics) = &metrics {
            metrics.set_retained(index.len());
        }
        Ok(Self {
            directory: config.directory.clone(),
            max_backups: config.max_backups.max(1),
            automatic_interval: config.automatic_interval,
            app_version: env!("CARGO_PKG_VERSION").to_owned(),
            datastore,
            index: Mutex::new(index),
            busy: AtomicBool::new(false),
            metrics,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn datastore(&self) -> &Arc<Datastore> {
        &self.datastore
    }

    /// True while another engine operation holds the lock.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn begin(&self) -> Result<OperationGuard<'_>, BackupError> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BackupError::OperationInProgress)?;
        Ok(OperationGuard(&self.busy))
    }

    /// Snapshot the datastore into a new backup. Older backups beyond the
    /// retention limit are evicted afterwards.
    pub fn create_backup(&self, kind: BackupKind) -> Result<BackupInfo, BackupError> {
        self.create_with(kind, None)
    }

    /// Like [`BackupEngine::create_backup`], but fails with
    /// [`PersistenceError::Busy`](crate::PersistenceError::Busy) instead of
    /// waiting longer than `wait` for the datastore.
    pub fn create_backup_within(
        &self,
        kind: BackupKind,
        wait: Duration,
    ) -> Result<BackupInfo, BackupError> {
        self.create_with(kind, Some(wait))
    }

    fn create_with(&self, kind: BackupKind, wait: Option<Duration>) -> Result<BackupInfo, BackupError> {
        let _guard = self.begin()?;
        let started = Instant::now();
        let created = match wait {
            Some(wait) => self.datastore.try_snapshot_for(wait).map_err(BackupError::from),
            None => Ok(self.datastore.snapshot()),
        }
        .and_then(|snapshot| self.create_locked(kind, snapshot));
        match created {
            Ok(info) => {
                self.enforce_retention();
                if let Some(metrics) = &self.metrics {
                    metrics.record_backup_created(kind, started.elapsed().as_secs_f64());
                }
                Ok(info)
            }
            Err(err) => {
                error!(target: "ward::backup", %kind, error = %err, "backup creation failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_failure("create", failure_reason(&err));
                }
                Err(err)
            }
        }
    }

    fn create_locked(&self, kind: BackupKind, snapshot: DataSnapshot) -> Result<BackupInfo, BackupError> {
        let payload = BackupPayload::new(kind, &self.app_version, snapshot);
        let encoded = archive::encode(&payload)?;

        let id = Uuid::new_v4();
        let timestamp = Utc::now().trunc_subsecs(3);
        let location = self.directory.join(backup_file_name(timestamp, kind, id));
        write_atomic(&location, &encoded.bytes)?;

        let info = BackupInfo {
            id,
            timestamp,
            kind,
            byte_size: encoded.bytes.len() as u64,
            checksum: encoded.checksum,
            storage_location: location.clone(),
        };
        let mut index = self.index.lock();
        index.push(info.clone());
        if let Err(err) = index.save(&self.directory) {
            index.remove(id);
            if let Err(cleanup) = fs::remove_file(&location) {
                warn!(target: "ward::backup", path = %location.display(), error = %cleanup, "failed to remove unindexed backup");
            }
            return Err(err);
        }
        drop(index);

        info!(
            target: "ward::backup",
            %id,
            %kind,
            bytes = info.byte_size,
            entities = payload.data.entity_count(),
            "backup created"
        );
        Ok(info)
    }

    fn enforce_retention(&self) {
        let (evicted, remaining) = {
            let mut index = self.index.lock();
            let evicted = index.drain_excess(self.max_backups);
            if !evicted.is_empty() {
                if let Err(err) = index.save(&self.directory) {
                    warn!(target: "ward::backup", error = %err, "failed to persist manifest after eviction");
                }
            }
            (evicted, index.len())
        };
        for info in evicted {
            match fs::remove_file(&info.storage_location) {
                Ok(()) => debug!(target: "ward::backup", id = %info.id, "evicted old backup"),
                Err(err) => warn!(
                    target: "ward::backup",
                    id = %info.id,
                    path = %info.storage_location.display(),
                    error = %err,
                    "failed to delete evicted backup"
                ),
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_retained(remaining);
        }
    }

    /// Read, verify, and decode a backup. The checksum is checked before
    /// decompression; a mismatch stops the restore.
    pub fn restore_from_backup(&self, info: &BackupInfo) -> Result<BackupPayload, BackupError> {
        let _guard = self.begin()?;
        self.restore_locked(info)
    }

    /// Restore a backup and make it the live datastore state.
    pub fn restore_into(&self, info: &BackupInfo) -> Result<BackupPayload, BackupError> {
        let _guard = self.begin()?;
        let payload = self.restore_locked(info)?;
        self.datastore.replace(payload.data.clone());
        self.datastore.save()?;
        info!(target: "ward::backup", id = %info.id, "datastore replaced from backup");
        Ok(payload)
    }

    fn restore_locked(&self, info: &BackupInfo) -> Result<BackupPayload, BackupError> {
        let started = Instant::now();
        let result = fs::read(&info.storage_location)
            .map_err(BackupError::from)
            .and_then(|bytes| archive::decode(&bytes, Some(&info.checksum)));
        if let Some(metrics) = &self.metrics {
            metrics.record_restore(result.is_ok(), started.elapsed().as_secs_f64());
        }
        match &result {
            Ok(payload) => info!(
                target: "ward::backup",
                id = %info.id,
                entities = payload.data.entity_count(),
                "backup restored"
            ),
            Err(err) => {
                error!(target: "ward::backup", id = %info.id, error = %err, "restore failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_failure("restore", failure_reason(err));
                }
            }
        }
        result
    }

    /// Check that a backup decodes and matches its checksum. Read-only, so it
    /// does not take the operation lock.
    pub fn verify_backup(&self, info: &BackupInfo) -> Result<(), BackupError> {
        let bytes = fs::read(&info.storage_location)?;
        archive::decode(&bytes, Some(&info.checksum)).map(|_| ())
    }

    /// Manifest entries, newest first.
    pub fn list_backups(&self) -> Vec<BackupInfo> {
        let index = self.index.lock();
        index.entries().iter().rev().cloned().collect()
    }

    pub fn latest_backup(&self) -> Option<BackupInfo> {
        self.index.lock().latest().cloned()
    }

    pub fn find_backup(&self, id: Uuid) -> Option<BackupInfo> {
        self.index.lock().get(id).cloned()
    }

    /// Remove a backup and its manifest entry.
    pub fn delete_backup(&self, id: Uuid) -> Result<BackupInfo, BackupError> {
        let _guard = self.begin()?;
        let mut index = self.index.lock();
        let info = index.remove(id).ok_or(BackupError::NotFound(id))?;
        index.save(&self.directory)?;
        let remaining = index.len();
        drop(index);
        match fs::remove_file(&info.storage_location) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_retained(remaining);
        }
        info!(target: "ward::backup", %id, "backup deleted");
        Ok(info)
    }

    /// An automatic backup is due once a full interval has passed since the
    /// last backup of any kind.
    pub fn should_run_automatic(&self, now: DateTime<Utc>) -> bool {
        match self.latest_backup() {
            None => true,
            // A latest backup stamped in the future means the clock moved
            // back; treat the backup as due.
            Some(latest) if latest.timestamp > now => true,
            Some(latest) => chrono::Duration::from_std(self.automatic_interval)
                .map(|interval| now - latest.timestamp >= interval)
                .unwrap_or(false),
        }
    }

    /// Rescan the directory and replace the manifest. Returns the entry count.
    pub fn rebuild_index(&self) -> Result<usize, BackupError> {
        let _guard = self.begin()?;
        let rebuilt = BackupIndex::rebuild(&self.directory)?;
        rebuilt.save(&self.directory)?;
        let count = rebuilt.len();
        *self.index.lock() = rebuilt;
        if let Some(metrics) = &self.metrics {
            metrics.set_retained(count);
        }
        info!(target: "ward::backup", entries = count, "manifest rebuilt");
        Ok(count)
    }
}

impl std::fmt::Debug for BackupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupEngine")
            .field("directory", &self.directory)
            .field("max_backups", &self.max_backups)
            .finish_non_exhaustive()
    }
}

fn failure_reason(err: &BackupError) -> &'static str {
    match err {
        BackupError::Io(_) => "io",
        BackupError::Encode(_) => "encode",
        BackupError::Decode(_) => "decode",
        BackupError::Manifest(_) => "manifest",
        BackupError::Corrupted(_) => "corrupted",
        BackupError::OperationInProgress => "busy",
        BackupError::NotFound(_) => "not_found",
        BackupError::UnsupportedSchema(_) => "schema",
        BackupError::Datastore(crate::PersistenceError::Busy(_)) => "datastore_busy",
        BackupError::Datastore(_) => "datastore",
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BackupError> {
    let tmp = tmp_path(path);
    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataSnapshot, Project};
    use tempfile::tempdir;

    fn engine(dir: &Path, max_backups: usize) -> BackupEngine {
        let config = BackupConfig {
            directory: dir.join("backups"),
            max_backups,
            ..Default::default()
        };
        let datastore = Arc::new(Datastore::in_memory(DataSnapshot {
            projects: vec![Project::new("Alpha")],
            ..Default::default()
        }));
        BackupEngine::open(&config, datastore, None).unwrap()
    }

    #[test]
    fn create_then_restore() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 10);
        let info = engine.create_backup(BackupKind::Manual).unwrap();
        assert!(info.storage_location.exists());
        let payload = engine.restore_from_backup(&info).unwrap();
        assert_eq!(payload.data, engine.datastore().snapshot());
        assert_eq!(payload.metadata.kind, BackupKind::Manual);
        assert!(!engine.is_busy());
    }

    #[test]
    fn busy_engine_rejects_second_operation() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 10);
        let guard = engine.begin().unwrap();
        assert!(matches!(
            engine.create_backup(BackupKind::Manual),
            Err(BackupError::OperationInProgress)
        ));
        drop(guard);
        engine.create_backup(BackupKind::Manual).unwrap();
    }

    #[test]
    fn automatic_backup_waits_for_interval() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 10);
        assert!(engine.should_run_automatic(Utc::now()));
        let info = engine.create_backup(BackupKind::Emergency).unwrap();
        assert!(!engine.should_run_automatic(info.timestamp + chrono::Duration::minutes(59)));
        assert!(engine.should_run_automatic(info.timestamp + chrono::Duration::hours(1)));
    }

    #[test]
    fn clock_moving_back_makes_backup_due() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 10);
        let info = engine.create_backup(BackupKind::Manual).unwrap();
        assert!(engine.should_run_automatic(info.timestamp - chrono::Duration::minutes(5)));
    }

    #[test]
    fn locked_datastore_fails_bounded_backup() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 10);
        let wait = Duration::from_millis(20);
        let outcome = engine
            .datastore()
            .update(|_| engine.create_backup_within(BackupKind::Emergency, wait));
        assert!(matches!(
            outcome,
            Err(BackupError::Datastore(crate::PersistenceError::Busy(_)))
        ));
        assert!(!engine.is_busy());
        assert!(engine.list_backups().is_empty());
        engine.create_backup_within(BackupKind::Emergency, wait).unwrap();
    }

    #[test]
    fn delete_removes_file_and_entry() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 10);
        let info = engine.create_backup(BackupKind::Manual).unwrap();
        engine.delete_backup(info.id).unwrap();
        assert!(!info.storage_location.exists());
        assert!(engine.list_backups().is_empty());
        assert!(matches!(
            engine.delete_backup(info.id),
            Err(BackupError::NotFound(_))
        ));
    }
}
