//! ---
//! ward_section: "03-persistence-logging"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "JSON-backed datastore with atomic saves."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::model::{DataSnapshot, SessionState, TimerSession};
use crate::{PersistenceError, Result};

/// In-memory domain state with an optional JSON file behind it.
#[derive(Debug)]
pub struct Datastore {
    path: Option<PathBuf>,
    state: RwLock<DataSnapshot>,
}

impl Datastore {
    /// Open the datastore at `path`, starting empty when the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let bytes = fs::read(&path)?;
            let snapshot: DataSnapshot = serde_json::from_slice(&bytes)?;
            debug!(
                target: "ward::datastore",
                path = %path.display(),
                entities = snapshot.entity_count(),
                "datastore loaded"
            );
            snapshot
        } else {
            info!(target: "ward::datastore", path = %path.display(), "starting with an empty datastore");
            DataSnapshot::default()
        };
        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
        })
    }

    /// A datastore that never touches disk.
    pub fn in_memory(snapshot: DataSnapshot) -> Self {
        Self {
            path: None,
            state: RwLock::new(snapshot),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> DataSnapshot {
        self.state.read().clone()
    }

    /// Replace the whole state, e.g. after a restore.
    pub fn replace(&self, snapshot: DataSnapshot) {
        *self.state.write() = snapshot;
    }

    /// Mutate the state under the write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut DataSnapshot) -> R) -> R {
        f(&mut *self.state.write())
    }

    /// Like [`Datastore::snapshot`], but gives up after `wait`.
    pub fn try_snapshot_for(&self, wait: Duration) -> Result<DataSnapshot> {
        self.state
            .try_read_for(wait)
            .map(|state| state.clone())
            .ok_or(PersistenceError::Busy(wait))
    }

    /// Persist the current state with write-then-rename.
    pub fn save(&self) -> Result<()> {
        match &self.path {
            Some(path) => persist(path, &self.snapshot()),
            None => Ok(()),
        }
    }

    /// Like [`Datastore::save`], but gives up after `wait`.
    pub fn try_save_for(&self, wait: Duration) -> Result<()> {
        match &self.path {
            Some(path) => persist(path, &self.try_snapshot_for(wait)?),
            None => Ok(()),
        }
    }
}

fn persist(path: &Path, snapshot: &DataSnapshot) -> Result<()> {
    write_json_atomic(path, snapshot)?;
    debug!(
        target: "ward::datastore",
        path = %path.display(),
        entities = snapshot.entity_count(),
        "datastore saved"
    );
    Ok(())
}

/// Access to the running timer, used before emergency backups.
pub trait ActiveSessionProbe: Send + Sync {
    fn active_session(&self) -> Option<TimerSession>;

    /// Complete the running or paused session at `at`, returning it.
    fn stop_active_session(&self, at: DateTime<Utc>) -> Option<TimerSession>;

    /// Like [`ActiveSessionProbe::stop_active_session`], but must not block
    /// longer than `wait`. Used from the panic hook.
    fn try_stop_active_session(
        &self,
        at: DateTime<Utc>,
        _wait: Duration,
    ) -> Result<Option<TimerSession>> {
        Ok(self.stop_active_session(at))
    }
}

fn complete_active(state: &mut DataSnapshot, at: DateTime<Utc>) -> Option<TimerSession> {
    let session = state
        .sessions
        .iter_mut()
        .find(|session| session.is_incomplete())?;
    session.ended_at = Some(at.max(session.started_at));
    session.last_heartbeat = at;
    session.state = SessionState::Completed;
    Some(session.clone())
}

impl ActiveSessionProbe for Datastore {
    fn active_session(&self) -> Option<TimerSession> {
        self.state
            .read()
            .sessions
            .iter()
            .find(|session| session.is_incomplete())
            .cloned()
    }

    fn stop_active_session(&self, at: DateTime<Utc>) -> Option<TimerSession> {
        complete_active(&mut self.state.write(), at)
    }

    fn try_stop_active_session(
        &self,
        at: DateTime<Utc>,
        wait: Duration,
    ) -> Result<Option<TimerSession>> {
        let mut state = self
            .state
            .try_write_for(wait)
            .ok_or(PersistenceError::Busy(wait))?;
        Ok(complete_active(&mut state, at))
    }
}

pub(crate) fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = tmp_path(path);
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Project, TimeEntry};
    use chrono::Duration;
    use tempfile::tempdir;

    #[test]
    fn save_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data/datastore.json");
        let store = Datastore::open(&path).unwrap();
        let project = Project::new("Writing");
        let now = Utc::now();
        store.update(|data| {
            data.time_entries
                .push(TimeEntry::new(project.id, now - Duration::hours(1), now));
            data.projects.push(project.clone());
        });
        store.save().unwrap();
        assert!(!tmp_path(&path).exists());

        let reopened = Datastore::open(&path).unwrap();
        assert_eq!(reopened.snapshot(), store.snapshot());
    }

    #[test]
    fn bounded_access_gives_up_under_a_held_write_lock() {
        let wait = std::time::Duration::from_millis(20);
        let store = Datastore::in_memory(DataSnapshot {
            sessions: vec![TimerSession::start(None, Utc::now())],
            ..Default::default()
        });
        store.update(|_| {
            assert!(matches!(store.try_snapshot_for(wait), Err(PersistenceError::Busy(_))));
            assert!(matches!(
                store.try_stop_active_session(Utc::now(), wait),
                Err(PersistenceError::Busy(_))
            ));
        });
        assert!(store.try_stop_active_session(Utc::now(), wait).unwrap().is_some());
        assert!(store.active_session().is_none());
    }

    #[test]
    fn stopping_the_active_session_completes_it() {
        let started = Utc::now() - Duration::minutes(20);
        let store = Datastore::in_memory(DataSnapshot {
            sessions: vec![TimerSession::start(None, started)],
            ..Default::default()
        });
        assert!(store.active_session().is_some());
        let stopped = store.stop_active_session(Utc::now()).unwrap();
        assert_eq!(stopped.state, SessionState::Completed);
        assert!(stopped.ended_at.unwrap() >= started);
        assert!(store.active_session().is_none());
    }
}
