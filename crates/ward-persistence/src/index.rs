//! ---
//! ward_section: "03-persistence-logging"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Backup manifest and blob naming scheme."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::archive;
use crate::datastore::write_json_atomic;
use crate::BackupError;

/// Manifest file name inside the backup directory.
pub const INDEX_FILE: &str = "index.json";
/// Extension of backup blobs.
pub const BACKUP_EXTENSION: &str = "wbk";
const FILE_PREFIX: &str = "backup";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

/// Why a backup was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Manual,
    Automatic,
    Emergency,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Manual => "manual",
            BackupKind::Automatic => "automatic",
            BackupKind::Emergency => "emergency",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(BackupKind::Manual),
            "automatic" => Ok(BackupKind::Automatic),
            "emergency" => Ok(BackupKind::Emergency),
            other => Err(format!("unknown backup kind `{other}`")),
        }
    }
}

/// Manifest record for one backup blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: BackupKind,
    /// Size of the blob on disk, header included.
    pub byte_size: u64,
    /// Hex SHA-256 of the compressed body.
    pub checksum: String,
    pub storage_location: PathBuf,
}

/// `backup_<timestamp>_<kind>_<uuid>.wbk`
pub fn backup_file_name(timestamp: DateTime<Utc>, kind: BackupKind, id: Uuid) -> String {
    format!(
        "{FILE_PREFIX}_{}_{}_{}.{BACKUP_EXTENSION}",
        timestamp.format(TIMESTAMP_FORMAT),
        kind,
        id
    )
}

/// Inverse of [`backup_file_name`].
pub fn parse_backup_file_name(name: &str) -> Option<(DateTime<Utc>, BackupKind, Uuid)> {
    let stem = name.strip_suffix(&format!(".{BACKUP_EXTENSION}"))?;
    let mut parts = stem.split('_');
    if parts.next()? != FILE_PREFIX {
        return None;
    }
    let timestamp = NaiveDateTime::parse_from_str(parts.next()?, TIMESTAMP_FORMAT)
        .ok()?
        .and_utc();
    let kind = parts.next()?.parse().ok()?;
    let id = Uuid::parse_str(parts.next()?).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((timestamp, kind, id))
}

/// In-memory view of `index.json`, kept sorted oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupIndex {
    #[serde(default)]
    entries: Vec<BackupInfo>,
}

impl BackupIndex {
    pub fn path(directory: &Path) -> PathBuf {
        directory.join(INDEX_FILE)
    }

    /// Load the manifest. `Ok(None)` when no manifest exists.
    pub fn load(directory: &Path) -> Result<Option<Self>, BackupError> {
        let path = Self::path(directory);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let mut index: BackupIndex = serde_json::from_slice(&bytes)?;
        index.sort();
        Ok(Some(index))
    }

    /// Atomically write the manifest.
    pub fn save(&self, directory: &Path) -> Result<(), BackupError> {
        write_json_atomic(&Self::path(directory), self)?;
        Ok(())
    }

    /// Reconstruct the manifest from the blobs in `directory`. Files whose
    /// name or header cannot be parsed are skipped.
    pub fn rebuild(directory: &Path) -> Result<Self, BackupError> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(directory)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            let Some((timestamp, kind, id)) = parse_backup_file_name(name) else {
                continue;
            };
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    warn!(target: "ward::backup", path = %entry.path().display(), error = %err, "unable to read metadata");
                    continue;
                }
            };
            let checksum = match archive::read_header_checksum(entry.path()) {
                Ok(checksum) => checksum,
                Err(err) => {
                    warn!(target: "ward::backup", path = %entry.path().display(), error = %err, "skipping unreadable backup");
                    continue;
                }
            };
            debug!(target: "ward::backup", %id, %kind, "recovered manifest entry");
            entries.push(BackupInfo {
                id,
                timestamp,
                kind,
                byte_size: metadata.len(),
                checksum,
                storage_location: entry.path().to_path_buf(),
            });
        }
        let mut index = Self { entries };
        index.sort();
        Ok(index)
    }

    pub fn entries(&self) -> &[BackupInfo] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&BackupInfo> {
        self.entries.last()
    }

    pub fn get(&self, id: Uuid) -> Option<&BackupInfo> {
        self.entries.iter().find(|info| info.id == id)
    }

    pub fn push(&mut self, info: BackupInfo) {
        self.entries.push(info);
        self.sort();
    }

    pub fn remove(&mut self, id: Uuid) -> Option<BackupInfo> {
        let position = self.entries.iter().position(|info| info.id == id)?;
        Some(self.entries.remove(position))
    }

    /// Remove and return the oldest entries beyond `keep`.
    pub fn drain_excess(&mut self, keep: usize) -> Vec<BackupInfo> {
        let excess = self.entries.len().saturating_sub(keep);
        self.entries.drain(..excess).collect()
    }

    fn sort(&mut self) {
        self.entries.sort_by_key(|info| info.timestamp);
    }
}
