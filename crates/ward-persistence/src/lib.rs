//! ---
//! ward_section: "03-persistence-logging"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Datastore, backup archives, and the unclean-shutdown marker."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
//! Persistence for the time tracker's domain data: the live JSON datastore,
//! checksummed compressed backups with a rebuildable manifest, and the dirty
//! flag used to detect crashes.

use uuid::Uuid;

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for datastore and marker file operations.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing persistence files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    /// The state lock stayed held for the whole wait, e.g. by a panicking
    /// writer on this thread.
    #[error("datastore lock not acquired within {0:?}")]
    Busy(std::time::Duration),
}

/// Error type for the backup engine. A checksum mismatch is always
/// [`BackupError::Corrupted`] and is never repaired automatically.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode backup payload: {0}")]
    Encode(#[source] serde_cbor::Error),
    #[error("failed to decode backup payload: {0}")]
    Decode(#[source] serde_cbor::Error),
    #[error("backup manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("backup is corrupted: {0}")]
    Corrupted(String),
    #[error("another backup operation is in progress")]
    OperationInProgress,
    #[error("backup {0} not found")]
    NotFound(Uuid),
    #[error("unsupported backup schema version {0}")]
    UnsupportedSchema(u32),
    #[error("datastore error: {0}")]
    Datastore(#[from] PersistenceError),
}

impl BackupError {
    /// True for integrity failures that must be reported rather than retried.
    pub fn is_corruption(&self) -> bool {
        matches!(self, BackupError::Corrupted(_))
    }
}

pub mod archive;
pub mod backup;
pub mod datastore;
pub mod dirty_flag;
pub mod index;
pub mod metrics;
pub mod model;

pub use archive::{BackupMetadata, BackupPayload, SCHEMA_VERSION};
pub use backup::BackupEngine;
pub use datastore::{ActiveSessionProbe, Datastore};
pub use dirty_flag::DirtyFlag;
pub use index::{BackupIndex, BackupInfo, BackupKind};
pub use metrics::PersistenceMetrics;
pub use model::{Activity, DataSnapshot, Project, SessionState, TimeEntry, TimerSession};
