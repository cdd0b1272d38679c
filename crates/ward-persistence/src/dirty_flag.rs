//! ---
//! ward_section: "03-persistence-logging"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Marker file recording whether the last run shut down cleanly."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

use crate::Result;

/// Presence of the file means the previous run did not exit cleanly.
#[derive(Debug, Clone)]
pub struct DirtyFlag {
    path: PathBuf,
}

impl DirtyFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    /// Mark the current run as in progress.
    pub fn set(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let contents = format!("pid={}\nstarted_at={}\n", std::process::id(), Utc::now().to_rfc3339());
        fs::write(&self.path, contents)?;
        debug!(target: "ward::crash", path = %self.path.display(), "dirty flag set");
        Ok(())
    }

    /// Remove the marker. Missing files are fine.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(target: "ward::crash", path = %self.path.display(), "dirty flag cleared");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
