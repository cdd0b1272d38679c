//! ---
//! ward_section: "01-core-functionality"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Startup crash detection and remediation sequence."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use ward_integrity::{IntegrityValidator, Priority};
use ward_persistence::{
    BackupEngine, BackupInfo, BackupKind, DataSnapshot, DirtyFlag, SessionState, TimeEntry,
};

/// Longest session, in hours, that is completed at its last heartbeat rather
/// than discarded.
pub const MAX_RECOVERABLE_SESSION_HOURS: i64 = 24;

const RECOVERED_NOTE: &str = "recovered after unclean shutdown";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CrashRecoveryReport {
    pub unclean_shutdown: bool,
    pub issues_found: usize,
    pub issues_fixed: usize,
    pub recovered_sessions: usize,
    pub failed_sessions: usize,
    pub closed_activities: usize,
    pub dropped_activities: usize,
    pub emergency_backup: Option<BackupInfo>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct InterruptedWork {
    recovered_sessions: usize,
    failed_sessions: usize,
    closed_activities: usize,
    dropped_activities: usize,
}

/// Detects an unclean previous exit through the dirty flag and repairs what
/// it left behind.
pub struct CrashRecoveryService {
    flag: DirtyFlag,
    validator: Arc<IntegrityValidator>,
    backups: Arc<BackupEngine>,
}

impl CrashRecoveryService {
    pub fn new(flag: DirtyFlag, validator: Arc<IntegrityValidator>, backups: Arc<BackupEngine>) -> Self {
        Self {
            flag,
            validator,
            backups,
        }
    }

    pub fn flag(&self) -> &DirtyFlag {
        &self.flag
    }

    /// Run the startup sequence. Steps run strictly in order; the flag is
    /// re-armed last so a crash during recovery is detected next time.
    pub fn run_startup(&self) -> Result<CrashRecoveryReport> {
        let unclean_shutdown = self.flag.is_set();
        if unclean_shutdown {
            warn!(target: "ward::crash", flag = %self.flag.path().display(), "previous run did not shut down cleanly");
        } else {
            info!(target: "ward::crash", "previous run shut down cleanly");
        }
        let mut report = CrashRecoveryReport {
            unclean_shutdown,
            ..Default::default()
        };

        let quick = self.validator.perform_quick_check();
        let critical: Vec<_> = quick
            .issues
            .iter()
            .filter(|issue| issue.severity == Priority::Critical)
            .cloned()
            .collect();
        report.issues_found = quick.issues.len();
        if !critical.is_empty() {
            let fixes = self.validator.auto_fix_issues(&critical);
            report.issues_fixed = fixes.fixed_count();
        }

        if unclean_shutdown {
            let datastore = self.backups.datastore();
            let work = datastore.update(|data| recover_interrupted_work(data, Utc::now()));
            report.recovered_sessions = work.recovered_sessions;
            report.failed_sessions = work.failed_sessions;
            report.closed_activities = work.closed_activities;
            report.dropped_activities = work.dropped_activities;
            datastore
                .save()
                .context("failed to persist recovered sessions")?;

            match self.backups.create_backup(BackupKind::Emergency) {
                Ok(info) => report.emergency_backup = Some(info),
                Err(err) => {
                    error!(target: "ward::crash", error = %err, "emergency backup after crash failed")
                }
            }
        }

        self.flag.clear().context("failed to clear dirty flag")?;
        self.flag.set().context("failed to arm dirty flag")?;

        info!(
            target: "ward::crash",
            unclean = report.unclean_shutdown,
            issues_found = report.issues_found,
            issues_fixed = report.issues_fixed,
            recovered_sessions = report.recovered_sessions,
            failed_sessions = report.failed_sessions,
            closed_activities = report.closed_activities,
            dropped_activities = report.dropped_activities,
            "startup recovery complete"
        );
        Ok(report)
    }

    /// Clear the dirty flag. Call last on an orderly exit.
    pub fn mark_clean_shutdown(&self) -> Result<()> {
        self.flag.clear().context("failed to clear dirty flag")?;
        info!(target: "ward::crash", "clean shutdown recorded");
        Ok(())
    }
}

impl std::fmt::Debug for CrashRecoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashRecoveryService")
            .field("flag", &self.flag)
            .finish_non_exhaustive()
    }
}

fn recover_interrupted_work(data: &mut DataSnapshot, now: DateTime<Utc>) -> InterruptedWork {
    let mut work = InterruptedWork::default();
    let projects = data.project_ids();
    let mut entries = Vec::new();

    for session in data.sessions.iter_mut().filter(|s| s.is_incomplete()) {
        let end = session.last_heartbeat.min(now);
        let length = end - session.started_at;
        if length >= Duration::zero() && length <= Duration::hours(MAX_RECOVERABLE_SESSION_HOURS) {
            session.ended_at = Some(end);
            session.state = SessionState::Recovered;
            if let Some(project) = session.project_id.filter(|id| projects.contains(id)) {
                if length > Duration::zero() {
                    let mut entry = TimeEntry::new(project, session.started_at, end);
                    entry.notes = Some(RECOVERED_NOTE.to_owned());
                    entries.push(entry);
                }
            }
            work.recovered_sessions += 1;
        } else {
            warn!(
                target: "ward::crash",
                session = %session.id,
                hours = length.num_hours(),
                "discarding implausible interrupted session"
            );
            session.state = SessionState::Discarded;
            work.failed_sessions += 1;
        }
    }
    data.time_entries.extend(entries);

    data.activities.retain_mut(|activity| {
        if activity.ended_at.is_some() {
            return true;
        }
        if activity.project_id.is_some_and(|id| !projects.contains(&id)) {
            work.dropped_activities += 1;
            return false;
        }
        activity.ended_at = Some(activity.started_at);
        work.closed_activities += 1;
        true
    });
    work
}
