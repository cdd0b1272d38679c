//! ---
//! ward_section: "03-persistence-logging"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Domain entities protected by the resilience core."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A project, optionally nested under a parent project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            parent_id: None,
            created_at: Utc::now(),
            archived: false,
        }
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_id = Some(parent);
        self
    }
}

/// Automatically tracked application usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub app_name: String,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    /// `None` while the activity is still open.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Activity {
    pub fn new(app_name: impl Into<String>, project_id: Option<Uuid>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            app_name: app_name.into(),
            project_id,
            started_at,
            ended_at: None,
        }
    }
}

/// A completed block of time booked against a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: Uuid,
    pub project_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl TimeEntry {
    pub fn new(project_id: Uuid, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            started_at,
            ended_at,
            notes: None,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }
}

/// Lifecycle of a manual timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Paused,
    Completed,
    /// Closed during crash recovery.
    Recovered,
    /// Dropped during crash recovery.
    Discarded,
}

/// A manual timer session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerSession {
    pub id: Uuid,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub state: SessionState,
}

impl TimerSession {
    pub fn start(project_id: Option<Uuid>, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            started_at: at,
            last_heartbeat: at,
            ended_at: None,
            state: SessionState::Running,
        }
    }

    /// Running or paused without an end time.
    pub fn is_incomplete(&self) -> bool {
        self.ended_at.is_none() && matches!(self.state, SessionState::Running | SessionState::Paused)
    }
}

/// Everything the datastore persists and a backup captures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSnapshot {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub time_entries: Vec<TimeEntry>,
    #[serde(default)]
    pub sessions: Vec<TimerSession>,
}

impl DataSnapshot {
    pub fn project_ids(&self) -> HashSet<Uuid> {
        self.projects.iter().map(|project| project.id).collect()
    }

    pub fn project(&self, id: Uuid) -> Option<&Project> {
        self.projects.iter().find(|project| project.id == id)
    }

    pub fn entity_count(&self) -> usize {
        self.projects.len() + self.activities.len() + self.time_entries.len() + self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_count() == 0
    }
}
