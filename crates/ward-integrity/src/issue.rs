//! ---
//! ward_section: "05-data-integrity"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Integrity issue records and classification enums."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Rule priority, reused as the severity of the issues a rule reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Groups used to order the rule registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    ReferentialIntegrity,
    DataConsistency,
    BusinessLogic,
    TemporalConsistency,
    Completeness,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    OrphanedReference,
    DuplicateEntity,
    InvalidDateRange,
    MissingField,
    HierarchyCycle,
    ImplausibleValue,
    FutureTimestamp,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::OrphanedReference => "orphaned_reference",
            IssueKind::DuplicateEntity => "duplicate_entity",
            IssueKind::InvalidDateRange => "invalid_date_range",
            IssueKind::MissingField => "missing_field",
            IssueKind::HierarchyCycle => "hierarchy_cycle",
            IssueKind::ImplausibleValue => "implausible_value",
            IssueKind::FutureTimestamp => "future_timestamp",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed pointer at a datastore entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "entity", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Project(Uuid),
    Activity(Uuid),
    TimeEntry(Uuid),
    Session(Uuid),
}

impl EntityRef {
    pub fn id(&self) -> Uuid {
        match self {
            EntityRef::Project(id)
            | EntityRef::Activity(id)
            | EntityRef::TimeEntry(id)
            | EntityRef::Session(id) => *id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Project(id) => write!(f, "project:{id}"),
            EntityRef::Activity(id) => write!(f, "activity:{id}"),
            EntityRef::TimeEntry(id) => write!(f, "time_entry:{id}"),
            EntityRef::Session(id) => write!(f, "session:{id}"),
        }
    }
}

/// A single detected problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    /// Monotonically increasing per validator.
    pub id: u64,
    pub kind: IssueKind,
    pub severity: Priority,
    pub description: String,
    pub affected_entities: Vec<EntityRef>,
    pub can_auto_fix: bool,
    pub detected_at: DateTime<Utc>,
    /// Name of the rule that reported the issue.
    pub rule: String,
}

impl IntegrityIssue {
    pub fn affected_entity_ids(&self) -> Vec<Uuid> {
        self.affected_entities.iter().map(EntityRef::id).collect()
    }
}

/// Why fixing one issue failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FixFailure {
    pub issue: IntegrityIssue,
    pub reason: String,
}

/// Outcome of a fix batch. Failures never abort the batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AutoFixResult {
    pub fixed: Vec<IntegrityIssue>,
    pub failed: Vec<FixFailure>,
}

impl AutoFixResult {
    pub fn fixed_count(&self) -> usize {
        self.fixed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

/// Issues reported by one validation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub checked_at: DateTime<Utc>,
    pub rules_run: usize,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn count_at_least(&self, severity: Priority) -> usize {
        self.issues
            .iter()
            .filter(|issue| issue.severity >= severity)
            .count()
    }
}
