//! ---
//! ward_section: "05-data-integrity"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Static registry of validation rules over a data snapshot."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;
use ward_persistence::DataSnapshot;

use crate::issue::{EntityRef, IssueKind, Priority, RuleCategory};

/// Allowed clock skew before a timestamp counts as in the future.
pub const FUTURE_TOLERANCE_MINUTES: i64 = 5;
/// Longest plausible single time entry.
pub const MAX_PLAUSIBLE_HOURS: i64 = 24;

/// Raw rule output before the validator assigns ids and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub kind: IssueKind,
    pub description: String,
    pub affected: Vec<EntityRef>,
    pub can_auto_fix: bool,
}

impl Finding {
    fn fixable(kind: IssueKind, description: String, affected: Vec<EntityRef>) -> Self {
        Self {
            kind,
            description,
            affected,
            can_auto_fix: true,
        }
    }
}

pub type RuleCheck = fn(&DataSnapshot, DateTime<Utc>) -> Vec<Finding>;

/// A named check with its category and priority.
#[derive(Clone, Copy)]
pub struct ValidationRule {
    pub name: &'static str,
    pub category: RuleCategory,
    pub priority: Priority,
    pub check: RuleCheck,
}

impl std::fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationRule")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Rules in evaluation order: critical first, then by descending priority.
pub fn default_rules() -> Vec<ValidationRule> {
    vec![
        ValidationRule {
            name: "duplicate_project_ids",
            category: RuleCategory::DataConsistency,
            priority: Priority::Critical,
            check: duplicate_project_ids,
        },
        ValidationRule {
            name: "project_hierarchy_cycles",
            category: RuleCategory::ReferentialIntegrity,
            priority: Priority::Critical,
            check: project_hierarchy_cycles,
        },
        ValidationRule {
            name: "orphaned_time_entries",
            category: RuleCategory::ReferentialIntegrity,
            priority: Priority::Critical,
            check: orphaned_time_entries,
        },
        ValidationRule {
            name: "orphaned_activity_projects",
            category: RuleCategory::ReferentialIntegrity,
            priority: Priority::High,
            check: orphaned_activity_projects,
        },
        ValidationRule {
            name: "duplicate_time_entries",
            category: RuleCategory::DataConsistency,
            priority: Priority::High,
            check: duplicate_time_entries,
        },
        ValidationRule {
            name: "inverted_date_ranges",
            category: RuleCategory::TemporalConsistency,
            priority: Priority::High,
            check: inverted_date_ranges,
        },
        ValidationRule {
            name: "future_timestamps",
            category: RuleCategory::TemporalConsistency,
            priority: Priority::Medium,
            check: future_timestamps,
        },
        ValidationRule {
            name: "implausible_durations",
            category: RuleCategory::BusinessLogic,
            priority: Priority::Medium,
            check: implausible_durations,
        },
        ValidationRule {
            name: "missing_names",
            category: RuleCategory::Completeness,
            priority: Priority::Low,
            check: missing_names,
        },
    ]
}

fn duplicate_project_ids(data: &DataSnapshot, _now: DateTime<Utc>) -> Vec<Finding> {
    let mut counts: HashMap<Uuid, usize> = HashMap::new();
    for project in &data.projects {
        *counts.entry(project.id).or_default() += 1;
    }
    let mut seen = HashSet::new();
    data.projects
        .iter()
        .filter(|project| counts[&project.id] > 1 && seen.insert(project.id))
        .map(|project| {
            Finding::fixable(
                IssueKind::DuplicateEntity,
                format!(
                    "project id {} appears {} times",
                    project.id, counts[&project.id]
                ),
                vec![EntityRef::Project(project.id)],
            )
        })
        .collect()
}

fn project_hierarchy_cycles(data: &DataSnapshot, _now: DateTime<Utc>) -> Vec<Finding> {
    let mut parents: HashMap<Uuid, Option<Uuid>> = HashMap::new();
    for project in &data.projects {
        parents.entry(project.id).or_insert(project.parent_id);
    }

    let mut reported: BTreeSet<Vec<Uuid>> = BTreeSet::new();
    let mut findings = Vec::new();
    for project in &data.projects {
        let mut path = vec![project.id];
        let mut current = project.id;
        while let Some(Some(parent)) = parents.get(&current) {
            if let Some(start) = path.iter().position(|id| id == parent) {
                let mut cycle = path[start..].to_vec();
                if let Some(min_at) = cycle
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, id)| **id)
                    .map(|(index, _)| index)
                {
                    cycle.rotate_left(min_at);
                }
                if reported.insert(cycle.clone()) {
                    findings.push(Finding::fixable(
                        IssueKind::HierarchyCycle,
                        format!("project hierarchy cycle of length {}", cycle.len()),
                        cycle.into_iter().map(EntityRef::Project).collect(),
                    ));
                }
                break;
            }
            path.push(*parent);
            current = *parent;
        }
    }
    findings
}

fn orphaned_time_entries(data: &DataSnapshot, _now: DateTime<Utc>) -> Vec<Finding> {
    let projects = data.project_ids();
    data.time_entries
        .iter()
        .filter(|entry| !projects.contains(&entry.project_id))
        .map(|entry| {
            Finding::fixable(
                IssueKind::OrphanedReference,
                format!(
                    "time entry {} references missing project {}",
                    entry.id, entry.project_id
                ),
                vec![EntityRef::TimeEntry(entry.id)],
            )
        })
        .collect()
}

fn orphaned_activity_projects(data: &DataSnapshot, _now: DateTime<Utc>) -> Vec<Finding> {
    let projects = data.project_ids();
    data.activities
        .iter()
        .filter_map(|activity| {
            let project = activity.project_id?;
            (!projects.contains(&project)).then(|| {
                Finding::fixable(
                    IssueKind::OrphanedReference,
                    format!(
                        "activity {} references missing project {project}",
                        activity.id
                    ),
                    vec![EntityRef::Activity(activity.id)],
                )
            })
        })
        .collect()
}

fn duplicate_time_entries(data: &DataSnapshot, _now: DateTime<Utc>) -> Vec<Finding> {
    let mut groups: Vec<((Uuid, DateTime<Utc>, DateTime<Utc>), Vec<Uuid>)> = Vec::new();
    for entry in &data.time_entries {
        let key = (entry.project_id, entry.started_at, entry.ended_at);
        match groups.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, ids)) => ids.push(entry.id),
            None => groups.push((key, vec![entry.id])),
        }
    }
    groups
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|((project, started, _), ids)| {
            Finding::fixable(
                IssueKind::DuplicateEntity,
                format!(
                    "{} identical time entries for project {project} starting {started}",
                    ids.len()
                ),
                ids.into_iter().map(EntityRef::TimeEntry).collect(),
            )
        })
        .collect()
}

fn inverted_date_ranges(data: &DataSnapshot, _now: DateTime<Utc>) -> Vec<Finding> {
    let entries = data
        .time_entries
        .iter()
        .filter(|entry| entry.ended_at < entry.started_at)
        .map(|entry| EntityRef::TimeEntry(entry.id));
    let activities = data
        .activities
        .iter()
        .filter(|activity| activity.ended_at.is_some_and(|end| end < activity.started_at))
        .map(|activity| EntityRef::Activity(activity.id));
    let sessions = data
        .sessions
        .iter()
        .filter(|session| session.ended_at.is_some_and(|end| end < session.started_at))
        .map(|session| EntityRef::Session(session.id));
    entries
        .chain(activities)
        .chain(sessions)
        .map(|entity| {
            Finding::fixable(
                IssueKind::InvalidDateRange,
                format!("{entity} ends before it starts"),
                vec![entity],
            )
        })
        .collect()
}

fn future_timestamps(data: &DataSnapshot, now: DateTime<Utc>) -> Vec<Finding> {
    let limit = now + Duration::minutes(FUTURE_TOLERANCE_MINUTES);
    let late = |ts: &DateTime<Utc>| *ts > limit;
    let mut affected = Vec::new();
    affected.extend(
        data.projects
            .iter()
            .filter(|project| late(&project.created_at))
            .map(|project| EntityRef::Project(project.id)),
    );
    affected.extend(
        data.time_entries
            .iter()
            .filter(|entry| late(&entry.started_at) || late(&entry.ended_at))
            .map(|entry| EntityRef::TimeEntry(entry.id)),
    );
    affected.extend(
        data.activities
            .iter()
            .filter(|activity| late(&activity.started_at) || activity.ended_at.as_ref().is_some_and(late))
            .map(|activity| EntityRef::Activity(activity.id)),
    );
    affected.extend(
        data.sessions
            .iter()
            .filter(|session| {
                late(&session.started_at)
                    || late(&session.last_heartbeat)
                    || session.ended_at.as_ref().is_some_and(late)
            })
            .map(|session| EntityRef::Session(session.id)),
    );
    affected
        .into_iter()
        .map(|entity| {
            Finding::fixable(
                IssueKind::FutureTimestamp,
                format!("{entity} has a timestamp in the future"),
                vec![entity],
            )
        })
        .collect()
}

fn implausible_durations(data: &DataSnapshot, _now: DateTime<Utc>) -> Vec<Finding> {
    let max = Duration::hours(MAX_PLAUSIBLE_HOURS);
    data.time_entries
        .iter()
        .filter(|entry| entry.duration() > max)
        .map(|entry| Finding {
            kind: IssueKind::ImplausibleValue,
            description: format!(
                "time entry {} lasts {} hours",
                entry.id,
                entry.duration().num_hours()
            ),
            affected: vec![EntityRef::TimeEntry(entry.id)],
            can_auto_fix: false,
        })
        .collect()
}

fn missing_names(data: &DataSnapshot, _now: DateTime<Utc>) -> Vec<Finding> {
    let projects = data
        .projects
        .iter()
        .filter(|project| project.name.trim().is_empty())
        .map(|project| EntityRef::Project(project.id));
    let activities = data
        .activities
        .iter()
        .filter(|activity| activity.app_name.trim().is_empty())
        .map(|activity| EntityRef::Activity(activity.id));
    projects
        .chain(activities)
        .map(|entity| {
            Finding::fixable(
                IssueKind::MissingField,
                format!("{entity} has no name"),
                vec![entity],
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ward_persistence::{Project, TimeEntry};

    fn run(name: &str, data: &DataSnapshot) -> Vec<Finding> {
        let rule = default_rules()
            .into_iter()
            .find(|rule| rule.name == name)
            .unwrap();
        (rule.check)(data, Utc::now())
    }

    #[test]
    fn registry_is_ordered_by_priority() {
        let rules = default_rules();
        assert!(rules
            .windows(2)
            .all(|pair| pair[0].priority >= pair[1].priority));
        assert_eq!(
            rules
                .iter()
                .filter(|rule| rule.priority == Priority::Critical)
                .count(),
            3
        );
    }

    #[test]
    fn three_project_cycle_is_reported_once() {
        let mut a = Project::new("a");
        let mut b = Project::new("b");
        let c = Project::new("c");
        a.parent_id = Some(b.id);
        b.parent_id = Some(c.id);
        let c = c.with_parent(a.id);
        let leaf = Project::new("leaf").with_parent(a.id);
        let data = DataSnapshot {
            projects: vec![a, b, c, leaf],
            ..Default::default()
        };
        let findings = run("project_hierarchy_cycles", &data);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].affected.len(), 3);
    }

    #[test]
    fn identical_entries_are_grouped() {
        let project = Project::new("p");
        let now = Utc::now();
        let entry = TimeEntry::new(project.id, now - Duration::hours(1), now);
        let mut copy = entry.clone();
        copy.id = Uuid::new_v4();
        let data = DataSnapshot {
            projects: vec![project],
            time_entries: vec![entry.clone(), copy.clone()],
            ..Default::default()
        };
        let findings = run("duplicate_time_entries", &data);
        assert_eq!(findings.len(), 1);
        assert_eq!(
            findings[0].affected,
            vec![EntityRef::TimeEntry(entry.id), EntityRef::TimeEntry(copy.id)]
        );
    }

    #[test]
    fn long_entries_are_not_auto_fixable() {
        let project = Project::new("p");
        let now = Utc::now();
        let data = DataSnapshot {
            time_entries: vec![TimeEntry::new(project.id, now - Duration::hours(30), now)],
            projects: vec![project],
            ..Default::default()
        };
        let findings = run("implausible_durations", &data);
        assert_eq!(findings.len(), 1);
        assert!(!findings[0].can_auto_fix);
    }

    #[test]
    fn clean_snapshot_has_no_findings() {
        let project = Project::new("p");
        let now = Utc::now();
        let data = DataSnapshot {
            time_entries: vec![TimeEntry::new(project.id, now - Duration::hours(1), now)],
            projects: vec![project],
            ..Default::default()
        };
        for rule in default_rules() {
            assert!((rule.check)(&data, now).is_empty(), "{}", rule.name);
        }
    }
}
