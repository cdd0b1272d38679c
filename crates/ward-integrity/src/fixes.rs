//! ---
//! ward_section: "05-data-integrity"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Fix routines dispatched by issue kind."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use ward_persistence::DataSnapshot;

use crate::issue::{EntityRef, IntegrityIssue, IssueKind};
use crate::IntegrityError;

pub const DEFAULT_PROJECT_NAME: &str = "Untitled project";
pub const DEFAULT_APP_NAME: &str = "unknown";

/// Apply the fix for `issue` to `data`. Fails without side effects when the
/// issue no longer matches the data.
pub fn apply_fix(
    data: &mut DataSnapshot,
    issue: &IntegrityIssue,
    now: DateTime<Utc>,
) -> Result<(), IntegrityError> {
    if !issue.can_auto_fix {
        return Err(IntegrityError::NotAutoFixable(issue.kind));
    }
    let first = *issue
        .affected_entities
        .first()
        .ok_or(IntegrityError::NoAffectedEntities(issue.id))?;
    match issue.kind {
        IssueKind::DuplicateEntity => remove_duplicates(data, first, &issue.affected_entities[1..]),
        IssueKind::HierarchyCycle => break_cycle(data, first),
        IssueKind::OrphanedReference => remove_orphan(data, first),
        IssueKind::InvalidDateRange => swap_range(data, first),
        IssueKind::FutureTimestamp => clamp_to_now(data, first, now),
        IssueKind::MissingField => default_name(data, first),
        IssueKind::ImplausibleValue => Err(IntegrityError::NotAutoFixable(issue.kind)),
    }
}

fn remove_duplicates(
    data: &mut DataSnapshot,
    first: EntityRef,
    rest: &[EntityRef],
) -> Result<(), IntegrityError> {
    match first {
        EntityRef::Project(id) => {
            let copies = data.projects.iter().filter(|p| p.id == id).count();
            if copies < 2 {
                return Err(IntegrityError::AlreadyResolved(first));
            }
            let mut kept = false;
            data.projects.retain(|project| {
                if project.id != id {
                    return true;
                }
                !std::mem::replace(&mut kept, true)
            });
            Ok(())
        }
        EntityRef::TimeEntry(keep) if !rest.is_empty() => {
            if !exists(data, first) {
                return Err(IntegrityError::EntityMissing(first));
            }
            // Copies may share the kept id, so the first occurrence is kept
            // by position.
            let duplicates: HashSet<_> = rest.iter().map(EntityRef::id).collect();
            let before = data.time_entries.len();
            let mut kept = false;
            data.time_entries.retain(|entry| {
                if entry.id == keep && !std::mem::replace(&mut kept, true) {
                    return true;
                }
                !duplicates.contains(&entry.id)
            });
            if data.time_entries.len() == before {
                return Err(IntegrityError::AlreadyResolved(first));
            }
            Ok(())
        }
        other => Err(IntegrityError::Unsupported(IssueKind::DuplicateEntity, other)),
    }
}

fn break_cycle(data: &mut DataSnapshot, entity: EntityRef) -> Result<(), IntegrityError> {
    let EntityRef::Project(id) = entity else {
        return Err(IntegrityError::Unsupported(IssueKind::HierarchyCycle, entity));
    };
    let project = data
        .projects
        .iter_mut()
        .find(|project| project.id == id)
        .ok_or(IntegrityError::EntityMissing(entity))?;
    if project.parent_id.take().is_none() {
        return Err(IntegrityError::AlreadyResolved(entity));
    }
    Ok(())
}

fn remove_orphan(data: &mut DataSnapshot, entity: EntityRef) -> Result<(), IntegrityError> {
    match entity {
        EntityRef::TimeEntry(id) => {
            let project_id = data
                .time_entries
                .iter()
                .find(|entry| entry.id == id)
                .map(|entry| entry.project_id)
                .ok_or(IntegrityError::EntityMissing(entity))?;
            if data.projects.iter().any(|project| project.id == project_id) {
                return Err(IntegrityError::AlreadyResolved(entity));
            }
            data.time_entries.retain(|entry| entry.id != id);
            Ok(())
        }
        EntityRef::Activity(id) => {
            let known = data.project_ids();
            let activity = data
                .activities
                .iter_mut()
                .find(|activity| activity.id == id)
                .ok_or(IntegrityError::EntityMissing(entity))?;
            match activity.project_id {
                Some(project_id) if !known.contains(&project_id) => {
                    activity.project_id = None;
                    Ok(())
                }
                _ => Err(IntegrityError::AlreadyResolved(entity)),
            }
        }
        other => Err(IntegrityError::Unsupported(IssueKind::OrphanedReference, other)),
    }
}

fn swap_range(data: &mut DataSnapshot, entity: EntityRef) -> Result<(), IntegrityError> {
    let missing = IntegrityError::EntityMissing(entity);
    let resolved = IntegrityError::AlreadyResolved(entity);
    match entity {
        EntityRef::TimeEntry(id) => {
            let entry = data
                .time_entries
                .iter_mut()
                .find(|entry| entry.id == id)
                .ok_or(missing)?;
            if entry.ended_at >= entry.started_at {
                return Err(resolved);
            }
            std::mem::swap(&mut entry.started_at, &mut entry.ended_at);
        }
        EntityRef::Activity(id) => {
            let activity = data
                .activities
                .iter_mut()
                .find(|activity| activity.id == id)
                .ok_or(missing)?;
            match activity.ended_at {
                Some(end) if end < activity.started_at => {
                    activity.ended_at = Some(activity.started_at);
                    activity.started_at = end;
                }
                _ => return Err(resolved),
            }
        }
        EntityRef::Session(id) => {
            let session = data
                .sessions
                .iter_mut()
                .find(|session| session.id == id)
                .ok_or(missing)?;
            match session.ended_at {
                Some(end) if end < session.started_at => {
                    session.ended_at = Some(session.started_at);
                    session.started_at = end;
                }
                _ => return Err(resolved),
            }
        }
        EntityRef::Project(_) => {
            return Err(IntegrityError::Unsupported(IssueKind::InvalidDateRange, entity))
        }
    }
    Ok(())
}

fn clamp_to_now(
    data: &mut DataSnapshot,
    entity: EntityRef,
    now: DateTime<Utc>,
) -> Result<(), IntegrityError> {
    let clamp = |ts: &mut DateTime<Utc>| {
        if *ts > now {
            *ts = now;
        }
    };
    match entity {
        EntityRef::Project(id) => {
            let project = data
                .projects
                .iter_mut()
                .find(|project| project.id == id)
                .ok_or(IntegrityError::EntityMissing(entity))?;
            clamp(&mut project.created_at);
        }
        EntityRef::TimeEntry(id) => {
            let entry = data
                .time_entries
                .iter_mut()
                .find(|entry| entry.id == id)
                .ok_or(IntegrityError::EntityMissing(entity))?;
            clamp(&mut entry.started_at);
            clamp(&mut entry.ended_at);
        }
        EntityRef::Activity(id) => {
            let activity = data
                .activities
                .iter_mut()
                .find(|activity| activity.id == id)
                .ok_or(IntegrityError::EntityMissing(entity))?;
            clamp(&mut activity.started_at);
            if let Some(end) = activity.ended_at.as_mut() {
                clamp(end);
            }
        }
        EntityRef::Session(id) => {
            let session = data
                .sessions
                .iter_mut()
                .find(|session| session.id == id)
                .ok_or(IntegrityError::EntityMissing(entity))?;
            clamp(&mut session.started_at);
            clamp(&mut session.last_heartbeat);
            if let Some(end) = session.ended_at.as_mut() {
                clamp(end);
            }
        }
    }
    Ok(())
}

fn default_name(data: &mut DataSnapshot, entity: EntityRef) -> Result<(), IntegrityError> {
    match entity {
        EntityRef::Project(id) => {
            let project = data
                .projects
                .iter_mut()
                .find(|project| project.id == id)
                .ok_or(IntegrityError::EntityMissing(entity))?;
            if !project.name.trim().is_empty() {
                return Err(IntegrityError::AlreadyResolved(entity));
            }
            project.name = DEFAULT_PROJECT_NAME.to_owned();
        }
        EntityRef::Activity(id) => {
            let activity = data
                .activities
                .iter_mut()
                .find(|activity| activity.id == id)
                .ok_or(IntegrityError::EntityMissing(entity))?;
            if !activity.app_name.trim().is_empty() {
                return Err(IntegrityError::AlreadyResolved(entity));
            }
            activity.app_name = DEFAULT_APP_NAME.to_owned();
        }
        other => return Err(IntegrityError::Unsupported(IssueKind::MissingField, other)),
    }
    Ok(())
}

fn exists(data: &DataSnapshot, entity: EntityRef) -> bool {
    match entity {
        EntityRef::Project(id) => data.projects.iter().any(|p| p.id == id),
        EntityRef::Activity(id) => data.activities.iter().any(|a| a.id == id),
        EntityRef::TimeEntry(id) => data.time_entries.iter().any(|e| e.id == id),
        EntityRef::Session(id) => data.sessions.iter().any(|s| s.id == id),
    }
}
