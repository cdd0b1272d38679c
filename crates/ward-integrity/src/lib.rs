//! ---
//! ward_section: "05-data-integrity"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Integrity rules, validation passes, and automatic fixes."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
//! Data integrity checks over the datastore snapshot.
//!
//! Rules are plain functions registered in a fixed order. The validator runs
//! them, keeps the list of open issues, and applies fixes one issue at a time
//! so a failing fix never blocks the rest of the batch.

pub mod fixes;
pub mod issue;
pub mod metrics;
pub mod rules;
pub mod validator;

use issue::{EntityRef, IssueKind};

/// Reasons a single fix can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("{0} issues are not auto-fixable")]
    NotAutoFixable(IssueKind),
    #[error("issue {0} names no affected entities")]
    NoAffectedEntities(u64),
    #[error("{0} no longer exists")]
    EntityMissing(EntityRef),
    #[error("{0} no longer exhibits the issue")]
    AlreadyResolved(EntityRef),
    #[error("cannot fix {0} on {1}")]
    Unsupported(IssueKind, EntityRef),
}

pub use issue::{
    AutoFixResult, FixFailure, IntegrityIssue, IntegrityReport, Priority, RuleCategory,
};
pub use metrics::IntegrityMetrics;
pub use rules::{default_rules, Finding, ValidationRule};
pub use validator::IntegrityValidator;
