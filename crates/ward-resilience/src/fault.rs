//! ---
//! ward_section: "07-resilience-fault-tolerance"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Fault taxonomy reported by application layers."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity attached to every reported fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Absorbed locally and logged.
    Low,
    /// Absorbed locally, recovery is attempted.
    Medium,
    /// Escalates the operation mode once the repeat threshold is reached.
    High,
    /// Escalates immediately and unconditionally.
    Critical,
}

impl Severity {
    /// Static label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of failure, independent of which layer raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Needs the user to grant access; never retried automatically.
    PermissionDenied,
    /// Memory, disk, or CPU exhaustion; triggers degradation.
    ResourceExhausted,
    /// Damaged datastore or backup content.
    Corruption,
    /// Network or disk hiccup that is expected to clear.
    TransientIo,
    /// Invalid settings; fatal to the attempted operation.
    ConfigurationInvalid,
    /// Operation exceeded its deadline.
    Timeout,
}

impl ErrorKind {
    /// Whether the orchestrator may run more than one attempt for this kind.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::PermissionDenied | ErrorKind::ConfigurationInvalid
        )
    }

    /// Whether a failure of this kind always needs a human to act.
    pub fn requires_user_action(&self) -> bool {
        !self.is_retryable()
    }

    /// Severity assumed when the reporter does not supply one.
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorKind::TransientIo => Severity::Low,
            ErrorKind::Timeout => Severity::Medium,
            ErrorKind::PermissionDenied
            | ErrorKind::ResourceExhausted
            | ErrorKind::ConfigurationInvalid => Severity::High,
            ErrorKind::Corruption => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Corruption => "corruption",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::ConfigurationInvalid => "configuration_invalid",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application layer that raised a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ActivityTracking,
    Timer,
    Datastore,
    RuleEngine,
    Search,
    System,
    Backup,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ActivityTracking => "activity_tracking",
            ErrorCategory::Timer => "timer",
            ErrorCategory::Datastore => "datastore",
            ErrorCategory::RuleEngine => "rule_engine",
            ErrorCategory::Search => "search",
            ErrorCategory::System => "system",
            ErrorCategory::Backup => "backup",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fault report raised by one of the application layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    /// Layer that raised the fault.
    pub category: ErrorCategory,
    /// Failure kind used for strategy selection.
    pub kind: ErrorKind,
    /// Layer-specific error case, e.g. `"fatal"` or `"save_failed"`.
    pub case: String,
    /// Reported severity.
    pub severity: Severity,
    /// Free-form metadata describing the failing operation.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// When the fault was observed.
    pub occurred_at: DateTime<Utc>,
}

impl Fault {
    /// Build a fault with the kind's default severity.
    pub fn new(category: ErrorCategory, kind: ErrorKind, case: impl Into<String>) -> Self {
        Self {
            category,
            kind,
            case: case.into(),
            severity: kind.default_severity(),
            context: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    /// Override the reported severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Attach a context key/value pair.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ({}) severity={}",
            self.category, self.kind, self.case, self.severity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_and_configuration_are_not_retryable() {
        assert!(!ErrorKind::PermissionDenied.is_retryable());
        assert!(!ErrorKind::ConfigurationInvalid.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::TransientIo.is_retryable());
    }

    #[test]
    fn severity_ordering_matches_escalation() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        let fault = Fault::new(ErrorCategory::Datastore, ErrorKind::Corruption, "checksum");
        assert_eq!(fault.severity, Severity::Critical);
        let fault = fault.with_severity(Severity::Low).with_context("table", "projects");
        assert_eq!(fault.severity, Severity::Low);
        assert_eq!(fault.context.get("table").map(String::as_str), Some("projects"));
    }
}
