//! ---
//! ward_section: "05-data-integrity"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Runs validation rules and applies automatic fixes."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use ward_persistence::Datastore;

use crate::fixes::apply_fix;
use crate::issue::{AutoFixResult, FixFailure, IntegrityIssue, IntegrityReport, Priority};
use crate::metrics::IntegrityMetrics;
use crate::rules::{default_rules, ValidationRule};

#[derive(Debug, Default)]
struct ValidatorState {
    open: Vec<IntegrityIssue>,
    last_issue_id: u64,
    last_full_check: Option<DateTime<Utc>>,
}

impl ValidatorState {
    fn next_issue_id(&mut self) -> u64 {
        let max_open = self.open.iter().map(|issue| issue.id).max().unwrap_or(0);
        self.last_issue_id = self.last_issue_id.max(max_open) + 1;
        self.last_issue_id
    }
}

/// Validates the datastore against the registered rules.
pub struct IntegrityValidator {
    datastore: Arc<Datastore>,
    rules: Vec<ValidationRule>,
    state: Mutex<ValidatorState>,
    metrics: Option<IntegrityMetrics>,
}

impl IntegrityValidator {
    pub fn new(datastore: Arc<Datastore>, metrics: Option<IntegrityMetrics>) -> Self {
        Self::with_rules(datastore, default_rules(), metrics)
    }

    pub fn with_rules(
        datastore: Arc<Datastore>,
        rules: Vec<ValidationRule>,
        metrics: Option<IntegrityMetrics>,
    ) -> Self {
        Self {
            datastore,
            rules,
            state: Mutex::new(ValidatorState::default()),
            metrics,
        }
    }

    pub fn rules(&self) -> &[ValidationRule] {
        &self.rules
    }

    /// Run every rule.
    pub fn perform_full_check(&self) -> IntegrityReport {
        let report = self.run("full", |_| true);
        self.state.lock().last_full_check = Some(report.checked_at);
        report
    }

    /// Run only the critical rules.
    pub fn perform_quick_check(&self) -> IntegrityReport {
        self.run("quick", |rule| rule.priority == Priority::Critical)
    }

    fn run(&self, scope: &str, select: impl Fn(&ValidationRule) -> bool) -> IntegrityReport {
        let started = Instant::now();
        let now = Utc::now();
        let snapshot = self.datastore.snapshot();
        let selected: Vec<&ValidationRule> = self.rules.iter().filter(|rule| select(*rule)).collect();

        let mut found = Vec::new();
        for rule in &selected {
            let findings = (rule.check)(&snapshot, now);
            if !findings.is_empty() {
                debug!(
                    target: "ward::integrity",
                    rule = rule.name,
                    count = findings.len(),
                    "rule reported findings"
                );
            }
            found.extend(findings.into_iter().map(|finding| (*rule, finding)));
        }

        let ran: HashSet<&str> = selected.iter().map(|rule| rule.name).collect();
        let (issues, open_count) = {
            let mut state = self.state.lock();
            state.open.retain(|issue| !ran.contains(issue.rule.as_str()));
            let mut issues = Vec::with_capacity(found.len());
            for (rule, finding) in found {
                let issue = IntegrityIssue {
                    id: state.next_issue_id(),
                    kind: finding.kind,
                    severity: rule.priority,
                    description: finding.description,
                    affected_entities: finding.affected,
                    can_auto_fix: finding.can_auto_fix,
                    detected_at: now,
                    rule: rule.name.to_owned(),
                };
                state.open.push(issue.clone());
                issues.push(issue);
            }
            (issues, state.open.len())
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_check(scope, &issues, started.elapsed().as_secs_f64());
            metrics.set_open(open_count);
        }
        if issues.is_empty() {
            info!(target: "ward::integrity", scope, rules = selected.len(), "integrity check clean");
        } else {
            warn!(
                target: "ward::integrity",
                scope,
                rules = selected.len(),
                issues = issues.len(),
                critical = issues.iter().filter(|i| i.severity == Priority::Critical).count(),
                "integrity issues detected"
            );
        }
        IntegrityReport {
            checked_at: now,
            rules_run: selected.len(),
            issues,
        }
    }

    /// Fix every auto-fixable issue in `issues`. Issues that cannot be
    /// auto-fixed are skipped. One failing fix does not stop the others.
    pub fn auto_fix_issues(&self, issues: &[IntegrityIssue]) -> AutoFixResult {
        let now = Utc::now();
        let mut result = AutoFixResult::default();
        self.datastore.update(|data| {
            for issue in issues.iter().filter(|issue| issue.can_auto_fix) {
                match apply_fix(data, issue, now) {
                    Ok(()) => result.fixed.push(issue.clone()),
                    Err(err) => {
                        warn!(
                            target: "ward::integrity",
                            issue = issue.id,
                            kind = %issue.kind,
                            error = %err,
                            "automatic fix failed"
                        );
                        result.failed.push(FixFailure {
                            issue: issue.clone(),
                            reason: err.to_string(),
                        });
                    }
                }
            }
        });

        if !result.fixed.is_empty() {
            if let Err(err) = self.datastore.save() {
                error!(target: "ward::integrity", error = %err, "failed to persist fixed datastore");
            }
        }

        let open_count = {
            let fixed: HashSet<u64> = result.fixed.iter().map(|issue| issue.id).collect();
            let mut state = self.state.lock();
            state.open.retain(|issue| !fixed.contains(&issue.id));
            state.open.len()
        };
        if let Some(metrics) = &self.metrics {
            for issue in &result.fixed {
                metrics.record_fix(issue.kind, true);
            }
            for failure in &result.failed {
                metrics.record_fix(failure.issue.kind, false);
            }
            metrics.set_open(open_count);
        }
        info!(
            target: "ward::integrity",
            fixed = result.fixed.len(),
            failed = result.failed.len(),
            "automatic fixes applied"
        );
        result
    }

    /// Issues found by the latest checks and not fixed since.
    pub fn open_issues(&self) -> Vec<IntegrityIssue> {
        self.state.lock().open.clone()
    }

    pub fn last_full_check(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_full_check
    }

    /// True when no full check ran within `interval` of `now`.
    pub fn is_full_check_due(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        match self.last_full_check() {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .map(|elapsed| elapsed >= interval)
                .unwrap_or(false),
        }
    }
}

impl std::fmt::Debug for IntegrityValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityValidator")
            .field("rules", &self.rules.len())
            .finish_non_exhaustive()
    }
}
