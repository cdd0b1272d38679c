//! ---
//! ward_section: "05-data-integrity"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Prometheus metrics for integrity checks and fixes."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use anyhow::Result;
use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts};
use ward_metrics::SharedRegistry;

use crate::issue::{IntegrityIssue, IssueKind};

#[derive(Clone)]
pub struct IntegrityMetrics {
    issues_detected: IntCounterVec,
    fixes: IntCounterVec,
    open_issues: IntGauge,
    check_duration: HistogramVec,
}

impl IntegrityMetrics {
    /// Register the integrity metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let issues_detected = IntCounterVec::new(
            Opts::new(
                "ward_integrity_issues_detected_total",
                "Issues reported by validation rules",
            ),
            &["rule", "severity"],
        )?;
        registry.register(Box::new(issues_detected.clone()))?;

        let fixes = IntCounterVec::new(
            Opts::new("ward_integrity_fixes_total", "Automatic fix outcomes"),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(fixes.clone()))?;

        let open_issues = IntGauge::with_opts(Opts::new(
            "ward_integrity_open_issues",
            "Issues detected and not yet fixed",
        ))?;
        registry.register(Box::new(open_issues.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "ward_integrity_check_duration_seconds",
            "Duration of validation passes",
        )
        .buckets(prometheus::exponential_buckets(0.0005, 2.0, 14)?);
        let check_duration = HistogramVec::new(histogram_opts, &["scope"])?;
        registry.register(Box::new(check_duration.clone()))?;

        Ok(Self {
            issues_detected,
            fixes,
            open_issues,
            check_duration,
        })
    }

    pub fn record_check(&self, scope: &str, issues: &[IntegrityIssue], seconds: f64) {
        for issue in issues {
            self.issues_detected
                .with_label_values(&[issue.rule.as_str(), issue.severity.as_str()])
                .inc();
        }
        self.check_duration
            .with_label_values(&[scope])
            .observe(seconds);
    }

    pub fn record_fix(&self, kind: IssueKind, success: bool) {
        let outcome = if success { "fixed" } else { "failed" };
        self.fixes.with_label_values(&[kind.as_str(), outcome]).inc();
    }

    pub fn set_open(&self, count: usize) {
        self.open_issues.set(count as i64);
    }
}

impl std::fmt::Debug for IntegrityMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityMetrics").finish_non_exhaustive()
    }
}
