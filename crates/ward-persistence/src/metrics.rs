//! ---
//! ward_section: "03-persistence-logging"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Prometheus metrics for the backup engine."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};

use crate::index::BackupKind;
use crate::Result;

/// Metrics published by the persistence subsystem.
#[derive(Clone)]
pub struct PersistenceMetrics {
    backups_created: IntCounterVec,
    backup_failures: IntCounterVec,
    restores: IntCounterVec,
    backups_retained: IntGauge,
    operation_duration: HistogramVec,
    #[allow(dead_code)]
    registry: Arc<Registry>,
}

impl PersistenceMetrics {
    /// Register all persistence metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let backups_created = IntCounterVec::new(
            Opts::new(
                "ward_backups_created_total",
                "Total number of backups successfully written",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(backups_created.clone()))?;

        let backup_failures = IntCounterVec::new(
            Opts::new(
                "ward_backup_failures_total",
                "Backup engine operations that failed",
            ),
            &["operation", "reason"],
        )?;
        registry.register(Box::new(backup_failures.clone()))?;

        let restores = IntCounterVec::new(
            Opts::new("ward_restores_total", "Restore attempts by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(restores.clone()))?;

        let backups_retained = IntGauge::with_opts(Opts::new(
            "ward_backups_retained",
            "Backups currently listed in the manifest",
        ))?;
        registry.register(Box::new(backups_retained.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "ward_backup_operation_duration_seconds",
            "Duration of backup engine operations",
        )
        .buckets(prometheus::exponential_buckets(0.001, 2.0, 14)?);
        let operation_duration = HistogramVec::new(histogram_opts, &["operation"])?;
        registry.register(Box::new(operation_duration.clone()))?;

        Ok(Self {
            backups_created,
            backup_failures,
            restores,
            backups_retained,
            operation_duration,
            registry,
        })
    }

    pub fn record_backup_created(&self, kind: BackupKind, seconds: f64) {
        self.backups_created.with_label_values(&[kind.as_str()]).inc();
        self.operation_duration
            .with_label_values(&["create"])
            .observe(seconds);
    }

    /// Record a failed operation. `reason` should be a short stable label.
    pub fn record_failure(&self, operation: &str, reason: &str) {
        self.backup_failures
            .with_label_values(&[operation, reason])
            .inc();
    }

    pub fn record_restore(&self, success: bool, seconds: f64) {
        let outcome = if success { "success" } else { "failure" };
        self.restores.with_label_values(&[outcome]).inc();
        self.operation_duration
            .with_label_values(&["restore"])
            .observe(seconds);
    }

    pub fn set_retained(&self, count: usize) {
        self.backups_retained.set(count as i64);
    }
}

impl std::fmt::Debug for PersistenceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceMetrics").finish_non_exhaustive()
    }
}
