//! ---
//! ward_section: "07-resilience-fault-tolerance"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Prometheus metrics for degradation and recovery."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts};
use strum::IntoEnumIterator;
use ward_metrics::SharedRegistry;

use crate::degradation::OperationMode;
use crate::fault::Fault;
use crate::recovery::RecoveryResult;
use crate::strategy::RecoveryStrategy;

/// Metrics published by the resilience subsystem.
#[derive(Clone)]
pub struct ResilienceMetrics {
    registry: SharedRegistry,
    operation_mode: IntGaugeVec,
    mode_transitions_total: IntCounterVec,
    faults_total: IntCounterVec,
    recoveries_total: IntCounterVec,
    recovery_attempts_total: IntCounterVec,
    recovery_duration_seconds: HistogramVec,
}

impl ResilienceMetrics {
    /// Register the resilience metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let operation_mode = IntGaugeVec::new(
            Opts::new(
                "ward_resilience_operation_mode",
                "1 for the currently active operation mode, 0 otherwise",
            ),
            &["mode"],
        )?;
        registry.register(Box::new(operation_mode.clone()))?;

        let mode_transitions_total = IntCounterVec::new(
            Opts::new(
                "ward_resilience_mode_transitions_total",
                "Count of operation mode transitions",
            ),
            &["from", "to"],
        )?;
        registry.register(Box::new(mode_transitions_total.clone()))?;

        let faults_total = IntCounterVec::new(
            Opts::new("ward_resilience_faults_total", "Faults reported to the core"),
            &["category", "severity"],
        )?;
        registry.register(Box::new(faults_total.clone()))?;

        let recoveries_total = IntCounterVec::new(
            Opts::new(
                "ward_resilience_recoveries_total",
                "Completed recovery operations by strategy and outcome",
            ),
            &["strategy", "outcome"],
        )?;
        registry.register(Box::new(recoveries_total.clone()))?;

        let recovery_attempts_total = IntCounterVec::new(
            Opts::new(
                "ward_resilience_recovery_attempts_total",
                "Strategy executions performed while recovering",
            ),
            &["strategy"],
        )?;
        registry.register(Box::new(recovery_attempts_total.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "ward_resilience_recovery_duration_seconds",
            "Wall time from fault report to recovery outcome",
        )
        .buckets(prometheus::exponential_buckets(0.001, 2.0, 18)?);
        let recovery_duration_seconds = HistogramVec::new(histogram_opts, &["strategy"])?;
        registry.register(Box::new(recovery_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            operation_mode,
            mode_transitions_total,
            faults_total,
            recoveries_total,
            recovery_attempts_total,
            recovery_duration_seconds,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Flip the mode gauge so only `mode` reads 1.
    pub fn set_mode(&self, mode: OperationMode) {
        for candidate in OperationMode::iter() {
            self.operation_mode
                .with_label_values(&[candidate.as_str()])
                .set(i64::from(candidate == mode));
        }
    }

    /// Track a transition between operation modes.
    pub fn record_mode_transition(&self, from: OperationMode, to: OperationMode) {
        self.mode_transitions_total
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
        self.set_mode(to);
    }

    pub fn record_fault(&self, fault: &Fault) {
        self.faults_total
            .with_label_values(&[fault.category.as_str(), fault.severity.as_str()])
            .inc();
    }

    /// Register a recovery outcome for observability.
    pub fn record_recovery(
        &self,
        strategy: &RecoveryStrategy,
        result: &RecoveryResult,
        elapsed: Duration,
    ) {
        let label = strategy.label();
        let outcome = if result.is_success() {
            "success"
        } else {
            "failure"
        };
        self.recoveries_total
            .with_label_values(&[label, outcome])
            .inc();
        self.recovery_attempts_total
            .with_label_values(&[label])
            .inc_by(result.attempts_used() as u64);
        self.recovery_duration_seconds
            .with_label_values(&[label])
            .observe(elapsed.as_secs_f64());
    }
}

impl std::fmt::Debug for ResilienceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceMetrics").finish_non_exhaustive()
    }
}
