//! ---
//! ward_section: "01-core-functionality"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Composition root wiring degradation, recovery, backups, and integrity."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, error, info, warn};
use ward_common::config::AppConfig;
use ward_integrity::{AutoFixResult, IntegrityMetrics, IntegrityReport, IntegrityValidator, Priority};
use ward_metrics::SharedRegistry;
use ward_persistence::{
    ActiveSessionProbe, BackupEngine, BackupError, BackupInfo, BackupKind, Datastore, DirtyFlag,
    PersistenceMetrics,
};
use ward_resilience::{
    action_fn, select_strategy, AppFeature, DegradationController, ErrorCategory, Fault, HealthSampler, ModeChange, OperationMode, RecoveryAction,
    RecoveryActionId, RecoveryOrchestrator, RecoveryResult, RecoveryStrategy, ResilienceMetrics,
    Severity, SystemHealth,
};

use crate::crash::{CrashRecoveryReport, CrashRecoveryService};
use crate::events::{EventBus, ResilienceEvent};
use crate::resources::ResourceTracker;
use crate::scheduler::{self, SchedulerHandle, SchedulerIntervals};

/// What happened to a reported fault.
#[derive(Debug, Clone, Serialize)]
pub struct FaultOutcome {
    pub mode: OperationMode,
    /// `None` when the fault was absorbed without recovery.
    pub strategy: Option<RecoveryStrategy>,
    pub result: Option<RecoveryResult>,
    pub alerted: bool,
}

impl FaultOutcome {
    pub fn is_absorbed(&self) -> bool {
        self.strategy.is_none()
    }
}

/// Aggregate counters reported to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResilienceStatistics {
    pub total_errors: usize,
    pub critical_errors: usize,
    pub errors_by_category: BTreeMap<ErrorCategory, usize>,
    pub recovery_success_rate: f64,
    pub current_mode: OperationMode,
    /// Overall score of the last health sample, if any was taken.
    pub system_health_score: Option<f64>,
}

/// Result of a scheduled or manual integrity pass.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub report: IntegrityReport,
    pub fixes: Option<AutoFixResult>,
}

#[derive(Debug, Default)]
struct FaultTally {
    total: usize,
    critical: usize,
    by_category: BTreeMap<ErrorCategory, usize>,
}

/// Cloneable handle that takes an emergency backup without an async runtime.
/// Used by the panic hook.
#[derive(Clone)]
pub struct EmergencyBackup {
    backups: Arc<BackupEngine>,
    probe: Arc<dyn ActiveSessionProbe>,
}

/// Upper bound on each datastore lock wait during an emergency backup. A panic
/// inside a datastore update leaves the lock held by the panicking thread.
const EMERGENCY_LOCK_WAIT: Duration = Duration::from_millis(500);

impl EmergencyBackup {
    /// Stop a running timer session, persist it, then snapshot. Never waits
    /// on the datastore lock for longer than a bounded interval; a busy lock
    /// leaves the timer running and fails the backup.
    pub fn run(&self) -> Result<BackupInfo, BackupError> {
        let datastore = self.backups.datastore();
        match self.probe.try_stop_active_session(Utc::now(), EMERGENCY_LOCK_WAIT) {
            Ok(Some(session)) => {
                info!(target: "ward::backup", session = %session.id, "stopped active session before emergency backup");
                if let Err(err) = datastore.try_save_for(EMERGENCY_LOCK_WAIT) {
                    warn!(target: "ward::backup", error = %err, "stopped session not persisted");
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(target: "ward::backup", error = %err, "active session left running");
            }
        }
        self.backups
            .create_backup_within(BackupKind::Emergency, EMERGENCY_LOCK_WAIT)
    }
}

struct FacadeInner {
    config: AppConfig,
    datastore: Arc<Datastore>,
    degradation: Arc<DegradationController>,
    orchestrator: RecoveryOrchestrator,
    backups: Arc<BackupEngine>,
    validator: Arc<IntegrityValidator>,
    crash: CrashRecoveryService,
    resources: Arc<ResourceTracker>,
    /// Set by the rule engine fallback. Lives beside the mode, not in it.
    rule_engine_suspended: Arc<AtomicBool>,
    events: EventBus,
    mode_changes: Mutex<broadcast::Receiver<ModeChange>>,
    emergency: EmergencyBackup,
    tally: Mutex<FaultTally>,
    metrics: Option<ResilienceMetrics>,
    registry: Option<SharedRegistry>,
}

/// Single entry point the application uses to report faults and query the
/// resilience state. Cloning is cheap.
#[derive(Clone)]
pub struct ResilienceFacade {
    inner: Arc<FacadeInner>,
}

impl ResilienceFacade {
    /// Open the datastore and backup directory named by `config` and wire
    /// every subsystem. The datastore doubles as the active session probe.
    pub fn open(config: AppConfig, registry: Option<SharedRegistry>) -> Result<Self> {
        Self::open_with_probe(config, registry, None)
    }

    pub fn open_with_probe(
        config: AppConfig,
        registry: Option<SharedRegistry>,
        probe: Option<Arc<dyn ActiveSessionProbe>>,
    ) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data.directory).with_context(|| {
            format!("unable to create data directory {}", config.data.directory.display())
        })?;

        let (resilience_metrics, persistence_metrics, integrity_metrics) = match &registry {
            Some(registry) => (
                Some(ResilienceMetrics::new(registry.clone())?),
                Some(PersistenceMetrics::new(registry.clone())?),
                Some(IntegrityMetrics::new(registry.clone())?),
            ),
            None => (None, None, None),
        };

        let datastore = Arc::new(Datastore::open(config.datastore_path()).with_context(|| {
            format!("unable to open datastore {}", config.datastore_path().display())
        })?);
        let backups = Arc::new(
            BackupEngine::open(&config.backup, datastore.clone(), persistence_metrics)
                .context("unable to open backup store")?,
        );
        let validator = Arc::new(IntegrityValidator::new(datastore.clone(), integrity_metrics));
        let crash = CrashRecoveryService::new(
            DirtyFlag::new(config.dirty_flag_path()),
            validator.clone(),
            backups.clone(),
        );
        let degradation = Arc::new(DegradationController::from_config(
            &config.degradation,
            resilience_metrics.clone(),
        ));
        let orchestrator =
            RecoveryOrchestrator::from_config(&config.recovery, resilience_metrics.clone());
        let resources = Arc::new(ResourceTracker::new());
        let probe = probe.unwrap_or_else(|| datastore.clone() as Arc<dyn ActiveSessionProbe>);
        let emergency = EmergencyBackup {
            backups: backups.clone(),
            probe,
        };
        let mode_changes = Mutex::new(degradation.subscribe());
        let events = EventBus::new(config.scheduler.event_capacity);

        let facade = Self {
            inner: Arc::new(FacadeInner {
                config,
                datastore,
                degradation,
                orchestrator,
                backups,
                validator,
                crash,
                resources,
                rule_engine_suspended: Arc::new(AtomicBool::new(false)),
                events,
                mode_changes,
                emergency,
                tally: Mutex::new(FaultTally::default()),
                metrics: resilience_metrics,
                registry,
            }),
        };
        facade.register_default_actions();
        info!(
            target: "ward::core",
            data = %facade.inner.config.data.directory.display(),
            backups = %facade.inner.config.backup.directory.display(),
            "resilience core ready"
        );
        Ok(facade)
    }

    fn register_default_actions(&self) {
        let inner = &self.inner;
        let actions = inner.orchestrator.actions();

        // Recovery actions never switch the global mode; only the error
        // counters and health policy in the controller escalate.
        let resources = inner.resources.clone();
        actions.register(
            RecoveryActionId::ReduceLoad,
            action_fn(move |ctx| {
                let resources = resources.clone();
                async move {
                    let freed = resources.cleanup();
                    debug!(
                        target: "ward::recovery",
                        severity = %ctx.fault.severity,
                        freed_bytes = freed,
                        "load reduced"
                    );
                    Ok(true)
                }
            }),
        );

        let validator = inner.validator.clone();
        actions.register(
            RecoveryActionId::RepairDatastore,
            action_fn(move |_| {
                let validator = validator.clone();
                async move {
                    let result = tokio::task::spawn_blocking(move || {
                        let report = validator.perform_full_check();
                        validator.auto_fix_issues(&report.issues)
                    })
                    .await?;
                    Ok::<_, anyhow::Error>(result.failed.is_empty())
                }
            }),
        );

        let backups = inner.backups.clone();
        actions.register(
            RecoveryActionId::RestoreLatestBackup,
            action_fn(move |_| {
                let backups = backups.clone();
                async move {
                    tokio::task::spawn_blocking(move || -> Result<bool> {
                        let latest = backups
                            .latest_backup()
                            .ok_or_else(|| anyhow!("no backup available to restore"))?;
                        backups.restore_into(&latest)?;
                        Ok(true)
                    })
                    .await?
                }
            }),
        );

        let datastore = inner.datastore.clone();
        actions.register(
            RecoveryActionId::ResetTimer,
            action_fn(move |_| {
                let datastore = datastore.clone();
                async move {
                    if let Some(session) = datastore.stop_active_session(Utc::now()) {
                        info!(target: "ward::recovery", session = %session.id, "timer session reset");
                        datastore.save()?;
                    }
                    Ok::<_, anyhow::Error>(true)
                }
            }),
        );

        let suspended = inner.rule_engine_suspended.clone();
        actions.register(
            RecoveryActionId::DisableRuleEngine,
            action_fn(move |ctx| {
                let suspended = suspended.clone();
                async move {
                    if !suspended.swap(true, Ordering::AcqRel) {
                        warn!(target: "ward::recovery", fault = %ctx.fault, "rule engine suspended");
                    }
                    Ok(true)
                }
            }),
        );

        for (id, feature) in [
            (RecoveryActionId::BasicSearch, "basic search"),
            (RecoveryActionId::ManualTracking, "manual tracking"),
        ] {
            actions.register(
                id,
                action_fn(move |ctx| async move {
                    info!(target: "ward::recovery", fault = %ctx.fault, fallback = feature, "falling back");
                    Ok(true)
                }),
            );
        }
    }

    /// Replace the implementation behind a named recovery action.
    pub fn register_action(&self, id: RecoveryActionId, action: Arc<dyn RecoveryAction>) {
        self.inner.orchestrator.actions().register(id, action);
    }

    /// Report a fault. Low severity faults are logged and absorbed; anything
    /// else runs the selected recovery strategy. Alerts are published only
    /// for failed recoveries and strategies that need the user.
    pub async fn handle_fault(
        &self,
        fault: Fault,
        retry: Option<Arc<dyn RecoveryAction>>,
    ) -> FaultOutcome {
        let inner = &self.inner;
        match fault.severity {
            Severity::Low | Severity::Medium => {
                warn!(target: "ward::core", fault = %fault, context = ?fault.context, "fault reported")
            }
            Severity::High | Severity::Critical => {
                error!(target: "ward::core", fault = %fault, context = ?fault.context, "fault reported")
            }
        }
        {
            let mut tally = inner.tally.lock();
            tally.total += 1;
            if fault.severity == Severity::Critical {
                tally.critical += 1;
            }
            *tally.by_category.entry(fault.category).or_default() += 1;
        }
        if let Some(metrics) = &inner.metrics {
            metrics.record_fault(&fault);
        }

        let mode = inner.degradation.record_error(fault.severity);
        self.forward_mode_changes();
        if fault.severity == Severity::Low {
            return FaultOutcome {
                mode,
                strategy: None,
                result: None,
                alerted: false,
            };
        }

        let strategy = select_strategy(fault.category, fault.kind, &fault.case);
        let result = inner
            .orchestrator
            .attempt_with_strategy(fault.clone(), strategy, retry)
            .await;
        self.forward_mode_changes();

        inner.events.publish(ResilienceEvent::RecoveryFinished {
            fault: fault.clone(),
            strategy,
            result: result.clone(),
        });
        if strategy == RecoveryStrategy::SystemRestart {
            inner.events.publish(ResilienceEvent::RestartRequested {
                fault: fault.clone(),
            });
        }
        let alerted = !result.is_success() || strategy.requires_user();
        if alerted {
            let message = match result.failure() {
                Some(cause) => format!("{fault}: {cause}"),
                None => format!("{fault}: user action suggested"),
            };
            inner.events.publish(ResilienceEvent::AlertRaised {
                fault,
                message,
                requires_user: strategy.requires_user(),
            });
        }
        FaultOutcome {
            mode: inner.degradation.current_mode(),
            strategy: Some(strategy),
            result: Some(result),
            alerted,
        }
    }

    /// Feed a health sample to the degradation controller.
    pub fn apply_health(&self, health: SystemHealth) -> OperationMode {
        let mode = self.inner.degradation.evaluate(health);
        self.forward_mode_changes();
        mode
    }

    /// Sample health on the blocking pool, then apply it.
    pub async fn sample_health(&self, sampler: Arc<dyn HealthSampler>) -> Result<OperationMode> {
        let health = tokio::task::spawn_blocking(move || sampler.sample())
            .await
            .context("health sampler panicked")?;
        Ok(self.apply_health(health))
    }

    /// Republish controller transitions on the event bus. Entering
    /// [`OperationMode::Emergency`] also triggers an immediate resource cleanup.
    fn forward_mode_changes(&self) {
        let mut receiver = self.inner.mode_changes.lock();
        loop {
            match receiver.try_recv() {
                Ok(change) => {
                    match change.mode {
                        OperationMode::Emergency => {
                            self.inner.resources.cleanup();
                        }
                        OperationMode::Normal => self.resume_rule_engine(),
                        _ => {}
                    }
                    self.inner.events.publish(change.into());
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(target: "ward::core", skipped, "mode change notifications lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    pub fn is_feature_available(&self, feature: AppFeature) -> bool {
        self.inner.degradation.is_feature_available(feature)
    }

    /// The rule engine runs only when the mode allows it and no recovery
    /// has suspended it since the last return to normal mode.
    pub fn is_rule_engine_enabled(&self) -> bool {
        !self.inner.rule_engine_suspended.load(Ordering::Acquire)
            && self.inner.degradation.is_feature_available(AppFeature::RuleEngine)
    }

    /// Lift a suspension set by the rule engine fallback.
    pub fn resume_rule_engine(&self) {
        if self.inner.rule_engine_suspended.swap(false, Ordering::AcqRel) {
            info!(target: "ward::recovery", "rule engine resumed");
        }
    }

    pub fn current_mode(&self) -> OperationMode {
        self.inner.degradation.current_mode()
    }

    /// Manually switch modes. The next health evaluation may revert it.
    pub fn force_mode(&self, mode: OperationMode, reason: impl Into<String>) -> bool {
        let changed = self.inner.degradation.force_mode(mode, reason);
        self.forward_mode_changes();
        changed
    }

    pub fn statistics(&self) -> ResilienceStatistics {
        let inner = &self.inner;
        let tally = inner.tally.lock();
        ResilienceStatistics {
            total_errors: tally.total,
            critical_errors: tally.critical,
            errors_by_category: tally.by_category.clone(),
            recovery_success_rate: inner.orchestrator.statistics().success_rate,
            current_mode: inner.degradation.current_mode(),
            system_health_score: inner
                .degradation
                .last_health()
                .map(|health| health.overall_score()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.inner.events.subscribe()
    }

    /// Run the crash recovery sequence and announce what it found.
    pub async fn run_startup(&self) -> Result<CrashRecoveryReport> {
        let this = self.clone();
        let report = tokio::task::spawn_blocking(move || this.inner.crash.run_startup())
            .await
            .context("crash recovery panicked")??;
        if report.issues_found > 0 {
            self.inner.events.publish(ResilienceEvent::IssuesDetected {
                scope: "startup".to_owned(),
                total: report.issues_found,
                critical: report.issues_found,
            });
        }
        if let Some(info) = &report.emergency_backup {
            self.inner
                .events
                .publish(ResilienceEvent::BackupCompleted { info: info.clone() });
        }
        Ok(report)
    }

    pub async fn create_backup(&self, kind: BackupKind) -> Result<BackupInfo> {
        let backups = self.inner.backups.clone();
        let outcome = tokio::task::spawn_blocking(move || backups.create_backup(kind))
            .await
            .context("backup task panicked")?;
        self.announce_backup(kind, outcome)
    }

    /// Stop an active timer session and take an emergency backup.
    pub async fn emergency_backup(&self) -> Result<BackupInfo> {
        let emergency = self.inner.emergency.clone();
        let outcome = tokio::task::spawn_blocking(move || emergency.run())
            .await
            .context("emergency backup task panicked")?;
        self.announce_backup(BackupKind::Emergency, outcome)
    }

    fn announce_backup(
        &self,
        kind: BackupKind,
        outcome: Result<BackupInfo, BackupError>,
    ) -> Result<BackupInfo> {
        match outcome {
            Ok(info) => {
                self.inner
                    .events
                    .publish(ResilienceEvent::BackupCompleted { info: info.clone() });
                Ok(info)
            }
            Err(err) => {
                self.inner.events.publish(ResilienceEvent::BackupFailed {
                    kind,
                    reason: err.to_string(),
                });
                Err(err).with_context(|| format!("{kind} backup failed"))
            }
        }
    }

    /// Take an automatic backup when one is due. Returns `None` when skipped.
    pub async fn run_automatic_backup(&self) -> Result<Option<BackupInfo>> {
        let inner = &self.inner;
        if !inner.config.backup.automatic {
            return Ok(None);
        }
        if !inner.degradation.is_feature_available(AppFeature::AutomaticBackup) {
            debug!(target: "ward::backup", mode = %self.current_mode(), "automatic backup disabled in current mode");
            return Ok(None);
        }
        if !inner.backups.should_run_automatic(Utc::now()) {
            return Ok(None);
        }
        self.create_backup(BackupKind::Automatic).await.map(Some)
    }

    /// Run a full integrity pass, fixing what it can when configured to.
    pub async fn run_full_check(&self) -> Result<CheckOutcome> {
        let validator = self.inner.validator.clone();
        let auto_fix = self.inner.config.integrity.auto_fix;
        let outcome = tokio::task::spawn_blocking(move || {
            let report = validator.perform_full_check();
            let fixes = (auto_fix && report.issues.iter().any(|issue| issue.can_auto_fix))
                .then(|| validator.auto_fix_issues(&report.issues));
            CheckOutcome { report, fixes }
        })
        .await
        .context("integrity check panicked")?;
        if !outcome.report.is_clean() {
            self.inner.events.publish(ResilienceEvent::IssuesDetected {
                scope: "full".to_owned(),
                total: outcome.report.issues.len(),
                critical: outcome.report.count_at_least(Priority::Critical),
            });
        }
        Ok(outcome)
    }

    /// Start the periodic tasks.
    pub fn start(&self, sampler: Arc<dyn HealthSampler>) -> SchedulerHandle {
        let intervals = SchedulerIntervals::from_config(&self.inner.config);
        scheduler::spawn(self.clone(), sampler, intervals)
    }

    /// Stop the scheduler if one runs, persist the datastore, and record a
    /// clean shutdown.
    pub async fn shutdown(&self, scheduler: Option<SchedulerHandle>) -> Result<()> {
        if let Some(handle) = scheduler {
            handle.shutdown().await?;
        }
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            inner.datastore.save().context("failed to persist datastore")?;
            inner.crash.mark_clean_shutdown()
        })
        .await
        .context("shutdown task panicked")??;
        info!(target: "ward::core", "resilience core stopped");
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn datastore(&self) -> &Arc<Datastore> {
        &self.inner.datastore
    }

    pub fn backups(&self) -> &Arc<BackupEngine> {
        &self.inner.backups
    }

    pub fn validator(&self) -> &Arc<IntegrityValidator> {
        &self.inner.validator
    }

    pub fn degradation(&self) -> &DegradationController {
        &self.inner.degradation
    }

    pub fn orchestrator(&self) -> &RecoveryOrchestrator {
        &self.inner.orchestrator
    }

    pub fn resources(&self) -> &ResourceTracker {
        &self.inner.resources
    }

    pub fn crash_recovery(&self) -> &CrashRecoveryService {
        &self.inner.crash
    }

    /// Handle for taking an emergency backup from synchronous contexts.
    pub fn emergency_handle(&self) -> EmergencyBackup {
        self.inner.emergency.clone()
    }

    pub fn registry(&self) -> Option<&SharedRegistry> {
        self.inner.registry.as_ref()
    }
}

impl std::fmt::Debug for ResilienceFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceFacade")
            .field("mode", &self.current_mode())
            .field("backups", &self.inner.backups.directory())
            .finish_non_exhaustive()
    }
}
