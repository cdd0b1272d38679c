//! ---
//! ward_section: "07-resilience-fault-tolerance"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Operation mode state machine driven by health samples and fault severity."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::EnumIter;
use tokio::sync::broadcast;
use tracing::{debug, info};
use ward_common::config::DegradationConfig;

use crate::fault::Severity;
use crate::features::{features_for_mode, AppFeature};
use crate::health::SystemHealth;
use crate::metrics::ResilienceMetrics;

const EMERGENCY_MEMORY: f64 = 0.9;
const EMERGENCY_CPU: f64 = 0.95;
const MINIMAL_MEMORY: f64 = 0.8;
const MINIMAL_CPU: f64 = 0.85;
const MINIMAL_DISK: f64 = 0.1;
const REDUCED_MEMORY: f64 = 0.7;
const REDUCED_CPU: f64 = 0.75;
const REDUCED_DISK: f64 = 0.2;
const RECOVERY_SCORE: f64 = 0.8;

/// Operating modes, from fully featured to survival-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Normal,
    ReducedFunctionality,
    Minimal,
    Offline,
    Emergency,
}

impl OperationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationMode::Normal => "normal",
            OperationMode::ReducedFunctionality => "reduced_functionality",
            OperationMode::Minimal => "minimal",
            OperationMode::Offline => "offline",
            OperationMode::Emergency => "emergency",
        }
    }

    /// Ordering used when error floors are applied. Offline only loses sync,
    /// so it ranks just above normal.
    pub fn severity_rank(&self) -> u8 {
        match self {
            OperationMode::Normal => 0,
            OperationMode::Offline => 1,
            OperationMode::ReducedFunctionality => 2,
            OperationMode::Minimal => 3,
            OperationMode::Emergency => 4,
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a mode transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationTrigger {
    Automatic,
    Manual,
}

/// Diagnostic record of a single transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationEvent {
    pub timestamp: DateTime<Utc>,
    pub from: OperationMode,
    pub to: OperationMode,
    pub reason: String,
    pub trigger: DegradationTrigger,
}

/// Notification broadcast on every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeChange {
    pub mode: OperationMode,
    pub previous: OperationMode,
    pub reason: String,
    pub trigger: DegradationTrigger,
}

/// Error occurrences inside the trailing window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounts {
    pub high: usize,
    pub critical: usize,
}

/// Target mode plus a human readable explanation.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub mode: OperationMode,
    pub reason: String,
}

/// Pure transition function from health and recent errors to a target mode.
#[derive(Debug, Clone, Copy)]
pub struct DegradationPolicy {
    /// High severity errors inside the window needed before escalating.
    pub high_severity_threshold: usize,
    /// Trailing window used to count errors.
    pub error_window: Duration,
}

impl DegradationPolicy {
    pub fn new(high_severity_threshold: usize, error_window: Duration) -> Self {
        Self {
            high_severity_threshold: high_severity_threshold.max(1),
            error_window,
        }
    }

    pub fn from_config(config: &DegradationConfig) -> Self {
        Self::new(config.high_severity_threshold, config.error_window)
    }

    /// Determine the target mode. Identical inputs always yield the same mode.
    pub fn next(
        &self,
        current: OperationMode,
        health: &SystemHealth,
        errors: &ErrorCounts,
    ) -> OperationMode {
        self.decide(current, health, errors).mode
    }

    /// Same as [`DegradationPolicy::next`] but keeps the reason for logging.
    pub fn decide(
        &self,
        current: OperationMode,
        health: &SystemHealth,
        errors: &ErrorCounts,
    ) -> Decision {
        let from_health = health_decision(current, health);
        self.apply_error_floor(from_health, errors)
    }

    /// Raise `decision` to the floor implied by recent errors, if any.
    pub fn apply_error_floor(&self, decision: Decision, errors: &ErrorCounts) -> Decision {
        let floor = if errors.critical > 0 {
            Some((
                OperationMode::Minimal,
                format!("{} critical error(s) in window", errors.critical),
            ))
        } else if errors.high >= self.high_severity_threshold {
            Some((
                OperationMode::ReducedFunctionality,
                format!("{} high severity errors in window", errors.high),
            ))
        } else {
            None
        };
        match floor {
            Some((mode, reason)) if mode.severity_rank() > decision.mode.severity_rank() => {
                Decision { mode, reason }
            }
            _ => decision,
        }
    }
}

impl Default for DegradationPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(300))
    }
}

/// Map one health sample to a target mode. Resource thresholds win over
/// connectivity; `current` is returned only when no rule fires.
///
/// The offline rule is deliberately not guarded on `current != Offline`:
/// while the network stays down the decision keeps yielding `Offline`, which
/// the controller treats as a no-op, so the recovery rule cannot bounce the
/// mode back to normal between samples.
fn health_decision(current: OperationMode, health: &SystemHealth) -> Decision {
    let decision = |mode: OperationMode, reason: String| Decision { mode, reason };
    if health.memory_pressure > EMERGENCY_MEMORY || health.cpu_usage > EMERGENCY_CPU {
        return decision(
            OperationMode::Emergency,
            format!(
                "critical resource pressure (memory {:.2}, cpu {:.2})",
                health.memory_pressure, health.cpu_usage
            ),
        );
    }
    if health.memory_pressure > MINIMAL_MEMORY
        || health.cpu_usage > MINIMAL_CPU
        || health.disk_free < MINIMAL_DISK
    {
        return decision(
            OperationMode::Minimal,
            format!(
                "severe resource pressure (memory {:.2}, cpu {:.2}, disk free {:.2})",
                health.memory_pressure, health.cpu_usage, health.disk_free
            ),
        );
    }
    if health.memory_pressure > REDUCED_MEMORY
        || health.cpu_usage > REDUCED_CPU
        || health.disk_free < REDUCED_DISK
    {
        return decision(
            OperationMode::ReducedFunctionality,
            format!(
                "elevated resource pressure (memory {:.2}, cpu {:.2}, disk free {:.2})",
                health.memory_pressure, health.cpu_usage, health.disk_free
            ),
        );
    }
    if !health.network_available {
        return decision(OperationMode::Offline, "network unavailable".to_owned());
    }
    let score = health.overall_score();
    if score > RECOVERY_SCORE {
        return decision(
            OperationMode::Normal,
            format!("system health recovered (score {score:.2})"),
        );
    }
    decision(current, format!("holding mode (score {score:.2})"))
}

#[derive(Debug)]
struct ControllerInner {
    mode: OperationMode,
    features: BTreeSet<AppFeature>,
    history: VecDeque<DegradationEvent>,
    errors: VecDeque<(DateTime<Utc>, Severity)>,
    last_health: Option<SystemHealth>,
}

/// Owns the operation mode and the active feature set.
#[derive(Debug)]
pub struct DegradationController {
    policy: DegradationPolicy,
    history_limit: usize,
    inner: Mutex<ControllerInner>,
    events: broadcast::Sender<ModeChange>,
    metrics: Option<ResilienceMetrics>,
}

impl DegradationController {
    /// Create a controller starting in [`OperationMode::Normal`].
    pub fn new(
        policy: DegradationPolicy,
        history_limit: usize,
        metrics: Option<ResilienceMetrics>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        if let Some(metrics) = &metrics {
            metrics.set_mode(OperationMode::Normal);
        }
        Self {
            policy,
            history_limit: history_limit.max(1),
            inner: Mutex::new(ControllerInner {
                mode: OperationMode::Normal,
                features: features_for_mode(OperationMode::Normal),
                history: VecDeque::new(),
                errors: VecDeque::new(),
                last_health: None,
            }),
            events,
            metrics,
        }
    }

    pub fn from_config(config: &DegradationConfig, metrics: Option<ResilienceMetrics>) -> Self {
        Self::new(
            DegradationPolicy::from_config(config),
            config.history_limit,
            metrics,
        )
    }

    /// Evaluate a fresh health sample and transition if the policy says so.
    pub fn evaluate(&self, health: SystemHealth) -> OperationMode {
        let now = Utc::now();
        let (mode, change) = {
            let mut inner = self.inner.lock();
            inner.last_health = Some(health);
            let errors = self.count_errors(&mut inner, now);
            let decision = self.policy.decide(inner.mode, &health, &errors);
            debug!(
                target: "ward::degradation",
                score = health.overall_score(),
                current = %inner.mode,
                target_mode = %decision.mode,
                "health evaluated"
            );
            let change = self.transition(
                &mut inner,
                decision.mode,
                decision.reason,
                DegradationTrigger::Automatic,
                now,
            );
            (inner.mode, change)
        };
        self.publish(change);
        mode
    }

    /// Feed a fault severity into the error window. High and critical errors
    /// trigger an immediate re-evaluation against the last known health.
    pub fn record_error(&self, severity: Severity) -> OperationMode {
        let now = Utc::now();
        let (mode, change) = {
            let mut inner = self.inner.lock();
            inner.errors.push_back((now, severity));
            if severity < Severity::High {
                return inner.mode;
            }
            let errors = self.count_errors(&mut inner, now);
            let current = inner.mode;
            let decision = match inner.last_health {
                Some(health) => self.policy.decide(current, &health, &errors),
                None => self.policy.apply_error_floor(
                    Decision {
                        mode: current,
                        reason: "no health sample yet".to_owned(),
                    },
                    &errors,
                ),
            };
            let change = self.transition(
                &mut inner,
                decision.mode,
                decision.reason,
                DegradationTrigger::Automatic,
                now,
            );
            (inner.mode, change)
        };
        self.publish(change);
        mode
    }

    /// Switch modes. A no-op beyond logging when `mode` is already active.
    pub fn switch_to_mode(
        &self,
        mode: OperationMode,
        reason: impl Into<String>,
        trigger: DegradationTrigger,
    ) -> bool {
        let change = {
            let mut inner = self.inner.lock();
            self.transition(&mut inner, mode, reason.into(), trigger, Utc::now())
        };
        let changed = change.is_some();
        self.publish(change);
        changed
    }

    /// Manually force a mode. The next automatic evaluation may revert it.
    pub fn force_mode(&self, mode: OperationMode, reason: impl Into<String>) -> bool {
        self.switch_to_mode(mode, reason, DegradationTrigger::Manual)
    }

    pub fn current_mode(&self) -> OperationMode {
        self.inner.lock().mode
    }

    pub fn active_features(&self) -> BTreeSet<AppFeature> {
        self.inner.lock().features.clone()
    }

    pub fn is_feature_available(&self, feature: AppFeature) -> bool {
        self.inner.lock().features.contains(&feature)
    }

    /// Transition history, oldest first.
    pub fn history(&self) -> Vec<DegradationEvent> {
        self.inner.lock().history.iter().cloned().collect()
    }

    pub fn last_health(&self) -> Option<SystemHealth> {
        self.inner.lock().last_health
    }

    /// Error counts inside the trailing window as of now.
    pub fn error_counts(&self) -> ErrorCounts {
        let mut inner = self.inner.lock();
        self.count_errors(&mut inner, Utc::now())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModeChange> {
        self.events.subscribe()
    }

    pub fn policy(&self) -> &DegradationPolicy {
        &self.policy
    }

    fn count_errors(&self, inner: &mut ControllerInner, now: DateTime<Utc>) -> ErrorCounts {
        let window = chrono::Duration::from_std(self.policy.error_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let cutoff = now - window;
        while inner
            .errors
            .front()
            .map(|(at, _)| *at < cutoff)
            .unwrap_or(false)
        {
            inner.errors.pop_front();
        }
        inner
            .errors
            .iter()
            .fold(ErrorCounts::default(), |mut counts, (_, severity)| {
                match severity {
                    Severity::Critical => counts.critical += 1,
                    Severity::High => counts.high += 1,
                    Severity::Low | Severity::Medium => {}
                }
                counts
            })
    }

    fn transition(
        &self,
        inner: &mut ControllerInner,
        target: OperationMode,
        reason: String,
        trigger: DegradationTrigger,
        now: DateTime<Utc>,
    ) -> Option<ModeChange> {
        if inner.mode == target {
            debug!(target: "ward::degradation", mode = %target, %reason, "mode unchanged");
            return None;
        }
        let previous = inner.mode;
        inner.mode = target;
        inner.features = features_for_mode(target);
        inner.history.push_back(DegradationEvent {
            timestamp: now,
            from: previous,
            to: target,
            reason: reason.clone(),
            trigger,
        });
        while inner.history.len() > self.history_limit {
            inner.history.pop_front();
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_mode_transition(previous, target);
        }
        info!(
            target: "ward::degradation",
            from = %previous,
            to = %target,
            ?trigger,
            %reason,
            features = inner.features.len(),
            "operation mode transition",
        );
        Some(ModeChange {
            mode: target,
            previous,
            reason,
            trigger,
        })
    }

    fn publish(&self, change: Option<ModeChange>) {
        if let Some(change) = change {
            // No subscribers is fine; the transition is already recorded.
            let _ = self.events.send(change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    fn health(memory: f64, cpu: f64, disk: f64, network: bool) -> SystemHealth {
        SystemHealth::new(memory, cpu, disk, network, 1.0)
    }

    #[test]
    fn policy_is_deterministic() {
        let policy = DegradationPolicy::default();
        let samples = [
            health(0.95, 0.3, 0.9, true),
            health(0.5, 0.5, 0.5, true),
            health(0.1, 0.1, 0.9, false),
            health(0.75, 0.2, 0.9, true),
        ];
        for sample in &samples {
            for mode in OperationMode::iter() {
                let first = policy.next(mode, sample, &ErrorCounts::default());
                let second = policy.next(mode, sample, &ErrorCounts::default());
                assert_eq!(first, second);
            }
        }
    }

    #[test]
    fn thresholds_map_to_modes() {
        let policy = DegradationPolicy::default();
        let none = ErrorCounts::default();
        let normal = OperationMode::Normal;
        assert_eq!(policy.next(normal, &health(0.91, 0.1, 0.9, true), &none), OperationMode::Emergency);
        assert_eq!(policy.next(normal, &health(0.1, 0.96, 0.9, true), &none), OperationMode::Emergency);
        assert_eq!(policy.next(normal, &health(0.85, 0.1, 0.9, true), &none), OperationMode::Minimal);
        assert_eq!(policy.next(normal, &health(0.1, 0.1, 0.05, true), &none), OperationMode::Minimal);
        assert_eq!(
            policy.next(normal, &health(0.72, 0.1, 0.9, true), &none),
            OperationMode::ReducedFunctionality
        );
        assert_eq!(
            policy.next(normal, &health(0.1, 0.1, 0.15, true), &none),
            OperationMode::ReducedFunctionality
        );
        assert_eq!(policy.next(normal, &health(0.1, 0.1, 0.9, false), &none), OperationMode::Offline);
    }

    #[test]
    fn offline_holds_while_network_is_down() {
        let controller = DegradationController::new(DegradationPolicy::default(), 100, None);
        let down = health(0.1, 0.1, 0.9, false);
        assert_eq!(controller.evaluate(down), OperationMode::Offline);
        assert_eq!(controller.evaluate(down), OperationMode::Offline);
        assert_eq!(controller.history().len(), 1);
        assert_eq!(controller.evaluate(health(0.1, 0.1, 0.9, true)), OperationMode::Normal);
    }

    #[test]
    fn middling_health_holds_current_mode() {
        let policy = DegradationPolicy::default();
        // score = (0.4 + 0.4 + 0.3 + 1.0 + 1.0) / 5 = 0.62, no threshold crossed
        let sample = SystemHealth::new(0.6, 0.6, 0.3, true, 1.0);
        for mode in OperationMode::iter() {
            assert_eq!(policy.next(mode, &sample, &ErrorCounts::default()), mode);
        }
    }

    #[test]
    fn error_floor_escalates() {
        let policy = DegradationPolicy::default();
        let sample = health(0.1, 0.1, 0.9, true);
        let high = ErrorCounts { high: 3, critical: 0 };
        assert_eq!(
            policy.next(OperationMode::Normal, &sample, &high),
            OperationMode::ReducedFunctionality
        );
        let below = ErrorCounts { high: 2, critical: 0 };
        assert_eq!(policy.next(OperationMode::Normal, &sample, &below), OperationMode::Normal);
        let critical = ErrorCounts { high: 0, critical: 1 };
        assert_eq!(
            policy.next(OperationMode::Normal, &sample, &critical),
            OperationMode::Minimal
        );
        // the floor never lowers a more severe health-derived mode
        let dire = health(0.95, 0.1, 0.9, true);
        assert_eq!(policy.next(OperationMode::Normal, &dire, &critical), OperationMode::Emergency);
    }

    #[test]
    fn feature_set_is_replaced_from_table() {
        let controller = DegradationController::new(DegradationPolicy::default(), 100, None);
        let mode = controller.evaluate(health(0.95, 0.3, 0.9, true));
        assert_eq!(mode, OperationMode::Emergency);
        let expected: BTreeSet<_> = [AppFeature::BasicTimeTracking, AppFeature::EmergencyBackup]
            .into_iter()
            .collect();
        assert_eq!(controller.active_features(), expected);

        // reach minimal from two different predecessors; the set must match the table
        controller.evaluate(health(0.85, 0.1, 0.9, true));
        let via_emergency = controller.active_features();
        controller.force_mode(OperationMode::Offline, "test");
        controller.evaluate(health(0.85, 0.1, 0.9, true));
        assert_eq!(controller.active_features(), via_emergency);
        assert_eq!(via_emergency, features_for_mode(OperationMode::Minimal));
    }

    #[test]
    fn switching_to_current_mode_is_a_no_op() {
        let controller = DegradationController::new(DegradationPolicy::default(), 100, None);
        assert!(!controller.switch_to_mode(
            OperationMode::Normal,
            "already normal",
            DegradationTrigger::Automatic
        ));
        assert!(controller.history().is_empty());
    }

    #[test]
    fn forced_mode_is_recorded_and_may_be_reverted() {
        let controller = DegradationController::new(DegradationPolicy::default(), 100, None);
        assert!(controller.force_mode(OperationMode::Minimal, "operator request"));
        let history = controller.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].trigger, DegradationTrigger::Manual);
        assert_eq!(controller.evaluate(SystemHealth::nominal()), OperationMode::Normal);
        assert_eq!(controller.history()[1].trigger, DegradationTrigger::Automatic);
    }

    #[test]
    fn history_is_bounded() {
        let controller = DegradationController::new(DegradationPolicy::default(), 4, None);
        for _ in 0..5 {
            controller.force_mode(OperationMode::Minimal, "flap");
            controller.force_mode(OperationMode::Normal, "flap");
        }
        assert_eq!(controller.history().len(), 4);
    }

    #[test]
    fn critical_error_escalates_immediately() {
        let controller = DegradationController::new(DegradationPolicy::default(), 100, None);
        controller.evaluate(SystemHealth::nominal());
        assert_eq!(controller.record_error(Severity::Medium), OperationMode::Normal);
        assert_eq!(controller.record_error(Severity::Critical), OperationMode::Minimal);
        assert!(!controller.is_feature_available(AppFeature::AdvancedSearch));
    }

    #[test]
    fn repeated_high_errors_escalate_after_threshold() {
        let controller = DegradationController::new(DegradationPolicy::default(), 100, None);
        assert_eq!(controller.record_error(Severity::High), OperationMode::Normal);
        assert_eq!(controller.record_error(Severity::High), OperationMode::Normal);
        assert_eq!(
            controller.record_error(Severity::High),
            OperationMode::ReducedFunctionality
        );
        assert_eq!(controller.error_counts().high, 3);
    }

    #[tokio::test]
    async fn subscribers_receive_mode_changes() {
        let controller = DegradationController::new(DegradationPolicy::default(), 100, None);
        let mut rx = controller.subscribe();
        controller.evaluate(health(0.1, 0.1, 0.9, false));
        let change = rx.recv().await.unwrap();
        assert_eq!(change.mode, OperationMode::Offline);
        assert_eq!(change.previous, OperationMode::Normal);
        assert_eq!(change.reason, "network unavailable");
    }
}
