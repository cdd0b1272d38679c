//! ---
//! ward_section: "07-resilience-fault-tolerance"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Bounded retry orchestration with exponential backoff and jitter."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;
use ward_common::config::RecoveryConfig;

use crate::fault::Fault;
use crate::metrics::ResilienceMetrics;
use crate::strategy::{
    select_strategy, ActionRegistry, RecoveryAction, RecoveryContext, RecoveryStrategy,
};

const DEFAULT_SEED: u64 = 0x5EED_CAFE;

/// Retry budget and backoff window.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay_ms, config.max_delay_ms)
    }

    /// Delay after failed attempt `attempt` (1-indexed) for a jitter sample in `0.0..=0.5`.
    ///
    /// `min(max_delay, base * 2^(attempt-1) * (0.5 + jitter))`
    pub fn delay_with_jitter(&self, attempt: usize, jitter: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let factor = 0.5 + jitter.clamp(0.0, 0.5);
        let seconds = self.base_delay.as_secs_f64() * 2f64.powi(exponent) * factor;
        Duration::from_secs_f64(seconds.min(self.max_delay.as_secs_f64()))
    }

    /// Delay after failed attempt `attempt` with jitter drawn from `rng`.
    pub fn delay(&self, attempt: usize, rng: &mut StdRng) -> Duration {
        self.delay_with_jitter(attempt, rng.gen_range(0.0..=0.5))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Why a recovery did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum RecoveryFailure {
    #[error("recovery attempts exhausted after {attempts} tries{}", last_error_suffix(.last_error))]
    AttemptsExhausted {
        attempts: usize,
        last_error: Option<String>,
    },
    #[error("user action required: {0}")]
    UserActionRequired(String),
    #[error("no retry operation was supplied")]
    NoRetryOperation,
    #[error("application restart required")]
    RestartRequired,
    #[error("recovery cancelled")]
    Cancelled,
    #[error("recovery did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("recovery task aborted: {0}")]
    Aborted(String),
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_deref()
        .map(|err| format!(": {err}"))
        .unwrap_or_default()
}

/// Outcome of [`RecoveryOrchestrator::attempt_recovery`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryResult {
    Success {
        attempts_used: usize,
    },
    Failure {
        cause: RecoveryFailure,
        attempts_used: usize,
    },
}

impl RecoveryResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RecoveryResult::Success { .. })
    }

    pub fn attempts_used(&self) -> usize {
        match self {
            RecoveryResult::Success { attempts_used }
            | RecoveryResult::Failure { attempts_used, .. } => *attempts_used,
        }
    }

    pub fn failure(&self) -> Option<&RecoveryFailure> {
        match self {
            RecoveryResult::Success { .. } => None,
            RecoveryResult::Failure { cause, .. } => Some(cause),
        }
    }
}

/// One in-flight recovery.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOperation {
    pub id: Uuid,
    pub fault: Fault,
    pub strategy: RecoveryStrategy,
    pub start_time: DateTime<Utc>,
}

/// Completed recovery kept for statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    pub operation: RecoveryOperation,
    pub result: RecoveryResult,
    pub completed_at: DateTime<Utc>,
}

/// Aggregates derived from the bounded history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RecoveryStatistics {
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    /// Share of successful recoveries; 0.0 when nothing was attempted.
    pub success_rate: f64,
    /// Mean attempts used by successful recoveries; 0.0 when none succeeded.
    pub average_attempts_to_success: f64,
}

enum StepOutcome {
    Recovered,
    Failed(Option<String>),
    Terminal(RecoveryFailure),
}

struct OrchestratorInner {
    policy: BackoffPolicy,
    history_limit: usize,
    actions: ActionRegistry,
    rng: Mutex<StdRng>,
    in_flight: Mutex<IndexMap<Uuid, RecoveryOperation>>,
    history: Mutex<VecDeque<RecoveryAttempt>>,
    metrics: Option<ResilienceMetrics>,
}

/// Runs recovery strategies with a bounded retry budget.
///
/// Cloning is cheap; clones share the action table, tracking map, and history.
#[derive(Clone)]
pub struct RecoveryOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl RecoveryOrchestrator {
    pub fn new(policy: BackoffPolicy, history_limit: usize, metrics: Option<ResilienceMetrics>) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                policy,
                history_limit: history_limit.max(1),
                actions: ActionRegistry::new(),
                rng: Mutex::new(StdRng::seed_from_u64(DEFAULT_SEED)),
                in_flight: Mutex::new(IndexMap::new()),
                history: Mutex::new(VecDeque::new()),
                metrics,
            }),
        }
    }

    pub fn from_config(config: &RecoveryConfig, metrics: Option<ResilienceMetrics>) -> Self {
        let orchestrator = Self::new(BackoffPolicy::from_config(config), config.history_limit, metrics);
        if let Some(seed) = config.seed {
            orchestrator.reseed(seed);
        }
        orchestrator
    }

    /// Seed the jitter RNG for deterministic testing.
    pub fn with_seed(self, seed: u64) -> Self {
        self.reseed(seed);
        self
    }

    fn reseed(&self, seed: u64) {
        *self.inner.rng.lock() = StdRng::seed_from_u64(seed);
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.inner.policy
    }

    /// Action table used to resolve strategy payloads.
    pub fn actions(&self) -> &ActionRegistry {
        &self.inner.actions
    }

    /// Select a strategy for `fault` and run it. `retry` re-executes the
    /// caller's failed operation when the strategy is [`RecoveryStrategy::Retry`].
    pub async fn attempt_recovery(
        &self,
        fault: Fault,
        retry: Option<Arc<dyn RecoveryAction>>,
    ) -> RecoveryResult {
        let strategy = select_strategy(fault.category, fault.kind, &fault.case);
        self.attempt_with_strategy(fault, strategy, retry).await
    }

    /// Run an explicit strategy with the retry budget.
    pub async fn attempt_with_strategy(
        &self,
        fault: Fault,
        strategy: RecoveryStrategy,
        retry: Option<Arc<dyn RecoveryAction>>,
    ) -> RecoveryResult {
        let operation = RecoveryOperation {
            id: Uuid::new_v4(),
            fault,
            strategy,
            start_time: Utc::now(),
        };
        let id = operation.id;
        self.inner.in_flight.lock().insert(id, operation.clone());

        let budget = if strategy.requires_user() || !operation.fault.kind.is_retryable() {
            1
        } else {
            self.inner.policy.max_attempts
        };
        info!(
            target: "ward::recovery",
            operation = %id,
            fault = %operation.fault,
            %strategy,
            budget,
            "starting recovery",
        );

        let started = Instant::now();
        let mut last_error = None;
        let mut outcome = None;
        for attempt in 1..=budget {
            let context = RecoveryContext {
                operation_id: id,
                fault: operation.fault.clone(),
                attempt,
            };
            match self.execute_strategy(&strategy, &context, retry.as_deref()).await {
                StepOutcome::Recovered => {
                    outcome = Some(RecoveryResult::Success {
                        attempts_used: attempt,
                    });
                    break;
                }
                StepOutcome::Terminal(cause) => {
                    outcome = Some(RecoveryResult::Failure {
                        cause,
                        attempts_used: attempt,
                    });
                    break;
                }
                StepOutcome::Failed(err) => {
                    warn!(
                        target: "ward::recovery",
                        operation = %id,
                        attempt,
                        error = err.as_deref().unwrap_or("action reported failure"),
                        "recovery attempt failed",
                    );
                    last_error = err;
                }
            }
            if attempt < budget {
                let delay = {
                    let mut rng = self.inner.rng.lock();
                    self.inner.policy.delay(attempt, &mut rng)
                };
                sleep(delay).await;
            }
        }

        let mut result = outcome.unwrap_or_else(|| {
            let cause = match strategy {
                RecoveryStrategy::UserIntervention(action) => {
                    RecoveryFailure::UserActionRequired(action.to_string())
                }
                _ => RecoveryFailure::AttemptsExhausted {
                    attempts: budget,
                    last_error,
                },
            };
            RecoveryResult::Failure {
                cause,
                attempts_used: budget,
            }
        });

        if self.inner.in_flight.lock().shift_remove(&id).is_none() {
            info!(target: "ward::recovery", operation = %id, "discarding result of cancelled recovery");
            result = RecoveryResult::Failure {
                cause: RecoveryFailure::Cancelled,
                attempts_used: result.attempts_used(),
            };
        }

        if let Some(metrics) = &self.inner.metrics {
            metrics.record_recovery(&strategy, &result, started.elapsed());
        }
        match &result {
            RecoveryResult::Success { attempts_used } => info!(
                target: "ward::recovery",
                operation = %id,
                attempts = attempts_used,
                "recovery succeeded",
            ),
            RecoveryResult::Failure { cause, attempts_used } => error!(
                target: "ward::recovery",
                operation = %id,
                attempts = attempts_used,
                %cause,
                "recovery failed",
            ),
        }
        self.push_history(RecoveryAttempt {
            operation,
            result: result.clone(),
            completed_at: Utc::now(),
        });
        result
    }

    /// Like [`RecoveryOrchestrator::attempt_recovery`] but gives up waiting after `deadline`.
    /// The recovery keeps running in the background and its result is discarded.
    pub async fn attempt_recovery_with_deadline(
        &self,
        fault: Fault,
        retry: Option<Arc<dyn RecoveryAction>>,
        deadline: Duration,
    ) -> RecoveryResult {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.attempt_recovery(fault, retry).await });
        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => RecoveryResult::Failure {
                cause: RecoveryFailure::Aborted(join_err.to_string()),
                attempts_used: 0,
            },
            Err(_) => {
                warn!(target: "ward::recovery", ?deadline, "recovery deadline expired");
                RecoveryResult::Failure {
                    cause: RecoveryFailure::TimedOut(deadline),
                    attempts_used: 0,
                }
            }
        }
    }

    /// Stop tracking an in-flight recovery. The action itself runs to completion.
    pub fn cancel(&self, id: Uuid) -> bool {
        self.inner.in_flight.lock().shift_remove(&id).is_some()
    }

    /// Recoveries currently running, oldest first.
    pub fn in_flight(&self) -> Vec<RecoveryOperation> {
        self.inner.in_flight.lock().values().cloned().collect()
    }

    pub fn history(&self) -> Vec<RecoveryAttempt> {
        self.inner.history.lock().iter().cloned().collect()
    }

    pub fn statistics(&self) -> RecoveryStatistics {
        let history = self.inner.history.lock();
        let total = history.len();
        let success_attempts: Vec<usize> = history
            .iter()
            .filter(|attempt| attempt.result.is_success())
            .map(|attempt| attempt.result.attempts_used())
            .collect();
        let successes = success_attempts.len();
        RecoveryStatistics {
            total,
            successes,
            failures: total - successes,
            success_rate: if total == 0 {
                0.0
            } else {
                successes as f64 / total as f64
            },
            average_attempts_to_success: if successes == 0 {
                0.0
            } else {
                success_attempts.iter().sum::<usize>() as f64 / successes as f64
            },
        }
    }

    async fn execute_strategy(
        &self,
        strategy: &RecoveryStrategy,
        context: &RecoveryContext,
        retry: Option<&dyn RecoveryAction>,
    ) -> StepOutcome {
        let outcome = match strategy {
            RecoveryStrategy::SystemRestart => {
                return StepOutcome::Terminal(RecoveryFailure::RestartRequired)
            }
            RecoveryStrategy::Retry => match retry {
                Some(action) => action.execute(context).await,
                None => return StepOutcome::Terminal(RecoveryFailure::NoRetryOperation),
            },
            other => {
                let Some(id) = other.action() else {
                    return StepOutcome::Failed(None);
                };
                let Some(action) = self.inner.actions.get(id) else {
                    warn!(target: "ward::recovery", action = %id, "no action registered");
                    return StepOutcome::Failed(None);
                };
                action.execute(context).await
            }
        };
        match outcome {
            Ok(true) => StepOutcome::Recovered,
            Ok(false) => StepOutcome::Failed(None),
            Err(err) => StepOutcome::Failed(Some(format!("{err:#}"))),
        }
    }

    fn push_history(&self, attempt: RecoveryAttempt) {
        let mut history = self.inner.history.lock();
        history.push_back(attempt);
        while history.len() > self.inner.history_limit {
            history.pop_front();
        }
    }
}

impl std::fmt::Debug for RecoveryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryOrchestrator")
            .field("policy", &self.inner.policy)
            .field("actions", &self.inner.actions)
            .finish_non_exhaustive()
    }
}
