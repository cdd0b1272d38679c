//! ---
//! ward_section: "07-resilience-fault-tolerance"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Recovery strategy variants, selection table, and named actions."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fault::{ErrorCategory, ErrorKind, Fault};

/// Names of the actions a strategy can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionId {
    RequestPermission,
    ReviewConfiguration,
    ReviewBackups,
    RepairDatastore,
    RestoreLatestBackup,
    ResetTimer,
    ReduceLoad,
    DisableRuleEngine,
    BasicSearch,
    ManualTracking,
}

impl RecoveryActionId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryActionId::RequestPermission => "request_permission",
            RecoveryActionId::ReviewConfiguration => "review_configuration",
            RecoveryActionId::ReviewBackups => "review_backups",
            RecoveryActionId::RepairDatastore => "repair_datastore",
            RecoveryActionId::RestoreLatestBackup => "restore_latest_backup",
            RecoveryActionId::ResetTimer => "reset_timer",
            RecoveryActionId::ReduceLoad => "reduce_load",
            RecoveryActionId::DisableRuleEngine => "disable_rule_engine",
            RecoveryActionId::BasicSearch => "basic_search",
            RecoveryActionId::ManualTracking => "manual_tracking",
        }
    }
}

impl fmt::Display for RecoveryActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged recovery strategy. Payloads name an action in the [`ActionRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "action", rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Re-run the caller's failed operation.
    Retry,
    Fallback(RecoveryActionId),
    Repair(RecoveryActionId),
    Reset(RecoveryActionId),
    GracefulDegradation(RecoveryActionId),
    UserIntervention(RecoveryActionId),
    /// Ask the host to restart the application.
    SystemRestart,
    DataRecovery(RecoveryActionId),
}

impl RecoveryStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Fallback(_) => "fallback",
            RecoveryStrategy::Repair(_) => "repair",
            RecoveryStrategy::Reset(_) => "reset",
            RecoveryStrategy::GracefulDegradation(_) => "graceful_degradation",
            RecoveryStrategy::UserIntervention(_) => "user_intervention",
            RecoveryStrategy::SystemRestart => "system_restart",
            RecoveryStrategy::DataRecovery(_) => "data_recovery",
        }
    }

    /// Named action carried by the variant, if any.
    pub fn action(&self) -> Option<RecoveryActionId> {
        match self {
            RecoveryStrategy::Retry | RecoveryStrategy::SystemRestart => None,
            RecoveryStrategy::Fallback(action)
            | RecoveryStrategy::Repair(action)
            | RecoveryStrategy::Reset(action)
            | RecoveryStrategy::GracefulDegradation(action)
            | RecoveryStrategy::UserIntervention(action)
            | RecoveryStrategy::DataRecovery(action) => Some(*action),
        }
    }

    /// Strategies that are never retried automatically.
    pub fn requires_user(&self) -> bool {
        matches!(self, RecoveryStrategy::UserIntervention(_))
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.action() {
            Some(action) => write!(f, "{}({})", self.label(), action),
            None => f.write_str(self.label()),
        }
    }
}

/// Error case that asks for an application restart.
pub const FATAL_CASE: &str = "fatal";
/// Datastore corruption case that repair cannot handle.
pub const UNRECOVERABLE_CASE: &str = "unrecoverable";

/// Pure mapping from a fault classification to a strategy.
pub fn select_strategy(category: ErrorCategory, kind: ErrorKind, case: &str) -> RecoveryStrategy {
    use ErrorCategory as C;
    use ErrorKind as K;
    use RecoveryActionId as A;

    if category == C::System && case == FATAL_CASE {
        return RecoveryStrategy::SystemRestart;
    }
    match (kind, category) {
        (K::PermissionDenied, _) => RecoveryStrategy::UserIntervention(A::RequestPermission),
        (K::ConfigurationInvalid, _) => RecoveryStrategy::UserIntervention(A::ReviewConfiguration),
        (K::Corruption, C::Backup) => RecoveryStrategy::UserIntervention(A::ReviewBackups),
        (K::Corruption, C::Timer) => RecoveryStrategy::Reset(A::ResetTimer),
        (K::Corruption, _) if case == UNRECOVERABLE_CASE => {
            RecoveryStrategy::DataRecovery(A::RestoreLatestBackup)
        }
        (K::Corruption, _) => RecoveryStrategy::Repair(A::RepairDatastore),
        (K::ResourceExhausted, _) => RecoveryStrategy::GracefulDegradation(A::ReduceLoad),
        (K::TransientIo | K::Timeout, C::Search) => RecoveryStrategy::Fallback(A::BasicSearch),
        (K::TransientIo | K::Timeout, C::ActivityTracking) => {
            RecoveryStrategy::Fallback(A::ManualTracking)
        }
        (K::TransientIo | K::Timeout, C::RuleEngine) => {
            RecoveryStrategy::GracefulDegradation(A::DisableRuleEngine)
        }
        (K::TransientIo | K::Timeout, C::Timer) => RecoveryStrategy::Reset(A::ResetTimer),
        (K::TransientIo | K::Timeout, _) => RecoveryStrategy::Retry,
    }
}

/// Information handed to an action on every attempt.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub operation_id: Uuid,
    pub fault: Fault,
    /// 1-indexed attempt number.
    pub attempt: usize,
}

/// A fallible, possibly-suspending recovery step. `Ok(false)` counts as a failure.
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    async fn execute(&self, context: &RecoveryContext) -> Result<bool>;
}

/// Adapter turning an async closure into a [`RecoveryAction`].
pub struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> RecoveryAction for FnAction<F>
where
    F: Fn(RecoveryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    async fn execute(&self, context: &RecoveryContext) -> Result<bool> {
        (self.0)(context.clone()).await
    }
}

/// Wrap an async closure as a shareable action.
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn RecoveryAction>
where
    F: Fn(RecoveryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    Arc::new(FnAction(f))
}

/// Actions that only prompt the user. They cannot succeed on their own.
struct UserPrompt;

#[async_trait]
impl RecoveryAction for UserPrompt {
    async fn execute(&self, context: &RecoveryContext) -> Result<bool> {
        tracing::warn!(
            target: "ward::recovery",
            operation = %context.operation_id,
            fault = %context.fault,
            "manual intervention required"
        );
        Ok(false)
    }
}

/// Lookup table from action names to implementations.
pub struct ActionRegistry {
    actions: RwLock<HashMap<RecoveryActionId, Arc<dyn RecoveryAction>>>,
}

impl ActionRegistry {
    /// Registry pre-populated with the user prompt actions.
    pub fn new() -> Self {
        let registry = Self {
            actions: RwLock::new(HashMap::new()),
        };
        let prompt: Arc<dyn RecoveryAction> = Arc::new(UserPrompt);
        for id in [
            RecoveryActionId::RequestPermission,
            RecoveryActionId::ReviewConfiguration,
            RecoveryActionId::ReviewBackups,
        ] {
            registry.register(id, prompt.clone());
        }
        registry
    }

    /// Register or replace the implementation for `id`.
    pub fn register(&self, id: RecoveryActionId, action: Arc<dyn RecoveryAction>) {
        self.actions.write().insert(id, action);
    }

    pub fn get(&self, id: RecoveryActionId) -> Option<Arc<dyn RecoveryAction>> {
        self.actions.read().get(&id).cloned()
    }

    pub fn contains(&self, id: RecoveryActionId) -> bool {
        self.actions.read().contains_key(&id)
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.actions.read().keys().map(|id| id.as_str()).collect();
        names.sort_unstable();
        f.debug_struct("ActionRegistry").field("actions", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_always_needs_the_user() {
        for category in [
            ErrorCategory::ActivityTracking,
            ErrorCategory::Timer,
            ErrorCategory::Datastore,
            ErrorCategory::Search,
        ] {
            assert_eq!(
                select_strategy(category, ErrorKind::PermissionDenied, "accessibility"),
                RecoveryStrategy::UserIntervention(RecoveryActionId::RequestPermission)
            );
        }
    }

    #[test]
    fn selection_table_covers_layers() {
        assert_eq!(
            select_strategy(ErrorCategory::Datastore, ErrorKind::Corruption, "page"),
            RecoveryStrategy::Repair(RecoveryActionId::RepairDatastore)
        );
        assert_eq!(
            select_strategy(ErrorCategory::Datastore, ErrorKind::Corruption, UNRECOVERABLE_CASE),
            RecoveryStrategy::DataRecovery(RecoveryActionId::RestoreLatestBackup)
        );
        assert_eq!(
            select_strategy(ErrorCategory::Backup, ErrorKind::Corruption, "checksum"),
            RecoveryStrategy::UserIntervention(RecoveryActionId::ReviewBackups)
        );
        assert_eq!(
            select_strategy(ErrorCategory::Search, ErrorKind::Timeout, "query"),
            RecoveryStrategy::Fallback(RecoveryActionId::BasicSearch)
        );
        assert_eq!(
            select_strategy(ErrorCategory::Datastore, ErrorKind::TransientIo, "write"),
            RecoveryStrategy::Retry
        );
        assert_eq!(
            select_strategy(ErrorCategory::System, ErrorKind::ResourceExhausted, FATAL_CASE),
            RecoveryStrategy::SystemRestart
        );
        assert_eq!(
            select_strategy(ErrorCategory::System, ErrorKind::ResourceExhausted, "memory"),
            RecoveryStrategy::GracefulDegradation(RecoveryActionId::ReduceLoad)
        );
    }

    #[test]
    fn strategy_display_names_action() {
        let strategy = RecoveryStrategy::Fallback(RecoveryActionId::BasicSearch);
        assert_eq!(strategy.to_string(), "fallback(basic_search)");
        assert_eq!(RecoveryStrategy::Retry.to_string(), "retry");
    }

    #[tokio::test]
    async fn registry_ships_prompt_actions_that_fail() {
        let registry = ActionRegistry::new();
        let action = registry.get(RecoveryActionId::RequestPermission).unwrap();
        let context = RecoveryContext {
            operation_id: Uuid::new_v4(),
            fault: Fault::new(ErrorCategory::System, ErrorKind::PermissionDenied, "disk"),
            attempt: 1,
        };
        assert!(!action.execute(&context).await.unwrap());
        assert!(!registry.contains(RecoveryActionId::ReduceLoad));
    }
}
