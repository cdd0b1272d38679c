//! ---
//! ward_section: "07-resilience-fault-tolerance"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Degradation state machine and recovery orchestration."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
//! Fault taxonomy, health snapshots, the operation mode state machine, and the
//! bounded-retry recovery orchestrator.

pub mod degradation;
pub mod fault;
pub mod features;
pub mod health;
pub mod metrics;
pub mod recovery;
pub mod strategy;

pub use degradation::{
    DegradationController, DegradationEvent, DegradationPolicy, DegradationTrigger, ErrorCounts,
    ModeChange, OperationMode,
};
pub use fault::{ErrorCategory, ErrorKind, Fault, Severity};
pub use features::{features_for_mode, AppFeature, ResourceRequirements};
pub use health::{HealthSampler, StaticSampler, SystemHealth};
pub use metrics::ResilienceMetrics;
pub use recovery::{
    BackoffPolicy, RecoveryAttempt, RecoveryFailure, RecoveryOperation, RecoveryOrchestrator,
    RecoveryResult, RecoveryStatistics,
};
pub use strategy::{
    action_fn, select_strategy, ActionRegistry, RecoveryAction, RecoveryActionId, RecoveryContext,
    RecoveryStrategy,
};

/// Crate prelude collecting the most commonly used types.
pub mod prelude {
    pub use super::degradation::{DegradationController, OperationMode};
    pub use super::fault::{ErrorCategory, ErrorKind, Fault, Severity};
    pub use super::features::AppFeature;
    pub use super::health::{HealthSampler, SystemHealth};
    pub use super::recovery::{RecoveryOrchestrator, RecoveryResult};
    pub use super::strategy::{action_fn, RecoveryActionId, RecoveryStrategy};
}
