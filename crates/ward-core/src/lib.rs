//! ---
//! ward_section: "01-core-functionality"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Crash recovery, scheduling, and the resilience facade."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
//! Composition root for the Ward resilience core.

pub mod crash;
pub mod events;
pub mod facade;
pub mod resources;
pub mod sampler;
pub mod scheduler;

pub use crash::{CrashRecoveryReport, CrashRecoveryService};
pub use events::{EventBus, ResilienceEvent};
pub use facade::{CheckOutcome, EmergencyBackup, FaultOutcome, ResilienceFacade, ResilienceStatistics};
pub use resources::{ResourceId, ResourceKind, ResourceTracker, TrackedResource};
pub use sampler::SysinfoSampler;
pub use scheduler::{SchedulerHandle, SchedulerIntervals};
