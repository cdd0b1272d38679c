//! ---
//! ward_section: "01-core-functionality"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Shared primitives and utilities for the resilience core."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
//! Shared primitives for the Ward workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by the resilience, persistence, and integrity crates.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, BackupConfig, DataConfig, DegradationConfig, IntegrityConfig, LoggingConfig,
    MetricsConfig, RecoveryConfig, SchedulerConfig,
};
pub use logging::{init_tracing, LogFormat};
