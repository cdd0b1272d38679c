//! ---
//! ward_section: "07-resilience-fault-tolerance"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Application features gated by the operation mode."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator};

use crate::degradation::OperationMode;

/// Capabilities whose availability depends on the operation mode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumIter, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AppFeature {
    BasicTimeTracking,
    AutomaticTracking,
    RuleEngine,
    AdvancedSearch,
    Reporting,
    Analytics,
    DataExport,
    Notifications,
    BackgroundSync,
    AutomaticBackup,
    EmergencyBackup,
}

/// Share of machine capacity a feature is expected to consume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub memory: f64,
    pub cpu: f64,
    pub disk: f64,
}

impl AppFeature {
    /// Features that stay on in every mode.
    pub fn is_essential(&self) -> bool {
        matches!(self, AppFeature::BasicTimeTracking | AppFeature::EmergencyBackup)
    }

    pub fn resource_requirements(&self) -> ResourceRequirements {
        let (memory, cpu, disk) = match self {
            AppFeature::BasicTimeTracking => (0.01, 0.01, 0.001),
            AppFeature::AutomaticTracking => (0.03, 0.05, 0.005),
            AppFeature::RuleEngine => (0.04, 0.06, 0.0),
            AppFeature::AdvancedSearch => (0.08, 0.10, 0.01),
            AppFeature::Reporting => (0.05, 0.08, 0.005),
            AppFeature::Analytics => (0.10, 0.12, 0.02),
            AppFeature::DataExport => (0.04, 0.05, 0.05),
            AppFeature::Notifications => (0.01, 0.01, 0.0),
            AppFeature::BackgroundSync => (0.03, 0.04, 0.01),
            AppFeature::AutomaticBackup => (0.03, 0.04, 0.05),
            AppFeature::EmergencyBackup => (0.02, 0.03, 0.05),
        };
        ResourceRequirements { memory, cpu, disk }
    }

    /// Every feature in declaration order.
    pub fn all() -> BTreeSet<AppFeature> {
        AppFeature::iter().collect()
    }
}

/// Fixed mode to feature table. The result never depends on the previous set.
pub fn features_for_mode(mode: OperationMode) -> BTreeSet<AppFeature> {
    use AppFeature::*;
    match mode {
        OperationMode::Normal => AppFeature::all(),
        OperationMode::Offline => AppFeature::iter()
            .filter(|feature| *feature != BackgroundSync)
            .collect(),
        OperationMode::ReducedFunctionality => [
            BasicTimeTracking,
            AutomaticTracking,
            RuleEngine,
            Reporting,
            DataExport,
            Notifications,
            AutomaticBackup,
            EmergencyBackup,
        ]
        .into_iter()
        .collect(),
        OperationMode::Minimal => [
            BasicTimeTracking,
            AutomaticTracking,
            AutomaticBackup,
            EmergencyBackup,
        ]
        .into_iter()
        .collect(),
        OperationMode::Emergency => [BasicTimeTracking, EmergencyBackup].into_iter().collect(),
    }
}
