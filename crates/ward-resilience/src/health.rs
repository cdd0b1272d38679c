//! ---
//! ward_section: "07-resilience-fault-tolerance"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "System health snapshots and the sampler seam."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable health snapshot produced on every sampling tick.
///
/// All scores are normalised to `0.0..=1.0`. `memory_pressure` and `cpu_usage`
/// grow with load, while `disk_free` and `datastore_latency_score` grow with
/// headroom (1.0 means plenty of free disk or a fast datastore).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub memory_pressure: f64,
    pub cpu_usage: f64,
    pub disk_free: f64,
    pub network_available: bool,
    pub datastore_latency_score: f64,
    pub sampled_at: DateTime<Utc>,
}

impl SystemHealth {
    /// Build a snapshot, clamping every score into range. Non-finite inputs
    /// are treated as the worst possible reading.
    pub fn new(
        memory_pressure: f64,
        cpu_usage: f64,
        disk_free: f64,
        network_available: bool,
        datastore_latency_score: f64,
    ) -> Self {
        Self {
            memory_pressure: clamp_unit(memory_pressure, 1.0),
            cpu_usage: clamp_unit(cpu_usage, 1.0),
            disk_free: clamp_unit(disk_free, 0.0),
            network_available,
            datastore_latency_score: clamp_unit(datastore_latency_score, 0.0),
            sampled_at: Utc::now(),
        }
    }

    /// A fully healthy reading.
    pub fn nominal() -> Self {
        Self::new(0.2, 0.1, 0.8, true, 1.0)
    }

    /// Unweighted mean of the five normalised components.
    pub fn overall_score(&self) -> f64 {
        let network = if self.network_available { 1.0 } else { 0.5 };
        let components = [
            1.0 - self.memory_pressure,
            1.0 - self.cpu_usage,
            self.disk_free,
            network,
            self.datastore_latency_score,
        ];
        components.iter().sum::<f64>() / components.len() as f64
    }
}

fn clamp_unit(value: f64, worst: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        worst
    }
}

/// Source of periodic health samples. Implementations may block briefly on OS queries.
pub trait HealthSampler: Send + Sync {
    fn sample(&self) -> SystemHealth;
}

/// Sampler returning a fixed reading; the value can be swapped at runtime.
#[derive(Debug)]
pub struct StaticSampler {
    health: parking_lot::Mutex<SystemHealth>,
}

impl StaticSampler {
    pub fn new(health: SystemHealth) -> Self {
        Self {
            health: parking_lot::Mutex::new(health),
        }
    }

    /// Replace the reading returned by subsequent samples.
    pub fn set(&self, health: SystemHealth) {
        *self.health.lock() = health;
    }
}

impl HealthSampler for StaticSampler {
    fn sample(&self) -> SystemHealth {
        let mut health = *self.health.lock();
        health.sampled_at = Utc::now();
        health
    }
}
