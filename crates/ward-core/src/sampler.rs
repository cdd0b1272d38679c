//! ---
//! ward_section: "01-core-functionality"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Health sampler backed by operating system statistics."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysinfo::{Disks, Networks, System};
use tracing::debug;
use ward_resilience::{HealthSampler, SystemHealth};

/// Probes at or below this latency score 1.0.
const FAST_PROBE: Duration = Duration::from_millis(5);
/// Probes at or above this latency score 0.0.
const SLOW_PROBE: Duration = Duration::from_millis(500);

/// Samples memory, CPU, disk, and network state through `sysinfo`, and times
/// a metadata probe of the datastore file.
pub struct SysinfoSampler {
    system: Mutex<System>,
    datastore_path: PathBuf,
}

impl SysinfoSampler {
    pub fn new(datastore_path: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
            datastore_path: datastore_path.into(),
        }
    }

    fn disk_free(&self) -> f64 {
        let disks = Disks::new_with_refreshed_list();
        let target = fs::canonicalize(&self.datastore_path)
            .or_else(|_| {
                self.datastore_path
                    .parent()
                    .map(fs::canonicalize)
                    .unwrap_or_else(|| fs::canonicalize("."))
            })
            .ok();
        let disk = target
            .as_deref()
            .and_then(|path| {
                disks
                    .list()
                    .iter()
                    .filter(|disk| path.starts_with(disk.mount_point()))
                    .max_by_key(|disk| disk.mount_point().as_os_str().len())
            })
            .or_else(|| disks.list().first());
        match disk {
            Some(disk) if disk.total_space() > 0 => {
                disk.available_space() as f64 / disk.total_space() as f64
            }
            _ => 1.0,
        }
    }

    fn network_available() -> bool {
        let networks = Networks::new_with_refreshed_list();
        networks
            .list()
            .iter()
            .any(|(name, data)| name != "lo" && data.total_received() + data.total_transmitted() > 0)
    }
}

impl HealthSampler for SysinfoSampler {
    fn sample(&self) -> SystemHealth {
        let (memory_pressure, cpu_usage) = {
            let mut system = self.system.lock();
            system.refresh_memory();
            system.refresh_cpu();
            let total = system.total_memory();
            let memory = if total > 0 {
                system.used_memory() as f64 / total as f64
            } else {
                0.0
            };
            (memory, f64::from(system.global_cpu_info().cpu_usage()) / 100.0)
        };
        let disk_free = self.disk_free();
        let network_available = Self::network_available();
        let latency = probe_latency(&self.datastore_path);
        let latency_score = latency.map(latency_score).unwrap_or(0.0);
        debug!(
            target: "ward::health",
            memory_pressure,
            cpu_usage,
            disk_free,
            network_available,
            latency_ms = latency.map(|d| d.as_secs_f64() * 1000.0),
            "health sampled"
        );
        SystemHealth::new(
            memory_pressure,
            cpu_usage,
            disk_free,
            network_available,
            latency_score,
        )
    }
}

impl std::fmt::Debug for SysinfoSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoSampler")
            .field("datastore_path", &self.datastore_path)
            .finish_non_exhaustive()
    }
}

/// Time a metadata read of `path`, falling back to its parent directory when
/// the file does not exist yet.
fn probe_latency(path: &Path) -> Option<Duration> {
    let started = Instant::now();
    let found = fs::metadata(path).is_ok()
        || path
            .parent()
            .map(|parent| fs::metadata(parent).is_ok())
            .unwrap_or(false);
    found.then(|| started.elapsed())
}

fn latency_score(latency: Duration) -> f64 {
    if latency <= FAST_PROBE {
        return 1.0;
    }
    if latency >= SLOW_PROBE {
        return 0.0;
    }
    let span = (SLOW_PROBE - FAST_PROBE).as_secs_f64();
    1.0 - (latency - FAST_PROBE).as_secs_f64() / span
}
