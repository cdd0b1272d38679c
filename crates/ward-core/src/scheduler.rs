//! ---
//! ward_section: "01-core-functionality"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Periodic health, cleanup, backup, and integrity tasks."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use ward_common::config::AppConfig;
use ward_resilience::HealthSampler;

use crate::facade::ResilienceFacade;

/// Automatic backups are checked this often; the engine decides whether one is due.
pub const BACKUP_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerIntervals {
    pub health: Duration,
    pub cleanup: Duration,
    pub backup_check: Duration,
    pub integrity: Duration,
}

impl SchedulerIntervals {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            health: config.degradation.evaluation_interval,
            cleanup: config.scheduler.cleanup_interval,
            backup_check: BACKUP_CHECK_INTERVAL.min(config.backup.automatic_interval),
            integrity: config.integrity.full_check_interval,
        }
    }
}

impl Default for SchedulerIntervals {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Running periodic tasks. Dropping the handle leaves them running; call
/// [`SchedulerHandle::shutdown`] to stop them.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl SchedulerHandle {
    /// Signal every task and wait for it to finish.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        for (name, handle) in self.tasks {
            if let Err(err) = handle.await {
                error!(target: "ward::scheduler", task = name, error = %err, "scheduler task join error");
            }
        }
        info!(target: "ward::scheduler", "scheduler stopped");
        Ok(())
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(name, _)| *name).collect()
    }
}

pub(crate) fn spawn(
    facade: ResilienceFacade,
    sampler: Arc<dyn HealthSampler>,
    intervals: SchedulerIntervals,
) -> SchedulerHandle {
    let (shutdown, _) = broadcast::channel(4);
    let mut tasks = Vec::new();

    {
        let facade = facade.clone();
        tasks.push((
            "health",
            spawn_periodic("health", intervals.health, true, shutdown.subscribe(), move || {
                let facade = facade.clone();
                let sampler = sampler.clone();
                async move {
                    match facade.sample_health(sampler).await {
                        Ok(mode) => debug!(target: "ward::scheduler", %mode, "health tick"),
                        Err(err) => warn!(target: "ward::scheduler", error = %err, "health sampling failed"),
                    }
                }
            }),
        ));
    }

    {
        let facade = facade.clone();
        tasks.push((
            "cleanup",
            spawn_periodic("cleanup", intervals.cleanup, false, shutdown.subscribe(), move || {
                let facade = facade.clone();
                async move {
                    facade.resources().cleanup();
                }
            }),
        ));
    }

    {
        let facade = facade.clone();
        tasks.push((
            "backup",
            spawn_periodic("backup", intervals.backup_check, true, shutdown.subscribe(), move || {
                let facade = facade.clone();
                async move {
                    match facade.run_automatic_backup().await {
                        Ok(Some(info)) => {
                            info!(target: "ward::scheduler", backup = %info.id, "automatic backup taken")
                        }
                        Ok(None) => debug!(target: "ward::scheduler", "automatic backup not due"),
                        Err(err) => error!(target: "ward::scheduler", error = %err, "automatic backup failed"),
                    }
                }
            }),
        ));
    }

    tasks.push((
        "integrity",
        spawn_periodic("integrity", intervals.integrity, false, shutdown.subscribe(), move || {
            let facade = facade.clone();
            async move {
                match facade.run_full_check().await {
                    Ok(outcome) => debug!(
                        target: "ward::scheduler",
                        issues = outcome.report.issues.len(),
                        fixed = outcome.fixes.map(|f| f.fixed_count()).unwrap_or(0),
                        "integrity tick"
                    ),
                    Err(err) => error!(target: "ward::scheduler", error = %err, "integrity check failed"),
                }
            }
        }),
    ));

    info!(
        target: "ward::scheduler",
        health = ?intervals.health,
        cleanup = ?intervals.cleanup,
        backup_check = ?intervals.backup_check,
        integrity = ?intervals.integrity,
        "scheduler started"
    );
    SchedulerHandle { shutdown, tasks }
}

/// Run `tick` every `period` until shutdown. When `immediate` is false the
/// first run waits one full period.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    immediate: bool,
    mut shutdown: broadcast::Receiver<()>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let period = period.max(Duration::from_millis(1));
        let start = if immediate {
            Instant::now()
        } else {
            Instant::now() + period
        };
        let mut interval = time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(target: "ward::scheduler", task = name, "task shutdown");
                    break;
                }
                _ = interval.tick() => tick().await,
            }
        }
    })
}
