//! ---
//! ward_section: "01-core-functionality"
//! ward_subsection: "binary"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Binary entrypoint for the Ward daemon."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{error, info, warn};
use uuid::Uuid;
use ward_common::config::AppConfig;
use ward_common::logging::init_tracing;
use ward_core::{EmergencyBackup, ResilienceFacade, SysinfoSampler};
use ward_integrity::{IntegrityIssue, IntegrityReport};
use ward_metrics::{new_registry, render_text};
use ward_persistence::{BackupInfo, BackupKind};
use ward_resilience::HealthSampler;

#[derive(Debug, Parser)]
#[command(author, version, about = "Ward resilience daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run crash recovery and the periodic scheduler until interrupted")]
    Run,
    #[command(subcommand, about = "Manage backups")]
    Backup(BackupCommand),
    #[command(about = "Run an integrity check")]
    Check {
        #[arg(long, help = "Run only critical rules")]
        quick: bool,
        #[arg(long, help = "Apply automatic fixes to detected issues")]
        fix: bool,
    },
    #[command(about = "Print mode, health, statistics, and metrics")]
    Status,
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    #[command(about = "Create a backup now")]
    Create {
        #[arg(long, value_enum, default_value_t = CliBackupKind::Manual)]
        kind: CliBackupKind,
    },
    #[command(about = "List backups, newest first")]
    List,
    #[command(about = "Verify the checksum of a backup")]
    Verify { id: Uuid },
    #[command(about = "Restore the datastore from a backup")]
    Restore { id: Uuid },
    #[command(about = "Rebuild the manifest by scanning the backup directory")]
    RebuildIndex,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliBackupKind {
    Manual,
    Emergency,
}

impl From<CliBackupKind> for BackupKind {
    fn from(value: CliBackupKind) -> Self {
        match value {
            CliBackupKind::Manual => BackupKind::Manual,
            CliBackupKind::Emergency => BackupKind::Emergency,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/ward.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    init_tracing("wardd", &config.logging)?;
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; using defaults"),
    }

    let registry = config.metrics.enabled.then(new_registry);
    let facade = ResilienceFacade::open(config, registry)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(facade).await?,
        Commands::Backup(command) => run_backup_command(&facade, command).await?,
        Commands::Check { quick, fix } => run_check(&facade, quick, fix).await?,
        Commands::Status => print_status(&facade).await?,
    }
    Ok(())
}

async fn run_daemon(facade: ResilienceFacade) -> Result<()> {
    install_panic_hook(facade.emergency_handle());

    let report = facade.run_startup().await?;
    if report.unclean_shutdown {
        warn!(
            recovered = report.recovered_sessions,
            failed = report.failed_sessions,
            emergency_backup = ?report.emergency_backup.as_ref().map(|info| info.id),
            "recovered from unclean shutdown"
        );
    }

    let sampler: Arc<dyn HealthSampler> =
        Arc::new(SysinfoSampler::new(facade.config().datastore_path()));
    let handle = facade.start(sampler);

    info!(mode = %facade.current_mode(), "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    facade.shutdown(Some(handle)).await
}

/// Take a best-effort emergency backup before the default hook reports the panic.
fn install_panic_hook(emergency: EmergencyBackup) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        match emergency.run() {
            Ok(info) => error!(backup = %info.id, "emergency backup taken after panic"),
            Err(err) => error!(error = %err, "emergency backup after panic failed"),
        }
        previous(panic_info);
    }));
}

async fn run_backup_command(facade: &ResilienceFacade, command: BackupCommand) -> Result<()> {
    let backups = facade.backups();
    match command {
        BackupCommand::Create { kind } => {
            let info = facade.create_backup(kind.into()).await?;
            print_backup(&info);
        }
        BackupCommand::List => {
            let listed = backups.list_backups();
            if listed.is_empty() {
                println!("No backups in {}", backups.directory().display());
            }
            for info in &listed {
                print_backup(info);
            }
        }
        BackupCommand::Verify { id } => {
            let info = find_backup(facade, id)?;
            match backups.verify_backup(&info) {
                Ok(()) => println!("{id}: ok"),
                Err(err) => {
                    println!("{id}: {err}");
                    return Err(err).context("backup verification failed");
                }
            }
        }
        BackupCommand::Restore { id } => {
            let info = find_backup(facade, id)?;
            let engine = backups.clone();
            let payload = tokio::task::spawn_blocking(move || engine.restore_into(&info))
                .await
                .context("restore task panicked")??;
            println!(
                "Restored {} entities from backup taken {}",
                payload.data.entity_count(),
                payload.metadata.created_at
            );
        }
        BackupCommand::RebuildIndex => {
            let engine = backups.clone();
            let entries = tokio::task::spawn_blocking(move || engine.rebuild_index())
                .await
                .context("rebuild task panicked")??;
            println!("Manifest rebuilt with {entries} entries");
        }
    }
    Ok(())
}

fn find_backup(facade: &ResilienceFacade, id: Uuid) -> Result<BackupInfo> {
    facade
        .backups()
        .find_backup(id)
        .ok_or_else(|| anyhow!("backup {id} not found"))
}

fn print_backup(info: &BackupInfo) {
    println!(
        "{}  {}  {:<9}  {:>10} B  {}",
        info.id,
        info.timestamp.to_rfc3339(),
        info.kind,
        info.byte_size,
        &info.checksum[..info.checksum.len().min(12)]
    );
}

async fn run_check(facade: &ResilienceFacade, quick: bool, fix: bool) -> Result<()> {
    let validator = facade.validator().clone();
    let (report, fixes) = tokio::task::spawn_blocking(move || {
        let report: IntegrityReport = if quick {
            validator.perform_quick_check()
        } else {
            validator.perform_full_check()
        };
        let fixes = fix.then(|| validator.auto_fix_issues(&report.issues));
        (report, fixes)
    })
    .await
    .context("integrity task panicked")?;

    println!("{} rules run, {} issues", report.rules_run, report.issues.len());
    for issue in &report.issues {
        print_issue(issue);
    }
    if let Some(fixes) = fixes {
        println!("Fixed {}, failed {}", fixes.fixed_count(), fixes.failed_count());
        for failure in &fixes.failed {
            println!("  #{} not fixed: {}", failure.issue.id, failure.reason);
        }
    }
    Ok(())
}

fn print_issue(issue: &IntegrityIssue) {
    println!(
        "  #{:<4} {:<8} {:<20} {}{}",
        issue.id,
        issue.severity.as_str(),
        issue.kind.as_str(),
        issue.description,
        if issue.can_auto_fix { "" } else { " (manual)" }
    );
}

async fn print_status(facade: &ResilienceFacade) -> Result<()> {
    let sampler: Arc<dyn HealthSampler> =
        Arc::new(SysinfoSampler::new(facade.config().datastore_path()));
    facade.sample_health(sampler).await?;
    let status = serde_json::json!({
        "statistics": facade.statistics(),
        "health": facade.degradation().last_health(),
        "features": facade.degradation().active_features(),
        "latest_backup": facade.backups().latest_backup(),
        "open_issues": facade.validator().open_issues().len(),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    if let Some(registry) = facade.registry() {
        println!("{}", render_text(registry)?);
    }
    Ok(())
}
