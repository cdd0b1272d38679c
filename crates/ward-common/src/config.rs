//! ---
//! ward_section: "01-core-functionality"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Shared primitives and utilities for the resilience core."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_data_directory() -> PathBuf {
    PathBuf::from("target/ward/data")
}

fn default_datastore_file() -> String {
    "datastore.json".to_owned()
}

fn default_dirty_flag_file() -> String {
    "ward.dirty".to_owned()
}

fn default_backup_directory() -> PathBuf {
    PathBuf::from("target/ward/backups")
}

fn default_max_backups() -> usize {
    10
}

fn default_backup_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_true() -> bool {
    true
}

fn default_evaluation_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_history_limit() -> usize {
    100
}

fn default_high_severity_threshold() -> usize {
    3
}

fn default_error_window() -> Duration {
    Duration::from_secs(300)
}

fn default_max_attempts() -> usize {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_full_check_interval() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_event_capacity() -> usize {
    256
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/ward/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_retained_log_files() -> usize {
    7
}

/// Primary configuration object for the Ward runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub degradation: DegradationConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub integrity: IntegrityConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "WARD_CONFIG";

    /// Load configuration from disk, respecting the `WARD_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// A desktop install may run without any configuration file, so when no
    /// candidate exists the defaults are returned with `source: None`.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        let config = AppConfig::default();
        config.validate()?;
        Ok(LoadedAppConfig {
            config,
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Full path of the persisted datastore.
    pub fn datastore_path(&self) -> PathBuf {
        self.data.directory.join(&self.data.datastore_file)
    }

    /// Full path of the unclean-shutdown marker.
    pub fn dirty_flag_path(&self) -> PathBuf {
        self.data.directory.join(&self.data.dirty_flag_file)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.backup.validate()?;
        self.recovery.validate()?;
        if self.degradation.history_limit == 0 {
            return Err(anyhow!("degradation.history_limit must be at least 1"));
        }
        if self.degradation.high_severity_threshold == 0 {
            return Err(anyhow!(
                "degradation.high_severity_threshold must be at least 1"
            ));
        }
        if self.backup.directory == self.data.directory {
            return Err(anyhow!(
                "backup.directory must differ from data.directory so the dirty flag lives outside the backup store"
            ));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Location of the live datastore and the crash marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_datastore_file")]
    pub datastore_file: String,
    #[serde(default = "default_dirty_flag_file")]
    pub dirty_flag_file: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            directory: default_data_directory(),
            datastore_file: default_datastore_file(),
            dirty_flag_file: default_dirty_flag_file(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    #[serde(default = "default_true")]
    pub automatic: bool,
    #[serde(default = "default_backup_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub automatic_interval: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: default_backup_directory(),
            max_backups: default_max_backups(),
            automatic: true,
            automatic_interval: default_backup_interval(),
        }
    }
}

impl BackupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_backups == 0 {
            return Err(anyhow!("backup.max_backups must be at least 1"));
        }
        if self.automatic_interval.is_zero() {
            return Err(anyhow!("backup.automatic_interval must be non-zero"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationConfig {
    #[serde(default = "default_evaluation_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub evaluation_interval: Duration,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_high_severity_threshold")]
    pub high_severity_threshold: usize,
    #[serde(default = "default_error_window")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub error_window: Duration,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: default_evaluation_interval(),
            history_limit: default_history_limit(),
            high_severity_threshold: default_high_severity_threshold(),
            error_window: default_error_window(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay_ms: Duration,
    #[serde(default = "default_max_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay_ms: Duration,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            history_limit: default_history_limit(),
            seed: None,
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("recovery.max_attempts must be at least 1"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(anyhow!(
                "recovery.max_delay_ms ({:?}) must not be below recovery.base_delay_ms ({:?})",
                self.max_delay_ms,
                self.base_delay_ms
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityConfig {
    #[serde(default = "default_full_check_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub full_check_interval: Duration,
    #[serde(default = "default_true")]
    pub auto_fix: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            full_check_interval: default_full_check_interval(),
            auto_fix: true,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_cleanup_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cleanup_interval: Duration,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: default_cleanup_interval(),
            event_capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Daily log files kept in `directory`; older ones are deleted on rotation.
    #[serde(default = "default_retained_log_files")]
    pub retained_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            level: default_log_level(),
            retained_files: default_retained_log_files(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.backup.max_backups, 10);
        assert_eq!(config.backup.automatic_interval, Duration::from_secs(3600));
        assert_eq!(config.recovery.max_attempts, 3);
        assert_eq!(config.recovery.base_delay_ms, Duration::from_secs(1));
        assert_eq!(config.recovery.max_delay_ms, Duration::from_secs(60));
        assert_eq!(config.degradation.evaluation_interval, Duration::from_secs(30));
        assert_eq!(config.degradation.error_window, Duration::from_secs(300));
    }

    #[test]
    fn sections_override_defaults() {
        let config: AppConfig = r#"
            [data]
            directory = "/tmp/ward-data"

            [backup]
            directory = "/tmp/ward-backups"
            max_backups = 4
            automatic_interval = 120

            [recovery]
            base_delay_ms = 5
            max_delay_ms = 50
            seed = 7

            [logging]
            format = "pretty"
            level = "debug"
        "#
        .parse()
        .unwrap();
        assert_eq!(config.backup.max_backups, 4);
        assert_eq!(config.backup.automatic_interval, Duration::from_secs(120));
        assert_eq!(config.recovery.base_delay_ms, Duration::from_millis(5));
        assert_eq!(config.recovery.seed, Some(7));
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(
            config.datastore_path(),
            PathBuf::from("/tmp/ward-data/datastore.json")
        );
    }

    #[test]
    fn validation_rejects_inverted_delays() {
        let err = r#"
            [recovery]
            base_delay_ms = 500
            max_delay_ms = 10
        "#
        .parse::<AppConfig>()
        .unwrap_err();
        assert!(format!("{err:#}").contains("max_delay_ms"));
    }

    #[test]
    fn validation_rejects_zero_retention() {
        let err = "[backup]\nmax_backups = 0\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(format!("{err:#}").contains("max_backups"));
    }

    #[test]
    fn load_reads_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ward.toml");
        fs::write(&path, "[backup]\nmax_backups = 2\n").unwrap();
        let missing = dir.path().join("missing.toml");
        let loaded = AppConfig::load_with_source(&[missing, path.clone()]).unwrap();
        assert_eq!(loaded.source, Some(path));
        assert_eq!(loaded.config.backup.max_backups, 2);
    }
}
