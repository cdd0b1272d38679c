//! ---
//! ward_section: "01-core-functionality"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Tracing subscriber setup with stdout and retained daily log files."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

pub const LOG_ENV: &str = "WARD_LOG";

/// Writer guards live for the whole process so buffered lines are flushed on exit.
static GUARDS: OnceCell<(WorkerGuard, WorkerGuard)> = OnceCell::new();

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Pick the filter directive: `WARD_LOG`, then `RUST_LOG`, then the configured level.
/// Invalid overrides are reported on stderr and skipped.
fn resolve_filter(ward_log: Option<String>, rust_log: Option<String>, level: &str) -> EnvFilter {
    for (source, directive) in [(LOG_ENV, ward_log), ("RUST_LOG", rust_log)] {
        let Some(directive) = directive else { continue };
        match EnvFilter::try_new(&directive) {
            Ok(filter) => return filter,
            Err(err) => eprintln!("ignoring invalid {source} directive `{directive}`: {err}"),
        }
    }
    EnvFilter::new(level)
}

/// Install the global subscriber for `service_name`.
///
/// Stdout gets JSON or pretty lines per [`LogFormat`]. Every event is also
/// written as JSON to `<directory>/<prefix>.<date>.log`, rotated daily with
/// the newest `retained_files` files kept. Calling this twice is harmless;
/// the second subscriber is ignored.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!("unable to create log directory {}", config.directory.display())
    })?;
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(config.retained_files.max(1))
        .build(&config.directory)
        .context("unable to open rolling log file")?;

    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = GUARDS.set((file_guard, stdout_guard));

    let filter = resolve_filter(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
        &config.level,
    );
    let stdout_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(stdout_writer);
    let stdout_layer = match config.format {
        LogFormat::StructuredJson => stdout_layer.json().boxed(),
        LogFormat::Pretty => stdout_layer.boxed(),
    };
    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer);

    if tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        return Ok(());
    }
    info!(
        target: "ward::logging",
        service = service_name,
        directory = %config.directory.display(),
        format = ?config.format,
        retained_files = config.retained_files,
        "logging ready"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn same(filter: EnvFilter, expected: &str) -> bool {
        filter.to_string() == EnvFilter::new(expected).to_string()
    }

    #[test]
    fn ward_log_wins_over_rust_log() {
        let filter = resolve_filter(Some("ward::backup=debug".into()), Some("warn".into()), "info");
        assert!(same(filter, "ward::backup=debug"));
    }

    #[test]
    fn invalid_override_falls_through() {
        let filter = resolve_filter(Some("ward=loud".into()), Some("ward::crash=trace".into()), "info");
        assert!(same(filter, "ward::crash=trace"));
        assert!(same(resolve_filter(None, None, "error"), "error"));
    }

    #[test]
    fn format_names_are_kebab_case() {
        #[derive(Deserialize)]
        struct Doc {
            format: LogFormat,
        }
        let doc: Doc = toml::from_str("format = \"structured-json\"").unwrap();
        assert_eq!(doc.format, LogFormat::StructuredJson);
    }
}
