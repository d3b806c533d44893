//! Tracing setup for the daemon and CLI
//!
//! Two outputs: human readable INFO lines on stderr, and JSON lines at the
//! configured level in a daily rolling file under `global.log_directory`.
//! `RUST_LOG` overrides both filters.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::{expand_tilde, GlobalConfig};

const LOG_FILE_PREFIX: &str = "homeserver-backups";

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    /// Level written to the log file; the console always shows INFO
    pub file_level: Level,
    /// Rotated files kept on disk, oldest removed first
    pub keep_files: usize,
}

impl LoggingConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            directory: expand_tilde(&global.log_directory),
            file_level: parse_level(&global.log_level),
            keep_files: global.log_max_files.max(1) as usize,
        }
    }
}

fn parse_level(level: &str) -> Level {
    level.trim().parse().unwrap_or(Level::INFO)
}

/// Our own events at `level`, everything else (HTTP client, runtime) at WARN
fn directives(level: Level) -> String {
    format!("warn,homeserver_backups={}", level.as_str().to_lowercase())
}

fn filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives(level)))
}

/// Install the global subscriber; keep the returned guard alive until exit
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard> {
    fs::create_dir_all(&config.directory)
        .with_context(|| format!("Failed to create log directory: {:?}", config.directory))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(config.keep_files)
        .build(&config.directory)
        .with_context(|| format!("Failed to open log file in {:?}", config.directory))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(false)
        .with_filter(filter(config.file_level));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter(Level::INFO));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(LogGuard { _file_guard: guard })
}

/// Console-only logging for commands that run before a config is loaded
pub fn init_console_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(filter(Level::INFO))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Flushes buffered file output when dropped
pub struct LogGuard {
    _file_guard: WorkerGuard,
}
