//! Process-wide `tracing` setup.
//!
//! Events go to stderr, and additionally to an append-only log file when one
//! is configured (daemon runs). `RUST_LOG` overrides the configured level.
//!
//! Field names used across the crate: `attempt_id`, `path`, `pid`, `status`,
//! `t`.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// trace, debug, info, warn or error; `warning` and `critical` are
    /// accepted as aliases.
    pub level: String,
    pub json: bool,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to open log file: {0}")]
    FileOpen(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn normalize_level(level: &str) -> Result<&'static str, LogError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" | "critical" => Ok("error"),
        _ => Err(LogError::InvalidLevel(level.to_string())),
    }
}

fn open_log_file(path: &Path) -> io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Installs the global subscriber. Call once at startup.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }
    let level = normalize_level(&config.level)?;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file = match &config.file {
        Some(path) => Some(Mutex::new(open_log_file(path)?)),
        None => None,
    };

    if config.json {
        let stderr_layer = fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_target(true)
            .flatten_event(true);
        let file_layer = file.map(|f| {
            fmt::layer()
                .json()
                .with_writer(f)
                .with_target(true)
                .flatten_event(true)
        });
        tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer),
        )?;
    } else {
        let stderr_layer = fmt::layer().with_writer(io::stderr).with_target(false);
        let file_layer = file.map(|f| {
            fmt::layer()
                .with_writer(f)
                .with_target(true)
                .with_ansi(false)
        });
        tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer),
        )?;
    }

    let _ = LOGGING_INITIALIZED.set(true);
    tracing::debug!(
        log_level = level,
        log_json = config.json,
        log_file = ?config.file,
        "logging initialized"
    );
    Ok(())
}
