//! Shared logging setup for LEET binaries.
//!
//! A daily-rotated log file under the LEET home plus a stderr layer whose
//! verbosity follows the `-v` flag. `RUST_LOG` overrides both filters.

use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "leet=info,leet_coordinator=info,leet_backend=info";
const VERBOSE_LOG_FILTER: &str =
    "leet=debug,leet_coordinator=debug,leet_backend=debug,leet_plugins=debug,leet_protocol=debug";

/// Logging configuration of one binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a rotating file writer and a stderr layer.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("failed to ensure log directory")?;
    let file_writer =
        tracing_appender::rolling::daily(log_dir, format!("{}.log", config.app_name));

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(VERBOSE_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// The LEET home directory: `~/.leet`, overridable via `LEET_HOME`.
pub fn leet_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("LEET_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".leet")
}

/// The logs directory: `~/.leet/logs`.
pub fn logs_dir() -> PathBuf {
    leet_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}
