//! Logging infrastructure for CostPulse.
//!
//! Diagnostics go through the `tracing` ecosystem: a JSON-lines file under
//! the data directory for later inspection, plus a compact stderr layer for
//! interactive use. Ingestion code logs swallowed failures here instead of
//! surfacing them.
//!
//! ## Example
//!
//! ```no_run
//! use costpulse_core::logging;
//!
//! let _guard = logging::init_logging(None, false).expect("logging init");
//!
//! tracing::info!("CostPulse started");
//! tracing::debug!(file = "app.log", offset = 1024, "tailing");
//! ```

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{CostPulseError, Result};
use crate::paths;

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "costpulse.log";

/// Guard that must be held to ensure log flushing on shutdown.
///
/// Keep this guard alive for the lifetime of the application.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize the CostPulse logging system.
///
/// Sets up a daily-rolling JSON file under `log_dir` (defaults to
/// `<data dir>/logs/`) and a human-readable stderr layer. `RUST_LOG`
/// overrides the level; otherwise `verbose` selects DEBUG over INFO.
pub fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> Result<LogGuard> {
    let log_dir = match log_dir {
        Some(dir) => dir,
        None => default_log_dir()?,
    };

    std::fs::create_dir_all(&log_dir)
        .map_err(|e| CostPulseError::io("creating log directory", &log_dir, e))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("costpulse={default_level}")));

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_span_list(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(verbose)
        .with_thread_ids(false)
        .with_file(verbose)
        .with_line_number(verbose)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| CostPulseError::internal(format!("logging already initialized: {e}")))?;

    tracing::debug!(log_dir = %log_dir.display(), verbose, "logging initialized");

    Ok(LogGuard {
        _file_guard: Some(file_guard),
    })
}

/// Initialize minimal console-only logging for tests.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// Get the default log directory path (`<data dir>/logs/`).
pub fn default_log_dir() -> Result<PathBuf> {
    Ok(paths::data_dir()?.join("logs"))
}
