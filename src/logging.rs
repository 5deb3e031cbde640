//! Logging setup for the worker process.
//!
//! Logs go to a daily-rolling file under hot storage so that runs
//! against cold external disks leave a local trail. Level is
//! controlled via the `FACESORT_LOG` environment variable.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system.
///
/// - `FACESORT_LOG=debug` for verbose output
/// - `FACESORT_LOG=info` for standard output (default)
/// - `FACESORT_LOG=warn` for warnings and errors only
pub fn init(log_dir: PathBuf) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_env("FACESORT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "facesort.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Keep the guard alive for the life of the process; init() runs once
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(_guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    tracing::info!(dir = ?log_dir, "logging initialized");
    Ok(())
}
