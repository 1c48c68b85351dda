//! Logging setup for the binary
//!
//! Everything goes to stderr and to a daily-rolling file under the data
//! directory's `logs/`. `RUST_LOG` overrides the default filter.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::HarvestError;

pub const DEFAULT_FILTER: &str = "lit_harvest=info";
const LOG_FILE_PREFIX: &str = "harvest.log";

/// Install the global subscriber
///
/// The returned guard flushes the file writer on drop, so keep it alive
/// for the whole process.
pub fn init(log_dir: &Path, verbose: bool) -> Result<WorkerGuard, HarvestError> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let default = if verbose { "lit_harvest=debug" } else { DEFAULT_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .try_init()
        .map_err(|e| HarvestError::Config(format!("Failed to initialize logging: {}", e)))?;

    Ok(guard)
}
