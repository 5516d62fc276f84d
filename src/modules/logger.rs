// 日志初始化
//
// stdout fmt layer, optional daily-rolling file layer, `log` crate bridge.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::models::LogConfig;

const LOG_FILE_PREFIX: &str = "trial-gateway.log";

/// Build the level filter: `rust_log` (the `RUST_LOG` value) wins, then the
/// configured level.
pub fn build_filter(config: &LogConfig, rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_new(&config.level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process so buffered file output is flushed.
pub fn init_logger(config: &LogConfig) -> Result<Option<WorkerGuard>, String> {
    // Ignore the error if another logger is already installed (tests)
    let _ = tracing_log::LogTracer::init();

    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(config, rust_log.as_deref());

    match config.dir.as_deref() {
        Some(dir) => {
            let (writer, guard) = file_writer(dir)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(false))
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()
                .map_err(|e| format!("failed_to_init_logger: {}", e))?;
            tracing::info!("Logging to {}", dir.display());
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(false))
                .try_init()
                .map_err(|e| format!("failed_to_init_logger: {}", e))?;
            Ok(None)
        }
    }
}

fn file_writer(
    dir: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard), String> {
    std::fs::create_dir_all(dir).map_err(|e| format!("failed_to_create_log_dir: {}", e))?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    Ok(tracing_appender::non_blocking(appender))
}
