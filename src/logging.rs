//! Logging setup for the profiler service
//!
//! Console output is human readable; the file output is JSON with daily or
//! hourly rotation so profiling sessions can be inspected after the fact.

use tracing_appender::non_blocking;
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::errors::ProfilerError;

/// Base name handed to the rolling appender; rotated files append a date suffix
const LOG_FILE_NAME: &str = "flow_profiler.log";

/// Logging configuration options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Directory to store log files
    pub log_dir: String,
    /// Log level filter (e.g., "info", "flow_profiler=debug")
    pub level_filter: String,
    pub rotation: LogRotation,
    /// Whether to include timestamps in console output
    pub console_timestamps: bool,
    /// Whether to use JSON format for file logs
    pub file_json_format: bool,
}

#[derive(Debug, Clone)]
pub enum LogRotation {
    Daily,
    Hourly,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            level_filter: "info,flow_profiler=info".to_string(),
            rotation: LogRotation::Daily,
            console_timestamps: true,
            file_json_format: true,
        }
    }
}

/// Initialize console + rotating file logging.
///
/// The returned guard must be kept alive for as long as file logging is
/// needed; dropping it flushes and stops the background writer.
pub fn init_dual_logging(
    config: LoggingConfig,
) -> Result<tracing_appender::non_blocking::WorkerGuard, ProfilerError> {
    std::fs::create_dir_all(&config.log_dir)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level_filter));
    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level_filter));

    let file_appender = match config.rotation {
        LogRotation::Daily => tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_NAME),
        LogRotation::Hourly => tracing_appender::rolling::hourly(&config.log_dir, LOG_FILE_NAME),
    };
    let (file_writer, guard) = non_blocking(file_appender);

    let console_format = if config.console_timestamps {
        "%Y-%m-%d %H:%M:%S%.3f UTC"
    } else {
        ""
    };
    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_target(true)
        .with_timer(ChronoUtc::new(console_format.to_string()))
        .with_filter(console_filter);

    let file_layer = if config.file_json_format {
        fmt::layer()
            .json()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_timer(ChronoUtc::new("%Y-%m-%dT%H:%M:%S%.3fZ".to_string()))
            .with_filter(file_filter)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_timer(ChronoUtc::new("%Y-%m-%d %H:%M:%S%.3f UTC".to_string()))
            .with_filter(file_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| ProfilerError::Logging(e.to_string()))?;

    tracing::info!(
        log_dir = %config.log_dir,
        rotation = ?config.rotation,
        json_format = config.file_json_format,
        "📁 Dual logging initialized - console + rotating files"
    );

    Ok(guard)
}

/// Initialize console-only logging for tests or minimal setups
pub fn init_simple_logging() -> Result<(), ProfilerError> {
    tracing_subscriber::fmt()
        .with_env_filter("info,flow_profiler=info")
        .try_init()
        .map_err(|e| ProfilerError::Logging(e.to_string()))?;

    tracing::info!("🖥️ Simple console logging initialized");
    Ok(())
}

/// Profiler log files in `log_dir`, sorted by name
pub fn get_current_log_files(log_dir: &str) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(log_dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| {
                    path.is_file()
                        && path
                            .file_name()
                            .and_then(|name| name.to_str())
                            .map(|name| name.starts_with(LOG_FILE_NAME))
                            .unwrap_or(false)
                })
                .collect()
        })
        .unwrap_or_default();

    files.sort();
    files
}

/// Remove log files older than `keep_days`
pub fn cleanup_old_logs(log_dir: &str, keep_days: u32) -> Result<usize, std::io::Error> {
    let cutoff_time =
        std::time::SystemTime::now() - std::time::Duration::from_secs(keep_days as u64 * 24 * 3600);

    let mut removed_count = 0;
    for path in get_current_log_files(log_dir) {
        let modified = path.metadata().and_then(|m| m.modified());
        if let Ok(modified) = modified {
            if modified < cutoff_time && std::fs::remove_file(&path).is_ok() {
                removed_count += 1;
                tracing::debug!("🗑️ Removed old log file: {:?}", path);
            }
        }
    }

    if removed_count > 0 {
        tracing::info!("🧹 Cleaned up {} old log files (older than {} days)", removed_count, keep_days);
    }

    Ok(removed_count)
}

/// Log basic host information at startup
pub fn log_system_info() {
    tracing::info!(
        package_version = env!("CARGO_PKG_VERSION"),
        target_arch = std::env::consts::ARCH,
        target_os = std::env::consts::OS,
        cpu_count = num_cpus::get(),
        "📊 Environment information logged"
    );
}
