//! Logging setup: daily log file plus stderr, old files cleaned at start-up.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_RETENTION_DAYS: u64 = 7;
const LOG_PREFIX: &str = "relay";

pub struct LogManager {
    log_dir: PathBuf,
}

impl LogManager {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn current_log_path(&self) -> PathBuf {
        let today = chrono::Local::now().format("%Y-%m-%d");
        self.log_dir.join(format!("{}.{}.log", LOG_PREFIX, today))
    }

    /// Removes `relay.*.log` files last modified before `cutoff`. Returns how many went.
    pub fn cleanup_before(&self, cutoff: SystemTime) -> Result<usize> {
        let mut deleted_count = 0;
        for entry in fs::read_dir(&self.log_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !filename.starts_with(LOG_PREFIX) || !filename.ends_with(".log") {
                continue;
            }
            if entry.metadata()?.modified()? < cutoff {
                match fs::remove_file(&path) {
                    Ok(()) => deleted_count += 1,
                    Err(e) => eprintln!("Failed to delete old log {}: {}", path.display(), e),
                }
            }
        }
        Ok(deleted_count)
    }

    pub fn cleanup_old_logs(&self) -> Result<usize> {
        let retention = Duration::from_secs(LOG_RETENTION_DAYS * 24 * 60 * 60);
        self.cleanup_before(SystemTime::now() - retention)
    }
}

pub struct LoggingGuard {
    _guard: WorkerGuard,
}

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

pub fn init_logging(log_dir: &Path, log_level: &str) -> Result<LoggingGuard> {
    fs::create_dir_all(log_dir)?;
    let manager = LogManager::new(log_dir.to_path_buf());
    let deleted = manager.cleanup_old_logs()?;

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(manager.current_log_path())?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .with_filter(env_filter(log_level));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_filter(env_filter(log_level));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()?;

    if deleted > 0 {
        tracing::info!("Cleaned up {} old log file(s)", deleted);
    }

    Ok(LoggingGuard { _guard: guard })
}

/// Stderr-only logging for one-shot subcommands.
pub fn init_console_logging(log_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter(log_level))
        .try_init();
}
