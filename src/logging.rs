//! Tracing setup: everything to stdout, INFO and above to a per-launch file.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Local};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

use crate::error::WorkerError;
use crate::fs_util;

const MAX_LOG_FILES: usize = 30;
const LOG_FILE_PREFIX: &str = "crosscheck";
const DISPLAY_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

/// Installs the global subscriber. Keep the returned guard alive until exit
/// or buffered file output is lost.
pub fn init(log_dir: &Path) -> Result<WorkerGuard, WorkerError> {
    fs_util::create_directory(log_dir)?;
    let file_name = log_file_name(Local::now());
    let (file_writer, guard) =
        tracing_appender::non_blocking(rolling::never(log_dir, &file_name));
    if let Err(err) = prune_old_logs(log_dir, MAX_LOG_FILES) {
        eprintln!("failed to prune old logs: {err}");
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer()
        .with_timer(ChronoLocal::new(DISPLAY_FORMAT.to_string()))
        .with_target(false)
        .with_writer(std::io::stdout);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_timer(ChronoLocal::new(DISPLAY_FORMAT.to_string()))
        .with_writer(file_writer)
        .with_filter(LevelFilter::INFO);

    Registry::default()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| WorkerError::Logging(err.to_string()))?;

    tracing::debug!(path = %log_dir.join(&file_name).display(), "logging initialized");
    Ok(guard)
}

fn log_file_name(now: DateTime<Local>) -> String {
    format!("{LOG_FILE_PREFIX}_{}.log", now.format("%Y_%m_%d_%H_%M_%S"))
}

fn prune_old_logs(dir: &Path, max_files: usize) -> std::io::Result<()> {
    let mut entries = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .filter(|entry| entry.path().extension().and_then(|ext| ext.to_str()) == Some("log"))
        .map(|entry| {
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, entry.path())
        })
        .collect::<Vec<_>>();

    entries.sort_by_key(|(modified, _)| *modified);
    let excess = entries.len().saturating_sub(max_files);
    for (_, path) in entries.into_iter().take(excess) {
        fs::remove_file(path)?;
    }
    Ok(())
}
