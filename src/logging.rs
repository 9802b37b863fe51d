//! Structured logging setup (console + optional daily rolling file, text
//! or JSON lines).

use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// File name prefix used by the rolling appender.
pub const LOG_FILE_PREFIX: &str = "order-sync";

/// Install the global subscriber.
///
/// Returns the file writer guard when a log directory is configured; the
/// caller keeps it alive for as long as logs should be flushed. Calling this
/// twice is harmless: the second install attempt is ignored.
pub fn init_tracing(config: &LoggingConfig) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let console_layer = fmt::layer().with_target(true);

    let Some(log_dir) = config.directory.as_ref() else {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init();
        return None;
    };

    prune_old_logs(log_dir, config.max_log_files);
    fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let text_layer = (!config.json_files).then(|| {
        fmt::layer()
            .with_writer(non_blocking.clone())
            .with_ansi(false)
            .with_target(true)
    });
    let json_layer = config.json_files.then(|| {
        fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_target(true)
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(text_layer)
        .with(json_layer)
        .try_init();

    Some(guard)
}

/// Prune old log files, keeping only the most recent `keep`.
pub fn prune_old_logs(log_dir: &Path, keep: usize) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_ours = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with(LOG_FILE_PREFIX))
                .unwrap_or(false);
            if is_ours {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(keep) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_keeps_newest_and_ignores_foreign_files() {
        let dir = std::env::temp_dir().join(format!("order-sync-logs-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        for day in 1..=4u64 {
            let path = dir.join(format!("{LOG_FILE_PREFIX}.2026-01-0{day}"));
            fs::write(&path, "x").unwrap();
            let file = fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(std::time::UNIX_EPOCH + std::time::Duration::from_secs(day * 86_400))
                .unwrap();
        }
        fs::write(dir.join("unrelated.txt"), "keep me").unwrap();

        prune_old_logs(&dir, 2);

        let mut remaining: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec![
                format!("{LOG_FILE_PREFIX}.2026-01-03"),
                format!("{LOG_FILE_PREFIX}.2026-01-04"),
                "unrelated.txt".to_string(),
            ]
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_directory_is_a_no_op() {
        prune_old_logs(Path::new("/nonexistent/order-sync-logs"), 1);
    }
}
