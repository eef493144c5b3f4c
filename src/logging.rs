#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::Context as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

/// Keeps the non-blocking log writer alive; dropping it flushes and stops
/// the background writer thread.
pub struct LogGuard {
    _file: tracing_appender::non_blocking::WorkerGuard,
}

/// Initialize process-wide logging: a daily file under `logs_dir` named
/// `nightshift_YYYYMMDD.log`, and an optional console layer. The file name
/// is fixed at init time.
pub fn init(logs_dir: &Path, console: bool) -> anyhow::Result<LogGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create {}", logs_dir.display()))?;

    let date = time::OffsetDateTime::now_utc()
        .format(time::macros::format_description!("[year][month][day]"))
        .unwrap_or_else(|_| "unknown".to_owned());
    let log_path = logs_dir.join(format!("nightshift_{date}.log"));

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    if console {
        let console_layer = tracing_subscriber::fmt::layer().compact().with_target(false);
        registry.with(console_layer).try_init().ok();
    } else {
        registry.try_init().ok();
    }

    Ok(LogGuard { _file: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_dated_log_file() {
        let td = tempfile::tempdir().expect("tempdir");
        let _guard = init(td.path(), false).unwrap();

        let names: Vec<String> = std::fs::read_dir(td.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names
            .iter()
            .any(|n| n.starts_with("nightshift_") && n.ends_with(".log")));
    }
}
