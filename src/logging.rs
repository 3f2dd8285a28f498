use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;

const LOG_FILE: &str = ".yt_downloader.log";

/// `~/.yt_downloader.log`
pub fn default_log_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(LOG_FILE)
}

/// Install the global subscriber; later calls are no-ops.
///
/// With a `log_file` everything is appended there, otherwise it goes to stderr.
/// `RUST_LOG` overrides the default filter.
pub fn init_tracing(log_file: Option<&Path>) {
    static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "yt_downloader_core=info".into());

    let Some(path) = log_file else {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        return;
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| LOG_FILE.into());

    if let Err(err) = std::fs::create_dir_all(&dir) {
        eprintln!("Failed to create log directory: {err}");
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        return;
    }

    let file_appender = tracing_appender::rolling::never(&dir, name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .try_init();
}
