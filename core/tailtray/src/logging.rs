//! Log setup for the `tailtray` binary.
//!
//! Writes to a daily rolling file under the platform state directory when one
//! exists, stderr otherwise. The returned guard flushes the non-blocking writer
//! and must live until `main` returns.

use std::env;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "TAILTRAY_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "tailtray.log";

pub fn init(configured_level: &str) -> Option<WorkerGuard> {
    let filter = filter(configured_level);

    match log_dir() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let installed = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .is_ok();
            installed.then_some(guard)
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
            None
        }
    }
}

fn filter(configured_level: &str) -> EnvFilter {
    if debug_enabled() {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(configured_level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

fn debug_enabled() -> bool {
    env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn log_dir() -> Option<PathBuf> {
    let dir = dirs::state_dir()
        .or_else(dirs::data_local_dir)?
        .join("tailtray")
        .join("logs");
    fs_err::create_dir_all(&dir).ok()?;
    Some(dir)
}
