//! Tracing configuration and log routing.
//!
//! Pipeline runs log to stdout using a compact formatter and to a file. When
//! `PAPERHOARD_LOG_FILE` is set, logs are appended to that path (`-` disables file logging);
//! otherwise a file logger is created under `logs/paperhoard.log`. Long fetch cooldowns make
//! the file log the primary record of an unattended run.
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LOG_FILE_VAR: &str = "PAPERHOARD_LOG_FILE";

/// Configure tracing subscribers for stdout and optional file logging.
///
/// `RUST_LOG` wins when set; otherwise `default_directive` (e.g. `info` or `debug`) applies.
pub fn init_tracing(default_directive: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let stdout_layer = fmt::layer().with_target(false).compact();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    match configure_file_writer() {
        Some(writer) => {
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .compact();
            registry.with(file_layer).init();
        }
        None => registry.init(),
    }
}

/// Build a non‑blocking writer for file logging.
///
/// Returns `None` when file logging is disabled or the target cannot be opened.
fn configure_file_writer() -> Option<NonBlocking> {
    match std::env::var(LOG_FILE_VAR) {
        Ok(path) if path.trim() == "-" => None,
        Ok(path) => match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            Ok(file) => Some(install_writer(tracing_appender::non_blocking(file))),
            Err(err) => {
                eprintln!("Failed to open log file {path}: {err}");
                None
            }
        },
        Err(_) => {
            if let Err(err) = std::fs::create_dir_all("logs") {
                eprintln!("Failed to create logs directory: {err}");
                return None;
            }
            let appender = tracing_appender::rolling::never("logs", "paperhoard.log");
            Some(install_writer(tracing_appender::non_blocking(appender)))
        }
    }
}

fn install_writer((writer, guard): (NonBlocking, WorkerGuard)) -> NonBlocking {
    let _ = LOG_GUARD.set(guard);
    writer
}
