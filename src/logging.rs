//! Logging configuration for sqlfleet.
//!
//! Logs go to stderr so stdout only carries command results. A log file can
//! be configured instead, which is useful for scheduled runs.

use std::fs::{self, OpenOptions};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Returns the default filter directive for a `-v` count.
pub fn level_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn env_filter(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for_verbosity(verbosity)))
}

/// Initializes logging to stderr.
pub fn init_stderr_logging(verbosity: u8) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbosity))
        .with_writer(std::io::stderr)
        .init();
}

/// Initializes logging to a file, appending to previous runs.
///
/// Falls back to stderr logging if the file cannot be opened.
pub fn init_file_logging(path: &Path, verbosity: u8) {
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            eprintln!("Warning: Could not create log directory: {e}");
            init_stderr_logging(verbosity);
            return;
        }
    }

    let log_file = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not open log file: {e}");
            init_stderr_logging(verbosity);
            return;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbosity))
        .with_writer(log_file)
        .with_ansi(false)
        .init();
}
