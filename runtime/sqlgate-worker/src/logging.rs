//! Tracing setup. Stdout carries the wire protocol, so console output goes
//! to stderr; a second layer appends to `<log_dir>/sqlgate-worker.log`.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub fn default_level(debug: bool) -> &'static str {
    if debug { "debug" } else { "info" }
}

/// `RUST_LOG` wins over the level picked by the debug flag.
fn build_env_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level(debug)))
}

pub fn init_logging(debug: bool, log_file: &Path) -> anyhow::Result<()> {
    let file = log_file
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|()| OpenOptions::new().create(true).append(true).open(log_file));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(build_env_filter(debug));

    let (file_layer, file_error) = match file {
        Ok(file) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_target(true)
                    .with_thread_names(true)
                    .with_filter(build_env_filter(debug)),
            ),
            None,
        ),
        Err(err) => (None, Some(err)),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;

    match file_error {
        Some(err) => tracing::warn!(
            path = %log_file.display(),
            error = %err,
            "log file unavailable; logging to stderr only"
        ),
        None => tracing::debug!(path = %log_file.display(), "file logging enabled"),
    }
    Ok(())
}
