//! Tracing setup: a daily log file under the data dir plus compact stderr

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE: &str = "wacpack.log";

/// Install the global subscriber
///
/// `RUST_LOG` overrides the level chosen by `verbose`.
pub fn init(verbose: bool) -> Result<()> {
    let log_dir = get_log_dir()?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let pipeline_log = tracing_appender::rolling::daily(&log_dir, LOG_FILE);
    let filter = filter(verbose, std::env::var("RUST_LOG").ok().as_deref());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(pipeline_log)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    tracing::debug!(dir = %log_dir.display(), "Logging to {}", LOG_FILE);
    Ok(())
}

fn filter(verbose: bool, directives: Option<&str>) -> EnvFilter {
    let fallback = if verbose { "wacpack=debug" } else { "wacpack=info" };
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(fallback))
}

fn get_log_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().context("Failed to determine data directory")?;
    Ok(data_dir.join("wacpack").join("logs"))
}
