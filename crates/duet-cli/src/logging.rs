//! Tracing subscriber setup.
//!
//! Filter precedence: `DUET_LOG` > `RUST_LOG` > `logging.level` from config.
//! Human-readable output goes to stderr. With `logging.file_enabled`, JSON
//! lines are also written to a daily-rotated file under `$DUET_HOME/logs`.

use std::fs;
use std::io::stderr;

use anyhow::{Context, Result};
use duet_core::config::{LoggingConfig, paths};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = resolve_filter(config)?;
    let stderr_layer = fmt::layer().with_writer(stderr).with_target(false);

    if !config.file_enabled {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init()
            .context("install tracing subscriber")?;
        return Ok(None);
    }

    let dir = paths::logs_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("create log directory {}", dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, "duet.log"));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(fmt::layer().json().with_writer(writer).with_ansi(false))
        .try_init()
        .context("install tracing subscriber")?;
    Ok(Some(guard))
}

fn resolve_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let directives = filter_directives(
        std::env::var("DUET_LOG").ok(),
        std::env::var("RUST_LOG").ok(),
        &config.level,
    );
    EnvFilter::try_new(&directives).with_context(|| format!("invalid log filter \"{directives}\""))
}

fn filter_directives(duet_log: Option<String>, rust_log: Option<String>, level: &str) -> String {
    duet_log
        .into_iter()
        .chain(rust_log)
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| level.trim().to_string())
}
