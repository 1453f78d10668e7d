//! Tracing setup.
//!
//! Console logs go to stderr because stdout carries the remote shell's
//! output. File logging is optional and rolls daily.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// File name prefix of rolling log files.
const LOG_FILE_PREFIX: &str = "pbshell.log";

/// Builds the default filter directive for `level`.
pub fn filter_directive(level: &str) -> String {
    let level = level.to_lowercase();
    format!("pbshell={level},pbshell_protocol={level}")
}

/// Initializes the global subscriber.
///
/// `RUST_LOG` wins over the configured level; `verbose` forces debug. The
/// returned guard must be held for the life of the process when file
/// logging is enabled, or buffered lines are lost on exit.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(level)));

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_file(verbose)
        .with_line_number(verbose);

    let (file_layer, guard) = if config.log_file {
        std::fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("Failed to create log directory: {}", config.log_dir.display())
        })?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().with_writer(writer).with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}
