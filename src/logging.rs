//! Structured logging setup
//!
//! JSON or human-readable output on stderr, with an optional copy appended
//! to a file. Stdout is left to the console surface.

use std::fs::OpenOptions;
use std::io;
use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

/// Build the event filter: `RUST_LOG` when set, otherwise the configured level
///
/// # Errors
///
/// Returns an error if neither source holds a valid filter directive
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;
    Ok(filter)
}

/// Install the global tracing subscriber
///
/// # Arguments
///
/// * `config` - Logging configuration (level already merged with CLI flags)
///
/// # Errors
///
/// Returns an error if the filter is invalid, the log file cannot be
/// opened, or a subscriber is already installed
///
/// # Examples
///
/// ```no_run
/// use pocketclaw::config::LoggingConfig;
/// use pocketclaw::logging::init_logging;
///
/// init_logging(&LoggingConfig::default()).unwrap();
/// tracing::info!("ready");
/// ```
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(build_filter(config)?);

    let file = match &config.file {
        Some(path) => Some(Arc::new(
            OpenOptions::new().create(true).append(true).open(path)?,
        )),
        None => None,
    };

    match config.format {
        LogFormat::Json => {
            let stderr_layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(io::stderr);
            let file_layer = file.map(|file| {
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(file)
            });
            registry.with(stderr_layer).with(file_layer).try_init()?;
        }
        LogFormat::Pretty => {
            let stderr_layer = fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_writer(io::stderr);
            let file_layer = file.map(|file| {
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(false)
                    .with_writer(file)
            });
            registry.with(stderr_layer).with(file_layer).try_init()?;
        }
    }

    Ok(())
}
