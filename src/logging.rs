//! Structured logging and tracing for Argus
//!
//! This module provides logging functionality with support for structured
//! logging, optional file output, and integration with the tracing
//! ecosystem.

use crate::config::LoggingConfig;
use crate::error::Result;
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Once;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub mod level;
pub mod structured;

pub use level::{min_level, parse_log_level};
pub use structured::{LogContext, StructuredLogger, get_logger, get_logger_with_context};

// Keep the non-blocking worker guard alive for the entire process lifetime
static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static INIT_ONCE: Once = Once::new();

/// Initialize logging system based on configuration
///
/// Safe to call more than once; only the first call installs the
/// subscriber (later calls are no-ops, which keeps tests independent).
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let base_level = parse_log_level(&config.level)?;

    INIT_ONCE.call_once(|| {
        let console_level = config
            .console_level
            .as_ref()
            .and_then(|s| parse_log_level(s).ok())
            .unwrap_or(base_level);
        let file_level = config
            .file_level
            .as_ref()
            .and_then(|s| parse_log_level(s).ok())
            .unwrap_or(base_level);

        let most_verbose = min_level(console_level, file_level);
        let filter = build_env_filter(most_verbose);

        match config.file.as_deref() {
            Some(file) if !file.is_empty() => {
                init_file_logging(file, config, filter, console_level, file_level);
            }
            _ => init_console_only_logging(filter, config.json_format, console_level),
        }
    });

    Ok(())
}

/// Build the env filter, letting `RUST_LOG` override the configured level
fn build_env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("argus={},warn", level.to_string().to_lowercase())))
}

fn init_console_only_logging(filter: EnvFilter, json_format: bool, console_level: Level) {
    let console_layer = if json_format {
        fmt::layer()
            .json()
            .with_target(false)
            .with_filter(level_filter(console_level))
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_filter(level_filter(console_level))
            .boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .try_init();
}

fn init_file_logging(
    file: &str,
    config: &LoggingConfig,
    filter: EnvFilter,
    console_level: Level,
    file_level: Level,
) {
    let path = Path::new(file);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "argus.log".to_string());

    let appender = rolling::never(dir, file_name);
    let (writer, guard) = non_blocking(appender);
    let _ = LOG_GUARD.set(guard);

    if config.console_output {
        let console_layer = fmt::layer()
            .with_target(false)
            .with_filter(level_filter(console_level))
            .boxed();
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(writer)
            .with_filter(level_filter(file_level))
            .boxed();
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init();
    } else {
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(writer)
            .with_filter(level_filter(file_level))
            .boxed();
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .try_init();
    }
}

fn level_filter(level: Level) -> tracing_subscriber::filter::LevelFilter {
    tracing_subscriber::filter::LevelFilter::from_level(level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
    }

    #[test]
    fn test_init_logging_rejects_bad_level() {
        let config = LoggingConfig {
            level: "LOUD".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }
}
