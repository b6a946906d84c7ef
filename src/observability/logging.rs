//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. `RUST_LOG` wins over the configured
//! level when it is set, so a single module can be turned up without editing the
//! configuration file.

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::LoggingConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// Output format of the log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn parse(raw: &str) -> GatewayResult<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" => Ok(Self::Text),
            other => Err(GatewayError::config(format!(
                "Unknown log format '{}', expected json or text",
                other
            ))),
        }
    }
}

/// Parse a level name; unknown names are a configuration error
pub fn parse_level(raw: &str) -> GatewayResult<Level> {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(GatewayError::config(format!("Unknown log level '{}'", other))),
    }
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

/// Install the global subscriber described by `config`.
///
/// Returns `false` when a subscriber was already installed (tests, embedding).
pub fn init_logging(config: &LoggingConfig) -> GatewayResult<bool> {
    let level = parse_level(&config.level)?;
    let format = LogFormat::parse(&config.format)?;

    let installed = match format {
        LogFormat::Json => Registry::default()
            .with(env_filter(level))
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
            .is_ok(),
        LogFormat::Text => Registry::default()
            .with(env_filter(level))
            .with(fmt::layer().with_target(true))
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(level = %level, log_format = ?format, "Structured logging initialized");
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_and_format_parsing() {
        assert_eq!(parse_level("INFO").unwrap(), Level::INFO);
        assert_eq!(parse_level("warning").unwrap(), Level::WARN);
        assert!(parse_level("loud").is_err());

        assert_eq!(LogFormat::parse("json").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::parse("Text").unwrap(), LogFormat::Text);
        assert!(LogFormat::parse("xml").is_err());
    }

    #[test]
    fn test_init_rejects_bad_config() {
        let config = LoggingConfig {
            level: "chatty".to_string(),
            format: "json".to_string(),
        };
        assert!(init_logging(&config).is_err());
    }
}
