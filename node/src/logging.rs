//! # Structured Logging
//!
//! Sets up the global `tracing` subscriber from the `logging` section of the
//! node configuration. `RUST_LOG`, when set, replaces the configured filter.
//! Everything is written to stderr; `init` and `version` print to stdout.

use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_FILTER: &str = "marketpulse_node=info,marketpulse_engine=info,tower_http=info";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Colored, with file and line of each event.
    #[default]
    Pretty,
    /// One JSON object per line, for log shippers.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `marketpulse_engine=debug,info`.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    /// Parses the configured directives. Vault and manager logs are
    /// useless without the engine target, so an empty filter is refused.
    pub fn env_filter(&self) -> Result<EnvFilter> {
        if self.filter.trim().is_empty() {
            return Err(anyhow!("logging.filter must not be empty"));
        }
        EnvFilter::try_new(&self.filter)
            .with_context(|| format!("invalid logging.filter {:?}", self.filter))
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => config.env_filter()?,
    };
    let registry = tracing_subscriber::registry().with(env_filter);

    match config.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(false),
            )
            .try_init(),
    }
    .context("tracing subscriber already installed")?;

    tracing::debug!(format = ?config.format, filter = %config.filter, "logging ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_parses() {
        assert!(LoggingConfig::default().env_filter().is_ok());
    }

    #[test]
    fn bad_filter_is_reported() {
        for filter in ["", "  ", "marketpulse_engine=loud"] {
            let config = LoggingConfig {
                filter: filter.to_string(),
                ..LoggingConfig::default()
            };
            assert!(config.env_filter().is_err(), "accepted {:?}", filter);
        }
    }

    #[test]
    fn format_reads_lowercase() {
        let config: LoggingConfig =
            serde_json::from_str(r#"{ "format": "json" }"#).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.filter, DEFAULT_FILTER);
    }
}
