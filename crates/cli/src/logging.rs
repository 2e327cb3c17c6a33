//! Logging setup for the CLI
//!
//! Logs go to stderr so that stdout carries only command output
//! (`status --json` stays machine readable).

use std::io;
use tracing_subscriber::{fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is not set (e.g. "info", "debug")
    pub level: String,
    pub json_format: bool,
    pub pretty_print: bool,
    /// Optional directive list, e.g. "tessera_migrate=debug,sqlx=warn"
    pub env_filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            pretty_print: false,
            env_filter: Some("tessera_migrate=info,tessera_cli=info,sqlx=warn".to_string()),
        }
    }
}

impl LoggingConfig {
    /// Configuration derived from the global `--verbose` / `--log-json` flags
    pub fn from_flags(verbose: bool, json: bool) -> Self {
        let mut config = if verbose {
            Self {
                level: "debug".to_string(),
                pretty_print: true,
                env_filter: Some("tessera_migrate=debug,tessera_cli=debug,sqlx=info".to_string()),
                ..Self::default()
            }
        } else {
            Self::default()
        };
        if json {
            config.json_format = true;
            config.pretty_print = false;
        }
        config
    }

    fn directives(&self) -> &str {
        self.env_filter.as_deref().unwrap_or(&self.level)
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the config.
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(config.directives()))?;

    if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(Layer::new().with_writer(io::stderr).json())
            .try_init()?;
    } else if config.pretty_print {
        tracing_subscriber::registry()
            .with(filter)
            .with(Layer::new().with_writer(io::stderr).pretty())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(Layer::new().with_writer(io::stderr).with_target(false))
            .try_init()?;
    }

    tracing::debug!(
        level = %config.level,
        format = if config.json_format { "json" } else { "text" },
        "Logging initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_flags() {
        let quiet = LoggingConfig::from_flags(false, false);
        assert_eq!(quiet, LoggingConfig::default());

        let verbose = LoggingConfig::from_flags(true, false);
        assert_eq!(verbose.level, "debug");
        assert!(verbose.pretty_print);
        assert!(verbose.directives().contains("tessera_migrate=debug"));

        let json = LoggingConfig::from_flags(true, true);
        assert!(json.json_format);
        assert!(!json.pretty_print);
    }

    #[test]
    fn test_directives_fall_back_to_level() {
        let config = LoggingConfig {
            env_filter: None,
            level: "warn".to_string(),
            ..LoggingConfig::default()
        };
        assert_eq!(config.directives(), "warn");
        assert!(EnvFilter::try_new(config.directives()).is_ok());
    }
}
