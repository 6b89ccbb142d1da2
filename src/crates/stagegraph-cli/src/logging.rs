//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{CliError, Result};

/// Filter from `RUST_LOG`, falling back to the configured level
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| CliError::Logging(format!("invalid level '{}': {}", config.level, e))),
    }
}

/// Install the global subscriber; logs go to stderr so command output stays clean
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| CliError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_level_is_reported() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "stagegraph_core=loud".to_string(),
            ..Default::default()
        };
        assert!(matches!(env_filter(&config), Err(CliError::Logging(_))));
    }

    #[test]
    fn test_level_directive_accepted() {
        let config = LoggingConfig {
            level: "info,stagegraph_core=debug".to_string(),
            ..Default::default()
        };
        assert!(env_filter(&config).is_ok());
    }
}
