//! Configuration management for storyrelay
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use storyrelay::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Fetching on: {} ({})", config.schedule.cron, config.schedule.timezone);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `STORYRELAY__<section>__<key>`
//!
//! Examples:
//! - `STORYRELAY__SERVER__BIND_ADDR=0.0.0.0:9000`
//! - `STORYRELAY__SCHEDULE__CRON="0 8 * * *"`
//! - `STORYRELAY__BROKER__PATH=/var/lib/storyrelay/queue`
//!
//! Secrets come only from plain environment variables: `IG_USERNAME`,
//! `IG_PASSWORD`, `IG_PROXY`, `IG_WHITELIST` (comma-separated),
//! `AZURE_STORAGE_CONNECTION_STRING` and `IFTTT_TOKEN`.
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/storyrelay.toml`.
//! This can be overridden using the `STORYRELAY_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

// Re-export public types
pub use models::{
    BrokerSettings, Config, DownloadConfig, InstagramSettings, NotifyConfig, ScheduleConfig,
    ServerConfig, StagePolicy, StagesConfig, StorageConfig,
};
pub use sources::apply_secrets;
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Failed to render configuration: {0}")]
    RenderError(#[from] toml::ser::Error),
}

impl Config {
    /// Load configuration from all sources (file + environment + secrets)
    ///
    /// Configuration is loaded with the following priority (highest to lowest):
    /// 1. Environment variables (`STORYRELAY__*`)
    /// 2. TOML file (default: `config/storyrelay.toml`)
    /// 3. Default values
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file is malformed
    /// - Validation fails (bad cron/timezone, zero attempts, etc.)
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path, without secrets
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Effective configuration as TOML; secrets are never included
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_full_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[server]
bind_addr = "127.0.0.1:9000"

[broker]
path = "/tmp/queue"
backoff_base_secs = 10

[schedule]
enabled = false
cron = "0 */6 * * *"
timezone = "Europe/Berlin"

[stages.fetch]
max_attempts = 2
timeout_secs = 60
concurrency = 8

[download]
root = "/srv/stories"

[instagram]
whitelist = ["alice"]

[storage]
container = "stories"

[notify]
channel = "ops"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(config.server.bind_addr.port(), 9000);
        assert_eq!(config.broker.broker_config().backoff_base.as_secs(), 10);
        assert!(!config.schedule.enabled);
        assert_eq!(config.stages.fetch.job_options().max_attempts, 2);
        assert_eq!(config.download.root.to_str(), Some("/srv/stories"));
        assert_eq!(config.storage.container, "stories");
        assert_eq!(config.notify.channel, "ops");
    }

    #[test]
    fn test_validation_rejects_bad_timezone() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");
        fs::write(&config_path, "[schedule]\ntimezone = \"Mars/Base\"\n").unwrap();

        let result = Config::load_from_path(config_path);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(ValidationError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn test_rendered_toml_omits_secrets() {
        let mut config = Config::default();
        config.instagram.password = Some("hunter2".into());
        config.storage.connection_string = Some("AccountKey=secret".into());
        config.notify.token = Some("tok".into());

        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[schedule]"));
        assert!(rendered.contains("15 10 * * *"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("tok\""));
    }
}
