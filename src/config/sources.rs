use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "STORYRELAY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/storyrelay.toml";
const ENV_PREFIX: &str = "STORYRELAY";
const ENV_SEPARATOR: &str = "__";

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load() -> Result<Config, ConfigError> {
    // Load .env file if it exists (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    let config_path = env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = load_from_sources(config_path)?;
    apply_secrets(&mut config, |name| env::var(name).ok());

    Ok(config)
}

/// Fill secrets from `lookup` (the process environment in production)
///
/// Secrets are never read from TOML files. Empty values count as unset.
pub fn apply_secrets<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

    if let Some(username) = get("IG_USERNAME") {
        config.instagram.username = Some(username);
    }
    if let Some(password) = get("IG_PASSWORD") {
        config.instagram.password = Some(password);
    }
    if let Some(proxy) = get("IG_PROXY") {
        config.instagram.proxy = Some(proxy);
    }
    if let Some(whitelist) = get("IG_WHITELIST") {
        config.instagram.whitelist = whitelist
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(connection) = get("AZURE_STORAGE_CONNECTION_STRING") {
        config.storage.connection_string = Some(connection);
    }
    if let Some(token) = get("IFTTT_TOKEN") {
        config.notify.token = Some(token);
    }
}

/// Load configuration from a specific path and environment
/// Useful for testing with custom config files
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::warn!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // STORYRELAY__SCHEDULE__CRON -> schedule.cron
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}
