use super::types::*;
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Load and validate configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(contents: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(contents)?;
    config.global.data_directory = super::expand_tilde(&config.global.data_directory);
    config.global.log_directory = super::expand_tilde(&config.global.log_directory);
    validate_config(&config)?;
    Ok(config)
}

/// Validate the configuration
fn validate_config(config: &Config) -> Result<()> {
    if !config.global.data_directory.is_absolute() {
        return Err(ConfigError::ValidationError(format!(
            "Data directory must be an absolute path: {:?}",
            config.global.data_directory
        )));
    }

    if config.global.restic_binary.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "restic_binary must not be empty".to_string(),
        ));
    }

    if config.schedule.interval_minutes == 0 {
        return Err(ConfigError::ValidationError(
            "schedule.interval_minutes must be at least 1".to_string(),
        ));
    }

    if config.schedule.failure_threshold_hours == 0 {
        return Err(ConfigError::ValidationError(
            "schedule.failure_threshold_hours must be at least 1".to_string(),
        ));
    }

    if config.schedule.poll_interval_ms == 0 {
        return Err(ConfigError::ValidationError(
            "schedule.poll_interval_ms must be at least 1".to_string(),
        ));
    }

    let webhook = &config.notifications.webhook_url;
    if !webhook.is_empty() && !webhook.starts_with("http://") && !webhook.starts_with("https://") {
        return Err(ConfigError::ValidationError(format!(
            "notifications.webhook_url must be an http(s) URL: {}",
            webhook
        )));
    }

    Ok(())
}
