// src/config/loader.rs

use crate::config::{environment, AppConfig, ConfigValidator};
use crate::error::{AppError, Result};
use std::path::Path;
use tracing::{debug, info};

/// Load configuration from file or environment variables
pub fn load_config(config_path: &Path) -> Result<AppConfig> {
    let mut config = if config_path.exists() {
        info!("Loading configuration from file: {}", config_path.display());
        load_from_file(config_path)?
    } else {
        info!("Configuration file not found, using defaults");
        AppConfig::default()
    };

    // Override with environment variables
    environment::override_with_env(&mut config);

    // Validate the final configuration
    ConfigValidator::validate(&config)?;

    debug!("Configuration loaded and validated successfully");
    Ok(config)
}

fn load_from_file(config_path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(config_path).map_err(|_| AppError::ConfigNotFound {
        path: config_path.display().to_string(),
    })?;

    serde_yaml::from_str(&content).map_err(|e| AppError::ConfigParse {
        message: format!("Failed to parse config file: {e}"),
        line: e.location().map(|loc| loc.line()),
    })
}

/// Reads a key file: one key per line, blank lines and `#` comments skipped.
pub fn read_key_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| AppError::io("read_key_file", &e))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Gathers raw keys from the config list, the key file and the environment,
/// in that order. Trimming and validation happen in the key pool.
pub fn collect_api_keys(config: &AppConfig) -> Result<Vec<String>> {
    let mut keys = config.keys.api_keys.clone();
    let from_config = keys.len();

    let mut from_file = 0;
    if let Some(path) = &config.keys.key_file {
        let file_keys = read_key_file(path)?;
        from_file = file_keys.len();
        keys.extend(file_keys);
    }

    let env_keys = environment::load_api_keys_from_env();
    let from_env = env_keys.len();
    keys.extend(env_keys);

    info!(
        keys.from_config = from_config,
        keys.from_file = from_file,
        keys.from_env = from_env,
        "Collected API key entries"
    );
    Ok(keys)
}
