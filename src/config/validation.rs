// src/config/validation.rs

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use tracing::{debug, warn};
use url::Url;

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &AppConfig) -> Result<()> {
        debug!("Starting configuration validation");

        if let Err(e) = Self::validate_pool_config(config) {
            warn!("Pool config validation failed: {}", e);
            return Err(e);
        }
        debug!("Pool config validation passed");

        if let Err(e) = Self::validate_retry_config(config) {
            warn!("Retry config validation failed: {}", e);
            return Err(e);
        }
        debug!("Retry config validation passed");

        if let Err(e) = Self::validate_generator_config(config) {
            warn!("Generator config validation failed: {}", e);
            return Err(e);
        }
        debug!("Generator config validation passed");

        if config.runner.max_concurrent_jobs == 0 {
            return Err(AppError::config_validation(
                "At least one job must be allowed to run",
                Some("runner.max_concurrent_jobs"),
            ));
        }

        debug!("Configuration validation completed successfully");
        Ok(())
    }

    fn validate_pool_config(config: &AppConfig) -> Result<()> {
        if config.keys.min_key_length == 0 {
            return Err(AppError::config_validation(
                "Minimum key length cannot be 0",
                Some("keys.min_key_length"),
            ));
        }

        if config.pool.tokens_per_minute == 0 {
            return Err(AppError::config_validation(
                "Per-key token budget cannot be 0",
                Some("pool.tokens_per_minute"),
            ));
        }

        Ok(())
    }

    fn validate_retry_config(config: &AppConfig) -> Result<()> {
        let retry = &config.retry;
        if retry.max_attempts == 0 {
            return Err(AppError::config_validation(
                "Retry policy needs at least one attempt",
                Some("retry.max_attempts"),
            ));
        }

        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(AppError::config_validation(
                format!(
                    "Base delay ({} ms) exceeds max delay ({} ms)",
                    retry.base_delay_ms, retry.max_delay_ms
                ),
                Some("retry.base_delay_ms"),
            ));
        }

        Ok(())
    }

    fn validate_generator_config(config: &AppConfig) -> Result<()> {
        let generator = &config.generator;
        Self::validate_url(&generator.base_url, "generator.base_url")?;

        if generator.model.trim().is_empty() {
            return Err(AppError::config_validation(
                "Model name cannot be empty",
                Some("generator.model"),
            ));
        }

        if generator.connect_timeout_secs == 0 {
            return Err(AppError::config_validation(
                "Connect timeout cannot be 0",
                Some("generator.connect_timeout_secs"),
            ));
        }

        if generator.request_timeout_secs == 0 {
            return Err(AppError::config_validation(
                "Request timeout cannot be 0",
                Some("generator.request_timeout_secs"),
            ));
        }

        Ok(())
    }

    fn validate_url(url_str: &str, field_name: &str) -> Result<()> {
        let url = Url::parse(url_str).map_err(|e| {
            AppError::config_validation(
                format!("Invalid URL in {field_name}: {url_str} - {e}"),
                Some(field_name),
            )
        })?;

        match url.scheme() {
            "http" | "https" => Ok(()),
            scheme => Err(AppError::config_validation(
                format!("Unsupported scheme '{scheme}' in {field_name}. Supported: http, https"),
                Some(field_name),
            )),
        }
    }
}
