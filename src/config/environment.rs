//! Environment-based configuration management

use crate::config::AppConfig;
use std::env;
use tracing::{info, warn};

pub const MODEL_VAR: &str = "GEMINI_KEYPOOL_MODEL";
pub const MAX_CONCURRENT_JOBS_VAR: &str = "GEMINI_KEYPOOL_MAX_CONCURRENT_JOBS";
pub const TOKENS_PER_MINUTE_VAR: &str = "GEMINI_KEYPOOL_TOKENS_PER_MINUTE";

/// Load API keys from environment variables
/// Supports patterns like GEMINI_API_KEY_1, GEMINI_API_KEY_2, etc.
pub fn load_api_keys_from_env() -> Vec<String> {
    let mut keys = Vec::new();
    let mut index = 1;

    // Try numbered keys first
    while let Ok(key) = env::var(format!("GEMINI_API_KEY_{index}")) {
        if !key.trim().is_empty() {
            keys.push(key.trim().to_string());
        }
        index += 1;
    }

    // Also check for a single GEMINI_API_KEY
    if keys.is_empty() {
        if let Ok(key) = env::var("GEMINI_API_KEY") {
            if !key.trim().is_empty() {
                keys.push(key.trim().to_string());
            }
        }
    }

    // Check for comma-separated keys in GEMINI_API_KEYS
    if keys.is_empty() {
        if let Ok(keys_str) = env::var("GEMINI_API_KEYS") {
            keys.extend(
                keys_str
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
            );
        }
    }

    keys
}

/// Applies `GEMINI_KEYPOOL_*` overrides on top of the file configuration.
pub fn override_with_env(config: &mut AppConfig) {
    if let Ok(model) = env::var(MODEL_VAR) {
        if !model.trim().is_empty() {
            info!(model = %model, "Overriding model from environment variable");
            config.generator.model = model.trim().to_string();
        }
    }

    if let Ok(raw) = env::var(MAX_CONCURRENT_JOBS_VAR) {
        match raw.parse::<usize>() {
            Ok(jobs) => {
                info!(max_concurrent_jobs = jobs, "Overriding job concurrency from environment variable");
                config.runner.max_concurrent_jobs = jobs;
            }
            Err(_) => warn!(value = %raw, "Invalid {MAX_CONCURRENT_JOBS_VAR} environment variable"),
        }
    }

    if let Ok(raw) = env::var(TOKENS_PER_MINUTE_VAR) {
        match raw.parse::<u64>() {
            Ok(tpm) => {
                info!(tokens_per_minute = tpm, "Overriding per-key token budget from environment variable");
                config.pool.tokens_per_minute = tpm;
            }
            Err(_) => warn!(value = %raw, "Invalid {TOKENS_PER_MINUTE_VAR} environment variable"),
        }
    }
}
