// src/config/app.rs

use crate::key_pool::{PoolOptions, DEFAULT_MIN_KEY_LENGTH, DEFAULT_TOKENS_PER_MINUTE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Deserialize, Clone, PartialEq, Serialize)]
pub struct KeysConfig {
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Optional file with one key per line; `#` starts a comment.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default = "default_min_key_length")]
    pub min_key_length: usize,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            key_file: None,
            min_key_length: default_min_key_length(),
        }
    }
}

// Keys never reach logs, not even through `{:?}`.
impl fmt::Debug for KeysConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeysConfig")
            .field("api_keys", &format_args!("[{} redacted]", self.api_keys.len()))
            .field("key_file", &self.key_file)
            .field("min_key_length", &self.min_key_length)
            .finish()
    }
}

/// What a quota error does to the key that raised it.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPolicy {
    /// The key is marked failed for the rest of the run.
    #[default]
    Permanent,
    /// The key sits out until its one-minute window resets.
    Windowed,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct PoolConfig {
    #[serde(default = "default_tokens_per_minute")]
    pub tokens_per_minute: u64,
    #[serde(default)]
    pub quota_policy: QuotaPolicy,
    /// Lease keys so no two in-flight jobs share one.
    #[serde(default = "default_true")]
    pub exclusive_leases: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            tokens_per_minute: default_tokens_per_minute(),
            quota_policy: QuotaPolicy::default(),
            exclusive_leases: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            temperature: None,
            max_output_tokens: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct RunnerConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

impl AppConfig {
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            min_key_length: self.keys.min_key_length,
            tokens_per_minute: self.pool.tokens_per_minute,
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_min_key_length() -> usize {
    DEFAULT_MIN_KEY_LENGTH
}

fn default_tokens_per_minute() -> u64 {
    DEFAULT_TOKENS_PER_MINUTE
}

fn default_max_attempts() -> u32 {
    6
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    180
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}
