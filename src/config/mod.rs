// src/config/mod.rs

pub mod app;
pub mod environment;
pub mod loader;
pub mod validation;

pub use app::{AppConfig, GeneratorConfig, KeysConfig, PoolConfig, QuotaPolicy, RetryConfig, RunnerConfig};
pub use loader::{collect_api_keys, load_config, read_key_file};
pub use validation::ConfigValidator;
