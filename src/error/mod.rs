//! Error handling for the key pool and the job runner
//!
//! Every fallible operation in the crate returns [`Result`], whose error type
//! is [`AppError`]. Pool errors are job-scoped: raising one never poisons the
//! pool, so callers may keep using it for other jobs and keys.

pub mod types;

use crate::generator::CallError;
use thiserror::Error;
use tracing::{error, warn};

/// Main application error type with comprehensive categorization
#[derive(Error, Debug)]
pub enum AppError {
    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String, line: Option<usize> },

    // Key pool
    #[error("Key pool exhausted: every API key is marked failed")]
    PoolExhausted,

    #[error("Job {job_id} was never assigned a key")]
    UnknownJob { job_id: u64 },

    #[error("Invalid job id {job_id}: job ids start at 1")]
    InvalidJobId { job_id: u64 },

    #[error("Key index {index} is out of range for a pool of {pool_size}")]
    UnknownKey { index: usize, pool_size: usize },

    #[error("API key #{index} is marked failed")]
    KeyFailed { index: usize },

    #[error("All healthy API keys are currently leased by other jobs")]
    KeysBusy,

    // Remote generation
    #[error("Job {job_id} failed after {cause}: {source}")]
    JobFailed {
        job_id: u64,
        cause: CallError,
        #[source]
        source: Box<AppError>,
    },

    #[error("Job {job_id} gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        job_id: u64,
        attempts: u32,
        last_error: CallError,
    },

    #[error("Job {job_id} was cancelled")]
    Cancelled { job_id: u64 },

    #[error("{failed} of {total} jobs failed")]
    GenerationIncomplete { failed: usize, total: usize },

    // External service errors
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("IO operation failed: {operation} - {message}")]
    Io { operation: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    /// Create a new configuration validation error
    pub fn config_validation(message: impl Into<String>, field: Option<impl Into<String>>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
            field: field.map(Into::into),
        }
    }

    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Create a new internal error with context
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wraps an IO error with the operation that produced it.
    pub fn io(operation: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// True for errors caused by the state of the key pool rather than by
    /// configuration or the environment.
    pub fn is_pool_error(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted
                | Self::UnknownJob { .. }
                | Self::UnknownKey { .. }
                | Self::KeyFailed { .. }
                | Self::KeysBusy
        )
    }

    /// Short, stable category name used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidConfiguration { .. }
            | Self::ConfigValidation { .. }
            | Self::ConfigNotFound { .. }
            | Self::ConfigParse { .. } => "configuration",
            Self::PoolExhausted
            | Self::UnknownJob { .. }
            | Self::UnknownKey { .. }
            | Self::KeyFailed { .. }
            | Self::KeysBusy => "key_pool",
            Self::InvalidJobId { .. } => "invalid_input",
            Self::JobFailed { .. }
            | Self::RetriesExhausted { .. }
            | Self::GenerationIncomplete { .. } => "generation",
            Self::Cancelled { .. } => "cancelled",
            Self::HttpClient { .. } => "network",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }

    /// Log the error with appropriate level
    pub fn log(&self, job_id: Option<u64>) {
        match self {
            Self::Cancelled { .. } | Self::KeysBusy => {
                warn!(
                    error = %self,
                    job_id = job_id,
                    error_kind = self.kind(),
                    "Job interrupted"
                );
            }
            _ => {
                error!(
                    error = %self,
                    job_id = job_id,
                    error_kind = self.kind(),
                    "Job error occurred"
                );
            }
        }
    }
}

/// Result type alias for the application
pub type Result<T, E = AppError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_categorized() {
        assert!(AppError::PoolExhausted.is_pool_error());
        assert!(AppError::UnknownJob { job_id: 7 }.is_pool_error());
        assert!(AppError::KeysBusy.is_pool_error());
        assert!(!AppError::invalid_configuration("no keys").is_pool_error());
        assert_eq!(AppError::PoolExhausted.kind(), "key_pool");
    }

    #[test]
    fn invalid_job_id_is_not_a_pool_error() {
        let err = AppError::InvalidJobId { job_id: 0 };
        assert!(!err.is_pool_error());
        assert_eq!(err.kind(), "invalid_input");
        assert!(err.to_string().contains("start at 1"));
    }

    #[test]
    fn job_failure_preserves_underlying_cause() {
        let err = AppError::JobFailed {
            job_id: 3,
            cause: CallError::Quota("429 Too Many Requests".to_string()),
            source: Box::new(AppError::PoolExhausted),
        };

        let message = err.to_string();
        assert!(message.contains("job 3") || message.contains("Job 3"));
        assert!(message.contains("429"));
        assert!(message.contains("exhausted"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
