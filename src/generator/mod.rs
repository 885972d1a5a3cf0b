// src/generator/mod.rs

//! The remote content-generation call, as seen by the job runner.
//!
//! Implementations classify their own failures into [`CallError`] so the
//! runner and the key pool never inspect provider-specific error text.

pub mod gemini;

pub use gemini::GeminiClient;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome class of a failed remote call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The key ran out of quota or was rate limited.
    #[error("quota exhausted: {0}")]
    Quota(String),
    /// The key was rejected by the provider.
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    /// Network trouble or a server-side hiccup; retry with the same key.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The provider answered, but not with usable content.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl CallError {
    /// Quota and auth failures are attributed to the key and reported to
    /// the pool; the others are retried without touching pool state.
    pub fn is_key_failure(&self) -> bool {
        matches!(self, Self::Quota(_) | Self::AuthFailure(_))
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::Quota(d) | Self::AuthFailure(d) | Self::Transient(d) | Self::MalformedResponse(d) => d,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: None,
            max_output_tokens: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
    /// Tokens billed for the call, when the provider reports it.
    pub total_tokens: Option<u64>,
}

/// A single remote "generate content" call made with one API key.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(
        &self,
        api_key: &SecretString,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, CallError>;
}
