// src/generator/gemini.rs

use super::{CallError, ContentGenerator, GenerationRequest, GenerationResponse};
use crate::config::GeneratorConfig;
use crate::error::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const API_KEY_HEADER: &str = "x-goog-api-key";

/// `generateContent` client for the Gemini REST API.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: Client,
    endpoint: Url,
    model: String,
}

impl GeminiClient {
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let endpoint = Url::parse(&format!(
            "{}/v1beta/models/{}:generateContent",
            config.base_url.trim_end_matches('/'),
            config.model
        ))?;

        info!(endpoint = %endpoint, model = %config.model, "Gemini client configured");
        Ok(Self {
            http,
            endpoint,
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl ContentGenerator for GeminiClient {
    async fn generate(
        &self,
        api_key: &SecretString,
        request: &GenerationRequest,
    ) -> std::result::Result<GenerationResponse, CallError> {
        let body = GenerateContentRequest::from(request);

        let response = self
            .http
            .post(self.endpoint.clone())
            .header(API_KEY_HEADER, api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(classify_transport_error)?;

        if !status.is_success() {
            let error = classify_status(status, &text);
            warn!(status = %status, error = %error, "Gemini call failed");
            return Err(error);
        }

        debug!(status = %status, bytes = text.len(), "Gemini call succeeded");
        parse_success_body(&text)
    }
}

/// Maps a non-success HTTP answer to a [`CallError`].
pub fn classify_status(status: StatusCode, body: &str) -> CallError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let (api_status, message, reasons) = match &parsed {
        Some(envelope) => (
            envelope.error.status.as_deref().unwrap_or_default(),
            envelope.error.message.clone().unwrap_or_default(),
            envelope
                .error
                .details
                .iter()
                .filter_map(|d| d.reason.as_deref())
                .collect::<Vec<_>>(),
        ),
        None => ("", String::new(), Vec::new()),
    };
    let detail = if message.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {message}")
    };

    if status == StatusCode::TOO_MANY_REQUESTS || api_status == "RESOURCE_EXHAUSTED" {
        return CallError::Quota(detail);
    }
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || api_status == "PERMISSION_DENIED"
        || api_status == "UNAUTHENTICATED"
        || reasons.iter().any(|r| *r == "API_KEY_INVALID")
    {
        return CallError::AuthFailure(detail);
    }
    if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        return CallError::Transient(detail);
    }
    CallError::MalformedResponse(detail)
}

fn classify_transport_error(err: reqwest::Error) -> CallError {
    if err.is_decode() {
        CallError::MalformedResponse(err.to_string())
    } else {
        CallError::Transient(err.to_string())
    }
}

fn parse_success_body(body: &str) -> std::result::Result<GenerationResponse, CallError> {
    let parsed: GenerateContentResponse = serde_json::from_str(body)
        .map_err(|e| CallError::MalformedResponse(format!("invalid JSON body: {e}")))?;

    if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(CallError::MalformedResponse(format!("prompt blocked: {reason}")));
    }

    let text: String = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(CallError::MalformedResponse(
            "response contained no candidate text".to_string(),
        ));
    }

    Ok(GenerationResponse {
        text,
        total_tokens: parsed.usage_metadata.and_then(|u| u.total_token_count),
    })
}

// --- Wire types ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

impl<'a> From<&'a GenerationRequest> for GenerateContentRequest<'a> {
    fn from(request: &'a GenerationRequest) -> Self {
        let generation_config = (request.temperature.is_some() || request.max_output_tokens.is_some())
            .then(|| GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_output_tokens,
            });
        Self {
            contents: vec![Content {
                role: "user",
                parts: vec![Part {
                    text: &request.prompt,
                }],
            }],
            generation_config,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    total_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    status: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const INVALID_KEY_BODY: &str = r#"{
        "error": {
            "code": 400,
            "message": "API key not valid. Please pass a valid API key.",
            "status": "INVALID_ARGUMENT",
            "details": [{"@type": "type.googleapis.com/google.rpc.ErrorInfo", "reason": "API_KEY_INVALID"}]
        }
    }"#;

    const EXHAUSTED_BODY: &str = r#"{
        "error": {"code": 429, "message": "Resource has been exhausted (e.g. check quota).", "status": "RESOURCE_EXHAUSTED"}
    }"#;

    #[rstest]
    #[case(StatusCode::TOO_MANY_REQUESTS, EXHAUSTED_BODY, "quota")]
    #[case(StatusCode::TOO_MANY_REQUESTS, "", "quota")]
    #[case(StatusCode::BAD_REQUEST, INVALID_KEY_BODY, "auth")]
    #[case(StatusCode::FORBIDDEN, "", "auth")]
    #[case(StatusCode::UNAUTHORIZED, "not json", "auth")]
    #[case(StatusCode::SERVICE_UNAVAILABLE, "", "transient")]
    #[case(StatusCode::REQUEST_TIMEOUT, "", "transient")]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, "{}", "transient")]
    #[case(StatusCode::NOT_FOUND, "", "malformed")]
    fn classifies_http_failures(#[case] status: StatusCode, #[case] body: &str, #[case] expected: &str) {
        let kind = match classify_status(status, body) {
            CallError::Quota(_) => "quota",
            CallError::AuthFailure(_) => "auth",
            CallError::Transient(_) => "transient",
            CallError::MalformedResponse(_) => "malformed",
        };
        assert_eq!(kind, expected);
    }

    #[test]
    fn classification_keeps_provider_message() {
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, EXHAUSTED_BODY);
        assert!(err.detail().contains("Resource has been exhausted"));
    }

    #[test]
    fn parses_candidate_text_and_usage() {
        let body = r#"{
            "candidates": [{"content": {"parts": [{"text": "{\"questions\":"}, {"text": " []}"}], "role": "model"}}],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 8, "totalTokenCount": 20}
        }"#;
        let response = parse_success_body(body).unwrap();
        assert_eq!(response.text, "{\"questions\": []}");
        assert_eq!(response.total_tokens, Some(20));
    }

    #[rstest]
    #[case("not json")]
    #[case(r#"{"candidates": []}"#)]
    #[case(r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#)]
    fn unusable_success_bodies_are_malformed(#[case] body: &str) {
        assert!(matches!(
            parse_success_body(body),
            Err(CallError::MalformedResponse(_))
        ));
    }

    #[test]
    fn request_body_uses_camel_case_generation_config() {
        let mut request = GenerationRequest::new("Write a mock test");
        request.max_output_tokens = Some(1024);
        let json = serde_json::to_value(GenerateContentRequest::from(&request)).unwrap();

        assert_eq!(json["contents"][0]["parts"][0]["text"], "Write a mock test");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 1024);
        assert!(json["generationConfig"].get("temperature").is_none());
    }
}
