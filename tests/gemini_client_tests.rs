// tests/gemini_client_tests.rs

use gemini_keypool::config::{AppConfig, GeneratorConfig};
use gemini_keypool::generator::{CallError, ContentGenerator, GeminiClient, GenerationRequest};
use gemini_keypool::key_pool::{JobId, KeyPool, KeyStatus};
use gemini_keypool::generate_mock_tests;
use secrecy::SecretString;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const GOOD_KEY: &str = "AIzaSyWireMockGoodKey-000001";
const EXHAUSTED_KEY: &str = "AIzaSyWireMockQuotaKey-00002";
const ENDPOINT: &str = "/v1beta/models/gemini-2.0-flash:generateContent";

fn generator_config(server: &MockServer) -> GeneratorConfig {
    GeneratorConfig {
        base_url: server.uri(),
        request_timeout_secs: 5,
        ..GeneratorConfig::default()
    }
}

fn success_body(text: &str) -> serde_json::Value {
    json!({
        "candidates": [{"content": {"role": "model", "parts": [{"text": text}]}, "finishReason": "STOP"}],
        "usageMetadata": {"promptTokenCount": 40, "candidatesTokenCount": 200, "totalTokenCount": 240}
    })
}

fn secret(key: &str) -> SecretString {
    SecretString::new(key.to_string())
}

#[tokio::test]
async fn sends_key_header_and_parses_the_answer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .and(header("x-goog-api-key", GOOD_KEY))
        .and(body_partial_json(json!({
            "contents": [{"role": "user", "parts": [{"text": "Write a mock test"}]}],
            "generationConfig": {"maxOutputTokens": 2048}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body("Q1. What is entropy?")))
        .expect(1)
        .mount(&server)
        .await;

    let client = GeminiClient::new(&generator_config(&server)).unwrap();
    let mut request = GenerationRequest::new("Write a mock test");
    request.max_output_tokens = Some(2048);

    let response = client.generate(&secret(GOOD_KEY), &request).await.unwrap();
    assert_eq!(response.text, "Q1. What is entropy?");
    assert_eq!(response.total_tokens, Some(240));
}

#[tokio::test]
async fn http_failures_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("x-goog-api-key", "AIzaSyStatus429-0000000001"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"code": 429, "message": "Resource has been exhausted", "status": "RESOURCE_EXHAUSTED"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("x-goog-api-key", "AIzaSyStatus400-0000000001"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "code": 400,
                "message": "API key not valid. Please pass a valid API key.",
                "status": "INVALID_ARGUMENT",
                "details": [{"reason": "API_KEY_INVALID"}]
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("x-goog-api-key", "AIzaSyStatus503-0000000001"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("x-goog-api-key", "AIzaSyStatus200-0000000001"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .mount(&server)
        .await;

    let client = GeminiClient::new(&generator_config(&server)).unwrap();
    let request = GenerationRequest::new("prompt");

    let quota = client.generate(&secret("AIzaSyStatus429-0000000001"), &request).await;
    assert!(matches!(quota, Err(CallError::Quota(_))));

    let auth = client.generate(&secret("AIzaSyStatus400-0000000001"), &request).await;
    assert!(matches!(auth, Err(CallError::AuthFailure(_))));

    let transient = client.generate(&secret("AIzaSyStatus503-0000000001"), &request).await;
    assert!(matches!(transient, Err(CallError::Transient(_))));

    let malformed = client.generate(&secret("AIzaSyStatus200-0000000001"), &request).await;
    assert!(matches!(malformed, Err(CallError::MalformedResponse(_))));
}

#[tokio::test]
async fn unreachable_server_is_transient() {
    let config = GeneratorConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        connect_timeout_secs: 1,
        request_timeout_secs: 1,
        ..GeneratorConfig::default()
    };
    let client = GeminiClient::new(&config).unwrap();

    let result = client
        .generate(&secret(GOOD_KEY), &GenerationRequest::new("prompt"))
        .await;
    assert!(matches!(result, Err(CallError::Transient(_))));
}

#[tokio::test]
async fn generation_run_fails_over_and_writes_mock_tests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .and(header("x-goog-api-key", EXHAUSTED_KEY))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED"}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .and(header("x-goog-api-key", GOOD_KEY))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body("mock test body")))
        .expect(3)
        .mount(&server)
        .await;

    let mut config = AppConfig::default();
    config.generator = generator_config(&server);
    config.retry.jitter = false;
    config.retry.base_delay_ms = 10;
    config.runner.max_concurrent_jobs = 1;

    let pool = Arc::new(KeyPool::new([EXHAUSTED_KEY, GOOD_KEY], config.pool_options()).unwrap());
    let generator = Arc::new(GeminiClient::new(&config.generator).unwrap());
    let output = TempDir::new().unwrap();
    let jobs: Vec<JobId> = (1..=3).filter_map(JobId::new).collect();

    let report = generate_mock_tests(
        &config,
        Arc::clone(&pool),
        generator,
        "Write a mock test".to_string(),
        jobs,
        output.path(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.failed(), 0);
    assert_eq!(report.written.len(), 3);
    for id in 1..=3 {
        let file = output.path().join(format!("mock_test_{id}.txt"));
        assert_eq!(std::fs::read_to_string(file).unwrap(), "mock test body");
    }
    assert_eq!(pool.status(0).unwrap(), KeyStatus::Failed);
    assert_eq!(report.stats.failed_keys, 1);
    assert_eq!(report.stats.keys[1].calls, 3);
}
