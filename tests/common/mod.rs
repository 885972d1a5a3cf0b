//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use gemini_keypool::generator::{CallError, ContentGenerator, GenerationRequest, GenerationResponse};
use gemini_keypool::key_pool::{JobId, KeyPool, PoolOptions};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A syntactically plausible key, unique per `n`.
pub fn test_key(n: usize) -> String {
    format!("AIzaSyTestPoolKey{n:03}-abcdefghij")
}

pub fn test_keys(count: usize) -> Vec<String> {
    (0..count).map(test_key).collect()
}

pub fn pool(count: usize) -> KeyPool {
    KeyPool::new(test_keys(count), PoolOptions::default()).expect("test pool")
}

pub fn pool_with_capacity(count: usize, tokens_per_minute: u64) -> KeyPool {
    let options = PoolOptions {
        tokens_per_minute,
        ..PoolOptions::default()
    };
    KeyPool::new(test_keys(count), options).expect("test pool")
}

pub fn job(id: u64) -> JobId {
    JobId::new(id).expect("job ids in tests are positive")
}

pub fn ok_response(text: &str) -> Result<GenerationResponse, CallError> {
    Ok(GenerationResponse {
        text: text.to_string(),
        total_tokens: Some(100),
    })
}

/// Generator whose answers are scripted per API key.
///
/// Each key has a queue of outcomes; once the queue is empty the key
/// answers with `"generated by <key>"`. Every call is recorded.
#[derive(Default)]
pub struct ScriptedGenerator {
    scripts: Mutex<HashMap<String, VecDeque<Result<GenerationResponse, CallError>>>>,
    always: Mutex<HashMap<String, CallError>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call takes `delay` of (tokio) time.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn push(&self, key: &str, outcome: Result<GenerationResponse, CallError>) -> &Self {
        self.scripts
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    /// The key fails with `error` on every call.
    pub fn always_fail(&self, key: &str, error: CallError) -> &Self {
        self.always.lock().insert(key.to_string(), error);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_with(&self, key: &str) -> usize {
        self.calls.lock().iter().filter(|k| k.as_str() == key).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        api_key: &SecretString,
        _request: &GenerationRequest,
    ) -> Result<GenerationResponse, CallError> {
        let key = api_key.expose_secret().clone();
        self.calls.lock().push(key.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = self.always.lock().get(&key) {
            return Err(error.clone());
        }
        let scripted = self.scripts.lock().get_mut(&key).and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| ok_response(&format!("generated by {key}")))
    }
}

/// Generator that never answers; used to exercise cancellation.
pub struct HangingGenerator;

#[async_trait]
impl ContentGenerator for HangingGenerator {
    async fn generate(
        &self,
        _api_key: &SecretString,
        _request: &GenerationRequest,
    ) -> Result<GenerationResponse, CallError> {
        std::future::pending().await
    }
}

pub fn shared(generator: ScriptedGenerator) -> Arc<ScriptedGenerator> {
    Arc::new(generator)
}
