//! Text generation capability.
//!
//! The engine only relies on one property of generated text: that the first
//! well-formed JSON object or array can be pulled out of it. Everything else
//! about the output is treated as untrusted.

use crate::config::GenerationConfig;
use crate::error::GenerationError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// A prompt-in, text-out generation backend.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;

    fn model_name(&self) -> &str;
}

/// Google Gemini `generateContent` backend.
pub struct GeminiGenerator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
    timeout_secs: u64,
}

impl GeminiGenerator {
    /// Build from configuration, reading the API key from `config.api_key_env`.
    pub fn new(config: &GenerationConfig) -> Result<Self, GenerationError> {
        let api_key =
            std::env::var(&config.api_key_env).map_err(|_| GenerationError::AuthFailed {
                provider: format!("Gemini (env var '{}' not set)", config.api_key_env),
            })?;
        Self::new_with_key(config, api_key)
    }

    pub fn new_with_key(
        config: &GenerationConfig,
        api_key: String,
    ) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GenerationError::Connection {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            timeout_secs: config.timeout_secs,
        })
    }

    fn build_request_body(&self, prompt: &str) -> Value {
        serde_json::json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_output_tokens,
            },
        })
    }

    /// Concatenate the text parts of the first candidate.
    fn parse_response(body: &Value) -> Result<String, GenerationError> {
        let parts = body["candidates"][0]["content"]["parts"]
            .as_array()
            .ok_or_else(|| GenerationError::ResponseParse {
                message: "Missing 'candidates[0].content.parts' in response".to_string(),
            })?;

        let text: String = parts
            .iter()
            .filter_map(|part| part["text"].as_str())
            .collect();

        if text.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(text)
    }

    fn map_http_error(status: reqwest::StatusCode, body: &str) -> GenerationError {
        match status.as_u16() {
            401 | 403 => GenerationError::AuthFailed {
                provider: "Gemini".to_string(),
            },
            _ => GenerationError::ApiRequest {
                message: format!("HTTP {}: {}", status, body),
            },
        }
    }
}

#[async_trait]
impl Generator for GeminiGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        debug!(model = self.model.as_str(), "Sending Gemini generation request");

        let response = self
            .client
            .post(&url)
            .json(&self.build_request_body(prompt))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::Timeout {
                        timeout_secs: self.timeout_secs,
                    }
                } else {
                    GenerationError::ApiRequest {
                        message: format!("Request to Gemini API failed: {}", e),
                    }
                }
            })?;

        let status = response.status();
        let body_text = response
            .text()
            .await
            .map_err(|e| GenerationError::ResponseParse {
                message: format!("Failed to read response body: {}", e),
            })?;

        if !status.is_success() {
            warn!(status = %status, "Gemini returned an error status");
            return Err(Self::map_http_error(status, &body_text));
        }

        let json: Value =
            serde_json::from_str(&body_text).map_err(|e| GenerationError::ResponseParse {
                message: format!("Invalid JSON in response: {}", e),
            })?;
        Self::parse_response(&json)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Scripted generator for tests and offline runs.
///
/// Queued results are returned in order; once the queue is drained every call
/// fails, which exercises the fallback paths. An optional delay holds each
/// call open so overlapping calls can be observed.
#[derive(Default)]
pub struct MockGenerator {
    responses: Mutex<VecDeque<Result<String, GenerationError>>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A generator that returns `text` for the next `times` calls.
    pub fn repeating(text: &str, times: usize) -> Self {
        let mock = Self::new();
        for _ in 0..times {
            mock.queue_text(text);
        }
        mock
    }

    pub fn queue_text(&self, text: impl Into<String>) {
        self.lock().push_back(Ok(text.into()));
    }

    pub fn queue_error(&self, error: GenerationError) {
        self.lock().push_back(Err(error));
    }

    /// Sleep for `delay` inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most calls that were ever running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, GenerationError>>> {
        self.responses.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(active, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.lock().pop_front().unwrap_or(Err(GenerationError::EmptyResponse))
    }

    fn model_name(&self) -> &str {
        "mock-generator"
    }
}

/// Run `generate` under a deadline; an elapsed deadline is a generation failure.
pub async fn generate_with_timeout(
    generator: &dyn Generator,
    prompt: &str,
    timeout: Duration,
) -> Result<String, GenerationError> {
    match tokio::time::timeout(timeout, generator.generate(prompt)).await {
        Ok(result) => result,
        Err(_) => Err(GenerationError::Timeout {
            timeout_secs: timeout.as_secs(),
        }),
    }
}

/// The first well-formed JSON object embedded in `text`.
pub fn extract_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    first_json_value(text, '{').and_then(|v| match v {
        Value::Object(map) => Some(map),
        _ => None,
    })
}

/// The first well-formed JSON array embedded in `text`.
pub fn extract_json_array(text: &str) -> Option<Vec<Value>> {
    first_json_value(text, '[').and_then(|v| match v {
        Value::Array(items) => Some(items),
        _ => None,
    })
}

/// Try every `open` position in turn until one starts a complete value.
fn first_json_value(text: &str, open: char) -> Option<Value> {
    text.match_indices(open).find_map(|(idx, _)| {
        serde_json::Deserializer::from_str(&text[idx..])
            .into_iter::<Value>()
            .next()
            .and_then(Result::ok)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_object_with_surrounding_prose() {
        let text = "Sure! Here you go:\n```json\n{\"response\": \"ok\", \"confidence\": 0.9}\n```\nStay safe.";
        let obj = extract_json_object(text).unwrap();
        assert_eq!(obj["response"], "ok");
    }

    #[test]
    fn test_extract_skips_broken_prefix() {
        let text = "{not json} then {\"a\": 1}";
        let obj = extract_json_object(text).unwrap();
        assert_eq!(obj["a"], 1);
    }

    #[test]
    fn test_extract_array() {
        let text = "Plan: [{\"step_number\": 1, \"action\": \"go\"}] done";
        let arr = extract_json_array(text).unwrap();
        assert_eq!(arr.len(), 1);
    }

    #[test]
    fn test_extract_none_for_plain_text() {
        assert!(extract_json_object("no structure here").is_none());
        assert!(extract_json_array("[unterminated").is_none());
    }

    #[test]
    fn test_parse_gemini_response() {
        let body = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "Hello "}, {"text": "world"}]}}]
        });
        assert_eq!(GeminiGenerator::parse_response(&body).unwrap(), "Hello world");
    }

    #[test]
    fn test_parse_gemini_empty() {
        let body = serde_json::json!({"candidates": [{"content": {"parts": []}}]});
        assert!(matches!(
            GeminiGenerator::parse_response(&body),
            Err(GenerationError::EmptyResponse)
        ));
        assert!(GeminiGenerator::parse_response(&serde_json::json!({})).is_err());
    }

    #[tokio::test]
    async fn test_mock_generator_queue() {
        let mock = MockGenerator::new();
        mock.queue_text("first");
        mock.queue_error(GenerationError::EmptyResponse);
        assert_eq!(mock.generate("p").await.unwrap(), "first");
        assert!(mock.generate("p").await.is_err());
        assert!(mock.generate("p").await.is_err());
        assert_eq!(mock.call_count(), 3);
    }

    struct StallingGenerator;

    #[async_trait]
    impl Generator for StallingGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }

        fn model_name(&self) -> &str {
            "stall"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_generate_with_timeout_elapses() {
        let result =
            generate_with_timeout(&StallingGenerator, "p", Duration::from_secs(5)).await;
        assert!(matches!(
            result,
            Err(GenerationError::Timeout { timeout_secs: 5 })
        ));
    }
}
