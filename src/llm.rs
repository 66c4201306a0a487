//! Chat-completion backends.
//!
//! Defines the [`CompletionBackend`] trait and concrete implementations:
//! - **[`DisabledBackend`]**: always fails; used when no LLM is configured.
//! - **[`OpenAiBackend`]**: any OpenAI-compatible `/v1/chat/completions` endpoint.
//! - **[`OllamaBackend`]**: a local Ollama instance's `/api/chat` endpoint.
//!
//! A backend performs exactly one request per call. Retrying, model
//! fallback and concurrency live one layer up, in
//! [`crate::completion::CompletionClient`].
//!
//! # Provider Selection
//!
//! ```rust,no_run
//! # use case_digest::config::LlmConfig;
//! # use case_digest::llm::create_backend;
//! let config = LlmConfig::default(); // provider = "disabled"
//! let backend = create_backend(&config).unwrap();
//! assert_eq!(backend.name(), "disabled");
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::CompletionError;

/// One chat message (`system` or `user`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// A single completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(
        model: &str,
        system_prompt: &str,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            max_tokens,
            temperature,
        }
    }

    /// The user prompt.
    pub fn prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// The parts of a completion response the pipeline uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResponse {
    /// Generated text; may be empty.
    pub message: String,
    /// Prompt plus completion tokens billed for this call.
    pub total_tokens: u64,
}

/// A remote (or local) chat-completion service.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Short backend identifier used in logs.
    fn name(&self) -> &str;

    /// Issue one request and wait for its response.
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError>;
}

// ============ Disabled Backend ============

/// Backend used when `llm.provider = "disabled"`. Every call fails.
pub struct DisabledBackend;

#[async_trait]
impl CompletionBackend for DisabledBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn complete(
        &self,
        _request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        Err(CompletionError::Request(
            "LLM provider is disabled. Set [llm] provider in config.".to_string(),
        ))
    }
}

// ============ OpenAI-compatible Backend ============

/// Backend for OpenAI-compatible chat completion APIs.
///
/// Calls `POST {url}/v1/chat/completions` with a bearer key read from the
/// environment variable named by `llm.api_key_env`.
pub struct OpenAiBackend {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl OpenAiBackend {
    /// # Errors
    ///
    /// Returns an error if the API key variable is not set or the HTTP
    /// client cannot be built.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await
            .map_err(|e| CompletionError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(CompletionError::Request(format!(
                "OpenAI API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CompletionError::Malformed(e.to_string()))?;
        parse_openai_response(&json)
    }
}

/// Extract `choices[0]` text and `usage.total_tokens`.
///
/// Accepts both `message.content` and the flat `messages` string some
/// gateways return. A choice without text yields an empty message.
pub fn parse_openai_response(
    json: &serde_json::Value,
) -> Result<CompletionResponse, CompletionError> {
    let choice = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| CompletionError::Malformed("missing choices array".to_string()))?;

    let message = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .or_else(|| choice.get("messages").and_then(|m| m.as_str()))
        .unwrap_or("")
        .to_string();

    let total_tokens = json
        .get("usage")
        .and_then(|u| u.get("total_tokens"))
        .and_then(|t| t.as_u64())
        .unwrap_or(0);

    Ok(CompletionResponse {
        message,
        total_tokens,
    })
}

// ============ Ollama Backend ============

/// Backend for a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaBackend {
    client: reqwest::Client,
    url: String,
}

impl OllamaBackend {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CompletionBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        let body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                CompletionError::Request(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(CompletionError::Request(format!(
                "Ollama API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CompletionError::Malformed(e.to_string()))?;
        parse_ollama_response(&json)
    }
}

pub fn parse_ollama_response(
    json: &serde_json::Value,
) -> Result<CompletionResponse, CompletionError> {
    let message = json
        .get("message")
        .ok_or_else(|| CompletionError::Malformed("missing message object".to_string()))?
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();

    let prompt_tokens = json
        .get("prompt_eval_count")
        .and_then(|t| t.as_u64())
        .unwrap_or(0);
    let completion_tokens = json.get("eval_count").and_then(|t| t.as_u64()).unwrap_or(0);

    Ok(CompletionResponse {
        message,
        total_tokens: prompt_tokens + completion_tokens,
    })
}

/// Create the backend named by `llm.provider`.
///
/// | Config Value | Backend |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledBackend`] |
/// | `"openai"` | [`OpenAiBackend`] |
/// | `"ollama"` | [`OllamaBackend`] |
pub fn create_backend(config: &LlmConfig) -> Result<Arc<dyn CompletionBackend>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledBackend)),
        "openai" => Ok(Arc::new(OpenAiBackend::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaBackend::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_carries_system_and_user_messages() {
        let req = CompletionRequest::new("mistral-large", "be brief", "summarize", 8000, 0.7);
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.prompt(), "summarize");
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["model"], "mistral-large");
        assert_eq!(body["max_tokens"], 8000);
    }

    #[test]
    fn parse_openai_message_and_usage() {
        let json = json!({
            "choices": [{"message": {"role": "assistant", "content": "Trends: login"}}],
            "usage": {"total_tokens": 321}
        });
        let resp = parse_openai_response(&json).unwrap();
        assert_eq!(resp.message, "Trends: login");
        assert_eq!(resp.total_tokens, 321);
    }

    #[test]
    fn parse_openai_flat_messages_field() {
        let json = json!({
            "choices": [{"messages": "flat text"}],
            "usage": {"total_tokens": 7}
        });
        assert_eq!(parse_openai_response(&json).unwrap().message, "flat text");
    }

    #[test]
    fn parse_openai_empty_choice_is_empty_message() {
        let json = json!({"choices": [{}]});
        let resp = parse_openai_response(&json).unwrap();
        assert_eq!(resp.message, "");
        assert_eq!(resp.total_tokens, 0);
    }

    #[test]
    fn parse_openai_without_choices_is_malformed() {
        let err = parse_openai_response(&json!({"error": "x"})).unwrap_err();
        assert!(matches!(err, CompletionError::Malformed(_)));
    }

    #[test]
    fn parse_ollama_sums_counts() {
        let json = json!({
            "message": {"role": "assistant", "content": "ok"},
            "prompt_eval_count": 10,
            "eval_count": 5
        });
        let resp = parse_ollama_response(&json).unwrap();
        assert_eq!(resp.message, "ok");
        assert_eq!(resp.total_tokens, 15);
    }

    #[tokio::test]
    async fn disabled_backend_fails() {
        let backend = create_backend(&LlmConfig::default()).unwrap();
        let req = CompletionRequest::new("m", "s", "p", 10, 0.0);
        let err = backend.complete(&req).await.unwrap_err();
        assert!(matches!(err, CompletionError::Request(_)));
    }

    #[test]
    fn openai_requires_api_key() {
        let config = LlmConfig {
            provider: "openai".to_string(),
            api_key_env: "CASE_DIGEST_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..LlmConfig::default()
        };
        let err = create_backend(&config).err().unwrap();
        assert!(err.to_string().contains("CASE_DIGEST_TEST_KEY_THAT_IS_NEVER_SET"));
    }
}
