//! Completion client seam.
//!
//! The request handler only knows the [`CompletionClient`] trait; the
//! production implementation talks to an OpenAI-compatible
//! `/chat/completions` endpoint over reqwest. Whatever text comes back is
//! untrusted and goes through the normalizer, even though we ask for a
//! JSON object response format.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hint passed to the provider about the shape of the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    JsonObject,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub response_format: ResponseFormat,
}

/// Failures reaching the provider or reading its envelope. Content that
/// arrives fine but violates the etymology contract is a normalizer error,
/// not a transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("completion request failed: {0}")]
    Network(#[source] reqwest::Error),
    #[error("completion timed out after {ms} ms")]
    Timeout { ms: u64 },
    #[error("completion provider rejected credentials (HTTP {status})")]
    Unauthorized { status: u16 },
    #[error("completion provider quota or rate limit exceeded")]
    RateLimited,
    #[error("completion provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected completion envelope: {0}")]
    Decode(String),
    #[error("completion contained no message content")]
    EmptyCompletion,
}

impl TransportError {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Network(_) => "network",
            TransportError::Timeout { .. } => "timeout",
            TransportError::Unauthorized { .. } => "unauthorized",
            TransportError::RateLimited => "rate_limited",
            TransportError::Status { .. } => "status",
            TransportError::Decode(_) => "decode",
            TransportError::EmptyCompletion => "empty_completion",
        }
    }
}

/// A single-shot text completion. Implementations must be safe to share
/// across concurrent requests.
#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, TransportError>;
}

const ERROR_BODY_PREVIEW: usize = 512;

/// Client for OpenAI-compatible chat completion APIs.
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<FormatSpec>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct FormatSpec {
    #[serde(rename = "type")]
    kind: ResponseFormat,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

impl OpenAiClient {
    /// Build a client for `base_url` (e.g. `https://api.openai.com/v1`).
    /// The overall completion deadline is enforced by the caller; only
    /// connection establishment is bounded here.
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(TransportError::Network)?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait::async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, TransportError> {
        let body = ChatRequest {
            model: &options.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            response_format: match options.response_format {
                ResponseFormat::JsonObject => Some(FormatSpec {
                    kind: ResponseFormat::JsonObject,
                }),
                ResponseFormat::Text => None,
            },
        };
        tracing::debug!(model = %options.model, prompt_len = prompt.len(), "sending completion request");
        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(TransportError::Network)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "completion provider returned an error status");
            return Err(match status.as_u16() {
                401 | 403 => TransportError::Unauthorized {
                    status: status.as_u16(),
                },
                429 => TransportError::RateLimited,
                code => TransportError::Status {
                    status: code,
                    body: text.chars().take(ERROR_BODY_PREVIEW).collect(),
                },
            });
        }

        let text = resp.text().await.map_err(TransportError::Network)?;
        let envelope: ChatResponse =
            serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))?;
        envelope
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(TransportError::EmptyCompletion)
    }
}
