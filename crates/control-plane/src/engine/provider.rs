//! `LlmProvider` contract and the HTTP transport adapter used by the server.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Requested output format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    JsonObject,
    JsonSchema { schema: Value },
}

/// A compiled model request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model_class: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: None,
            usage: None,
        }
    }
}

/// Error reported by a provider. The hints feed failure classification.
#[derive(Debug, Clone, Default, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
    /// HTTP status, when the failure came from an HTTP response.
    pub status_code: Option<u16>,
    /// Transport error code such as `ECONNRESET` or `ETIMEDOUT`.
    pub code: Option<String>,
    /// Error type name, e.g. `TimeoutError`.
    pub name: Option<String>,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        let mut error = ProviderError::new(e.to_string());
        if let Some(status) = e.status() {
            error = error.with_status(status.as_u16());
        }
        if e.is_timeout() {
            error = error.with_code("ETIMEDOUT");
        } else if e.is_connect() {
            error = error.with_code("ECONNREFUSED");
        } else if e.is_decode() {
            error = error.with_name("DecodeError");
        }
        error
    }
}

/// The only contract the runner has with a model backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name recorded on failures.
    fn name(&self) -> &str;

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Posts the [`ChatRequest`] as JSON to a gateway endpoint and expects a
/// [`ChatResponse`] back.
pub struct HttpChatProvider {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpChatProvider {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            name: name.into(),
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl LlmProvider for HttpChatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let response = self.client.post(&self.url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(format!("provider returned {}: {}", status, body))
                .with_status(status.as_u16()));
        }

        response.json::<ChatResponse>().await.map_err(|e| {
            ProviderError::new(format!("invalid provider response: {}", e)).with_name("SyntaxError")
        })
    }
}

/// Stand-in used when no provider endpoint is configured.
pub struct UnconfiguredProvider;

#[async_trait]
impl LlmProvider for UnconfiguredProvider {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        Err(ProviderError::new("no LLM provider configured").with_status(503))
    }
}
