//! OpenAI-compatible chat-completion provider.
//!
//! Both configured endpoints (OpenAI itself and the Groq fallback)
//! speak the same wire format, so one client covers them. Requests are
//! bearer-token authenticated JSON posts to `{base_url}/chat/completions`.

use crate::error::{Error, Result};
use crate::message::{ChatMessage, CompletionRequest, CompletionResponse, TokenUsage};
use crate::provider::ChatProvider;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// OpenAI API base URL
pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
/// Groq API base URL (OpenAI-compatible)
pub const GROQ_API_BASE: &str = "https://api.groq.com/openai/v1";

/// Default models per endpoint
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const GROQ_DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";

/// Default per-call timeout. Timeouts count as circuit-breaker failures.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for one chat-completion endpoint
#[derive(Clone)]
pub struct EndpointConfig {
    /// Provider name used for attribution and circuit breaking
    pub name: String,
    /// API key
    pub api_key: String,
    /// Base URL
    pub base_url: String,
    /// Default model
    pub default_model: String,
    /// Request timeout
    pub timeout: Duration,
}

// SECURITY: Custom Debug implementation to mask the API key
impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("name", &self.name)
            .field("api_key", &mask_api_key(&self.api_key))
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Mask API key for safe display
fn mask_api_key(key: &str) -> String {
    if key.len() <= 8 {
        return "****".to_string();
    }
    format!("{}...{}", &key[..4], &key[key.len() - 4..])
}

/// Sanitize API error messages before they can reach logs or users
fn sanitize_api_error(provider: &str, error: &str) -> String {
    let lower = error.to_lowercase();

    if lower.contains("api key")
        || lower.contains("apikey")
        || lower.contains("invalid key")
        || lower.contains("unauthorized")
        || lower.contains("authentication")
    {
        return format!("{provider} authentication error");
    }

    if lower.contains("rate limit") || lower.contains("quota") {
        return format!("{provider} rate limit exceeded");
    }

    if lower.contains("internal") || lower.contains("server error") {
        return format!("{provider} server error");
    }

    if error.len() < 100 && !lower.contains("key") && !lower.contains("bearer") {
        return error.to_string();
    }

    format!("{provider} API error")
}

impl EndpointConfig {
    /// OpenAI endpoint with an explicit key
    #[must_use]
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            name: "openai".to_string(),
            api_key: api_key.into(),
            base_url: OPENAI_API_BASE.to_string(),
            default_model: OPENAI_DEFAULT_MODEL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Groq endpoint with an explicit key
    #[must_use]
    pub fn groq(api_key: impl Into<String>) -> Self {
        Self {
            name: "groq".to_string(),
            api_key: api_key.into(),
            base_url: GROQ_API_BASE.to_string(),
            default_model: GROQ_DEFAULT_MODEL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// OpenAI endpoint configured from `OPENAI_API_KEY` / `OPENAI_MODEL`
    pub fn openai_from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::NotConfigured("OPENAI_API_KEY not set".to_string()))?;
        let mut config = Self::openai(api_key);
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            config.default_model = model;
        }
        Ok(config)
    }

    /// Groq endpoint configured from `GROQ_API_KEY` / `GROQ_MODEL`
    pub fn groq_from_env() -> Result<Self> {
        let api_key = std::env::var("GROQ_API_KEY")
            .map_err(|_| Error::NotConfigured("GROQ_API_KEY not set".to_string()))?;
        let mut config = Self::groq(api_key);
        if let Ok(model) = std::env::var("GROQ_MODEL") {
            config.default_model = model;
        }
        Ok(config)
    }

    /// Set the default model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Set the timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Provider speaking the OpenAI chat-completions wire format
pub struct OpenAiCompatProvider {
    client: Client,
    config: EndpointConfig,
}

// Wire types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
    model: String,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl OpenAiCompatProvider {
    /// Create a provider from an endpoint configuration.
    pub fn new(config: EndpointConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn to_wire(messages: &[ChatMessage]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|m| WireMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn default_model(&self) -> &str {
        &self.config.default_model
    }

    #[instrument(skip(self, request), fields(provider = %self.config.name))]
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = if request.model.is_empty() {
            self.config.default_model.clone()
        } else {
            request.model.clone()
        };

        let body = ChatRequest {
            model,
            messages: Self::to_wire(&request.messages),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let url = format!("{}/chat/completions", self.config.base_url);
        debug!(url = %url, "Sending chat completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(self.config.timeout.as_millis() as u64)
                } else {
                    Error::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = sanitize_api_error(&self.config.name, &text);
            warn!(status = %status, message = %message, "Provider call failed");
            return Err(Error::Http {
                provider: self.config.name.clone(),
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .unwrap_or_default();

        if content.is_empty() {
            return Err(Error::EmptyResponse(self.config.name.clone()));
        }

        Ok(CompletionResponse {
            content,
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            model: parsed.model,
        })
    }
}
