use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use thiserror::Error;
use tracing::debug;

use crate::history::{Message, Role};

/// Transport and API failures are fatal to a run; retry policy, if any,
/// belongs behind this trait, not in the agent loop.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("api key missing: set OPENAI_API_KEY")]
    MissingApiKey,
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("model returned an empty completion")]
    EmptyResponse,
}

/// The single capability the agent loop needs from a model backend.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn chat(&self, messages: &[Message]) -> Result<String, LlmError>;
}

#[derive(Clone)]
pub struct LlmConfig {
    pub api_base: String, // e.g. "https://api.openai.com/v1"
    pub api_key: String,  // env OPENAI_API_KEY
    pub model: String,    // e.g. "gpt-4o-mini"
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: env::var("WEBPILOT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            temperature: 0.7,
            max_tokens: Some(4096),
        }
    }
}

/// Chat-completions client for any OpenAI-compatible endpoint (OpenAI,
/// DeepSeek, Ark, local gateways). Provider selection is a configuration
/// choice: point `api_base` and `model` somewhere else.
#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: Client,
    cfg: LlmConfig,
}

impl OpenAiCompatClient {
    pub fn new(cfg: LlmConfig) -> Result<Self, LlmError> {
        if cfg.api_key.is_empty() {
            return Err(LlmError::MissingApiKey);
        }
        Ok(Self { http: Client::new(), cfg })
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        // The completions tool role demands native tool-call ids, which this
        // transcript does not carry; action results ride as user turns.
        Role::Tool => "user",
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatClient {
    async fn chat(&self, messages: &[Message]) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: &self.cfg.model,
            messages: messages
                .iter()
                .map(|m| WireMessage { role: wire_role(m.role), content: &m.content })
                .collect(),
            temperature: self.cfg.temperature,
            max_tokens: self.cfg.max_tokens,
        };

        let url = format!("{}/chat/completions", self.cfg.api_base);
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(LlmError::Api { status: status.as_u16(), message: text });
        }
        debug!(bytes = text.len(), "chat completion received");

        let decoded: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| LlmError::Api { status: status.as_u16(), message: e.to_string() })?;
        decoded
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}
