//! Chat-completion backend.
//!
//! [`LanguageModel`] is the seam the dialogue core talks to; [`OpenAiClient`]
//! implements it against any endpoint that speaks the OpenAI
//! `/chat/completions` wire format.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::BackendConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationPolicy {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    /// Prompt plus completion tokens, as reported by the backend.
    pub total_tokens: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The backend is overloaded or rate limiting us.
    #[error("backend overloaded ({status}): {message}")]
    Overloaded { status: u16, message: String },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed backend response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("backend returned no completion")]
    EmptyCompletion,
}

impl LlmError {
    /// Whether the failure was reported by (or while reaching) the backend,
    /// as opposed to a payload we could not make sense of.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Self::Overloaded { .. } | Self::Api { .. } | Self::Transport(_))
    }

    fn from_status(status: StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<ErrorEnvelope>(body)
            .map(|envelope| envelope.error.message)
            .unwrap_or_else(|_| body.chars().take(200).collect());

        match status {
            StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => Self::Overloaded {
                status: status.as_u16(),
                message,
            },
            _ => Self::Api {
                status: status.as_u16(),
                message,
            },
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        policy: &GenerationPolicy,
    ) -> Result<Completion, LlmError>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    total_tokens: Option<u64>,
}

impl Usage {
    fn total(&self) -> u64 {
        self.total_tokens
            .unwrap_or_else(|| self.prompt_tokens.saturating_add(self.completion_tokens))
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

pub struct OpenAiClient {
    http: reqwest::Client,
    chat_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(config: &BackendConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        let base = config.base_url.trim_end_matches('/');

        Ok(Self {
            http,
            chat_url: format!("{base}/chat/completions"),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        policy: &GenerationPolicy,
    ) -> Result<Completion, LlmError> {
        let request = CompletionRequest {
            model: &policy.model,
            messages,
            temperature: policy.temperature,
            max_tokens: policy.max_tokens,
        };

        debug!(model = %policy.model, messages = messages.len(), "sending completion request");

        let response = self
            .http
            .post(&self.chat_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::from_status(status, &body));
        }

        parse_completion(&body)
    }
}

fn parse_completion(body: &str) -> Result<Completion, LlmError> {
    let response: CompletionResponse = serde_json::from_str(body)?;

    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or(LlmError::EmptyCompletion)?;
    let total_tokens = response.usage.as_ref().map_or(0, Usage::total);

    Ok(Completion { text, total_tokens })
}
