//! Chat-completions HTTP client with bounded retry
//!
//! One reqwest client, connection reuse, per-request timeout. Responses carry
//! the model output as a JSON string inside `choices[0].message.content`;
//! ```json fences are tolerated and stripped before parsing.

use crate::types::{ChatMessage, ChatRequest, ChatResponse};
use reqwest::Client;
use signstream_core::config::LlmConfig;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff between attempts is 2^attempt seconds, capped here.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited")]
    RateLimited,

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("timed out after {0} attempts")]
    Exhausted(u32),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

pub type LlmResult<T> = Result<T, LlmError>;

pub struct LlmClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            max_retries: config.max_retries.max(1),
        }
    }

    /// Send a chat request expecting a JSON object back. Retries transient
    /// failures (5xx, timeouts, connection errors) with exponential backoff;
    /// auth and not-found failures surface immediately.
    pub async fn chat_json(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
    ) -> LlmResult<serde_json::Value> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: model.to_string(),
            messages,
            format: "json",
        };

        let mut last_error = None;
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let backoff = Duration::from_secs(1u64 << attempt).min(MAX_BACKOFF);
                debug!(attempt, ?backoff, "retrying LLM request");
                tokio::time::sleep(backoff).await;
            }

            match self.send_once(&url, &body).await {
                Ok(value) => return Ok(value),
                Err(e @ (LlmError::AuthFailed(_) | LlmError::ModelNotFound(_))) => return Err(e),
                Err(e) => {
                    warn!(attempt, error = %e, "LLM request failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(LlmError::Exhausted(self.max_retries)))
    }

    async fn send_once(&self, url: &str, body: &ChatRequest) -> LlmResult<serde_json::Value> {
        let mut request = self.client.post(url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthFailed(text),
                404 => LlmError::ModelNotFound(body.model.clone()),
                429 => LlmError::RateLimited,
                _ => LlmError::RequestFailed(format!("{}: {}", status, text)),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| LlmError::InvalidResponse("empty choices".to_string()))?;

        let cleaned = strip_json_fences(content);
        serde_json::from_str(cleaned)
            .map_err(|e| LlmError::InvalidResponse(format!("{}: {}", e, truncate(cleaned, 200))))
    }
}

/// Strip ```json ... ``` (or bare ```) fences the model may wrap its output in.
pub fn strip_json_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let inner = if let Some(rest) = trimmed.strip_prefix("```json") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest
    } else {
        return trimmed;
    };
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
