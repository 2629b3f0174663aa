//! Language-model text service and its calling discipline.
//!
//! [`TextService`] is the seam: [`OpenRouterClient`] talks to an
//! OpenAI-compatible chat completions API, tests plug in fakes.
//! [`CallPolicy`] bounds every call with one deadline and retries only
//! rate-limit rejections.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use leadflow_shared::{AppConfig, InsightsConfig, LeadflowError, Result};

const PROVIDER: &str = "openrouter";

/// User-Agent string for text service requests.
const USER_AGENT: &str = concat!("Leadflow/", env!("CARGO_PKG_VERSION"));

/// A prompt plus generation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Something that turns a prompt into text.
#[async_trait]
pub trait TextService: Send + Sync {
    /// Model identifier, part of the insight cache key.
    fn model(&self) -> &str;

    /// Complete `request`, giving up after `timeout`.
    ///
    /// Fails with `RateLimited`, `Timeout` or `Service`.
    async fn complete(&self, request: &TextRequest, timeout: Duration) -> Result<String>;
}

// ---------------------------------------------------------------------------
// OpenRouter
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Chat completions client for OpenRouter (or any OpenAI-compatible API).
pub struct OpenRouterClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    pub fn new(base_url: &str, api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| LeadflowError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// Build from config, reading the key from the configured env var.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        leadflow_shared::validate_api_key(config)?;
        let key = std::env::var(&config.openrouter.api_key_env).map_err(|_| {
            LeadflowError::config(format!("{} is not set", config.openrouter.api_key_env))
        })?;
        Self::new(
            &config.openrouter.base_url,
            key,
            config.openrouter.default_model.clone(),
        )
    }
}

#[async_trait]
impl TextService for OpenRouterClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &TextRequest, timeout: Duration) -> Result<String> {
        let started = Instant::now();
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, started))?;

        let status = response.status();
        debug!(status = status.as_u16(), model = %self.model, "text service responded");
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LeadflowError::RateLimited {
                provider: PROVIDER.into(),
            });
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LeadflowError::Service(format!(
                "HTTP {}: {}",
                status.as_u16(),
                detail.chars().take(200).collect::<String>()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| transport_error(e, started))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LeadflowError::malformed(PROVIDER, "response has no message content"))
    }
}

fn transport_error(err: reqwest::Error, started: Instant) -> LeadflowError {
    if err.is_timeout() {
        LeadflowError::Timeout {
            provider: PROVIDER.into(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    } else if err.is_decode() {
        LeadflowError::malformed(PROVIDER, err.to_string())
    } else {
        LeadflowError::Service(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Call policy
// ---------------------------------------------------------------------------

/// Deadline and retry rules for text service calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallPolicy {
    /// Bounds the whole call, retries and backoff included.
    pub timeout: Duration,
    /// Extra attempts after a `RateLimited` answer.
    pub rate_limit_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::from(&InsightsConfig::default())
    }
}

impl From<&InsightsConfig> for CallPolicy {
    fn from(config: &InsightsConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            rate_limit_retries: config.rate_limit_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

impl CallPolicy {
    /// Run `request` against `service` under this policy.
    pub async fn call(
        &self,
        service: &dyn TextService,
        request: &TextRequest,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let timed_out = || LeadflowError::Timeout {
            provider: PROVIDER.into(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        let mut retries_left = self.rate_limit_retries;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LeadflowError::Cancelled),
                result = tokio::time::timeout(remaining, service.complete(request, remaining)) => {
                    result.unwrap_or_else(|_| Err(timed_out()))
                }
            };

            match attempt {
                Err(e) if e.is_retryable() && retries_left > 0 => {
                    retries_left -= 1;
                    if deadline.saturating_duration_since(Instant::now()) <= self.retry_backoff {
                        return Err(e);
                    }
                    warn!(backoff_ms = self.retry_backoff.as_millis() as u64, "rate limited, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(LeadflowError::Cancelled),
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
                other => return other,
            }
        }
    }
}
