//! OpenAI-compatible Chat Completions client
//!
//! Every planning endpoint the swarm talks to speaks this API, whether it is
//! a hosted provider or a self-hosted inference server.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CompletionRequest, CompletionResponse, LlmClient, LlmError, StopReason, TokenUsage};
use crate::config::{LlmConfig, LlmEndpoint};

/// Maximum number of retries for transient errors
const MAX_RETRIES: u32 = 3;

/// Initial backoff delay for retries
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Check if an HTTP status code is retryable
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 500 | 502 | 503 | 504)
}

/// Client for one OpenAI-compatible endpoint
pub struct OpenAIClient {
    name: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
    http: Client,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl OpenAIClient {
    /// Create a client for one configured endpoint
    pub fn from_endpoint(endpoint: &LlmEndpoint, config: &LlmConfig) -> Result<Self, LlmError> {
        debug!(name = %endpoint.name, base_url = %endpoint.base_url, "OpenAIClient::from_endpoint: called");
        let timeout = config.timeout();
        let http = Client::builder().timeout(timeout).build().map_err(LlmError::Network)?;

        Ok(Self {
            name: endpoint.name.clone(),
            model: config.model.clone(),
            api_key: endpoint.resolve_api_key(),
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            http,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Chat completions URL; accepts base URLs with or without a `/v1` suffix
    fn completions_url(&self) -> String {
        if self.base_url.ends_with("/v1") {
            format!("{}/chat/completions", self.base_url)
        } else {
            format!("{}/v1/chat/completions", self.base_url)
        }
    }

    /// Build the request body for the Chat Completions API
    fn build_request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        debug!(%self.model, %request.max_tokens, "OpenAIClient::build_request_body: called");

        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": request.system_prompt,
        })];
        messages.extend(request.messages.iter().map(|m| {
            serde_json::json!({
                "role": m.role.as_str(),
                "content": m.content,
            })
        }));

        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens.min(self.max_tokens),
            "temperature": request.temperature.unwrap_or(self.temperature),
        })
    }

    /// Parse the API response
    fn parse_response(&self, api_response: OpenAIResponse) -> CompletionResponse {
        debug!(choices = api_response.choices.len(), "OpenAIClient::parse_response: called");
        let (content, stop_reason) = match api_response.choices.into_iter().next() {
            Some(c) => (c.message.content, StopReason::from_openai(c.finish_reason.as_deref())),
            None => (None, StopReason::EndTurn),
        };
        let usage = api_response.usage.unwrap_or_default();

        CompletionResponse {
            content,
            stop_reason,
            usage: TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
            endpoint: Some(self.name.clone()),
        }
    }
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        debug!(endpoint = %self.name, %self.model, messages = request.messages.len(), "OpenAIClient::complete: called");
        let url = self.completions_url();
        let body = self.build_request_body(&request);

        let mut last_error = None;
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let backoff = INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1);
                warn!(
                    endpoint = %self.name,
                    attempt,
                    backoff_ms = backoff,
                    "OpenAIClient::complete: retrying after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            let mut builder = self.http.post(url.clone()).header("content-type", "application/json");
            if let Some(key) = &self.api_key {
                builder = builder.bearer_auth(key);
            }

            let response = match builder.json(&body).send().await {
                Ok(r) => r,
                Err(e) if e.is_timeout() => {
                    debug!(attempt, "OpenAIClient::complete: timed out");
                    last_error = Some(LlmError::Timeout(self.timeout));
                    continue;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "OpenAIClient::complete: network error");
                    last_error = Some(LlmError::Network(e));
                    continue;
                }
            };

            let status = response.status().as_u16();

            if status == 429 {
                debug!("OpenAIClient::complete: rate limited (429)");
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(60);

                return Err(LlmError::RateLimited {
                    retry_after: Duration::from_secs(retry_after),
                });
            }

            if is_retryable_status(status) && attempt < MAX_RETRIES {
                let text = response.text().await.unwrap_or_default();
                debug!(attempt, status, "OpenAIClient::complete: retryable error");
                last_error = Some(LlmError::ApiError { status, message: text });
                continue;
            }

            if !response.status().is_success() {
                debug!(%status, "OpenAIClient::complete: API error");
                let text = response.text().await.unwrap_or_default();
                return Err(LlmError::ApiError { status, message: text });
            }

            let text = response.text().await?;
            let api_response: OpenAIResponse = serde_json::from_str(&text)?;
            debug!("OpenAIClient::complete: success");
            return Ok(self.parse_response(api_response));
        }

        Err(last_error.unwrap_or_else(|| LlmError::InvalidResponse("Max retries exceeded".to_string())))
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}
