//! Anthropic Messages API client.
//!
//! The system prompt travels as the separate `system` field rather than a
//! message, and the Messages API has no `response_format`, so structured
//! output is enforced by appending the envelope schema to the system prompt.
//!
//! Streams use typed events: `content_block_delta` carries `text_delta` or
//! `thinking_delta`, `message_delta` carries usage and `message_stop` ends
//! the stream.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ProviderConfig;
use crate::context::Context;
use crate::error::{PerceptionError, Result};
use crate::llms::completer::{
    generate_request_id, ClientState, Completer, StreamingCompleter, StructuredCompleter, TokenUsage,
};
use crate::llms::schema;
use crate::llms::streaming::{spawn_sse_reader, CompletionStream, SseFrame, StreamChunk};
use crate::llms::transport::{decode_json, rate_limit_in_error_payload, HttpExecutor, RequestGate, RetryPolicy};

pub const ANTHROPIC_DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MAX_TOKENS: u32 = 8192;
pub const MAX_CONCURRENT: usize = 5;
pub const MIN_INTERVAL: Duration = Duration::from_millis(200);

/// Extended thinking request block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub thinking_type: String,
    pub budget_tokens: u32,
}

impl ThinkingConfig {
    pub fn enabled(budget_tokens: u32) -> Self {
        Self {
            thinking_type: "enabled".to_string(),
            budget_tokens,
        }
    }
}

/// Thinking budget used when thinking is requested.
pub const THINKING_BUDGET: u32 = 2048;

#[derive(Debug)]
pub struct AnthropicClient {
    state: ClientState,
    api_key: String,
    base_url: String,
    timeout: Duration,
    max_tokens: u32,
    enable_thinking: bool,
    http: HttpExecutor,
}

impl AnthropicClient {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(PerceptionError::Config("anthropic API key is not set".into()));
        }
        let mut gate = RequestGate::new("anthropic", MAX_CONCURRENT, MIN_INTERVAL);
        if config.extensions.disable_semaphore {
            gate = gate.without_semaphore();
        }
        Ok(Self {
            state: ClientState::new(config.model_or_default()),
            api_key: config.api_key.clone(),
            base_url: config
                .extensions
                .base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout: config.timeout,
            max_tokens: config.extensions.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            enable_thinking: config.extensions.enable_thinking,
            http: HttpExecutor::new("anthropic", gate)?,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.http.retry = retry;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    pub fn build_request_body(&self, system: &str, user: &str, structured: bool, stream: bool, thinking: bool) -> Value {
        let mut system = system.to_string();
        if structured {
            system.push_str(&schema::schema_prompt_suffix());
        }

        let mut max_tokens = self.max_tokens;
        if thinking && max_tokens <= THINKING_BUDGET {
            max_tokens = THINKING_BUDGET + DEFAULT_MAX_TOKENS;
        }

        let mut body = json!({
            "model": self.state.model(),
            "max_tokens": max_tokens,
            "messages": [{"role": "user", "content": user}],
        });
        if !system.is_empty() {
            body["system"] = Value::String(system);
        }
        if thinking {
            body["thinking"] = json!(ThinkingConfig::enabled(THINKING_BUDGET));
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    fn request(&self, body: &Value) -> RequestBuilder {
        self.http
            .client
            .post(self.endpoint())
            .header("content-type", "application/json")
            .header("x-api-key", self.api_key.as_str())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
    }

    /// Concatenate the `text` blocks of a Messages API response.
    pub fn parse_response(&self, raw: &str) -> Result<String> {
        let response = decode_json("anthropic", raw)?;
        if let Some(message) = rate_limit_in_error_payload(&response) {
            return Err(PerceptionError::rate_limited("anthropic", None, format!("error payload: {}", message)));
        }
        if response.get("type").and_then(Value::as_str) == Some("error") {
            let message = response
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(PerceptionError::decode("anthropic", format!("error payload: {}", message), raw));
        }
        if let Some(usage) = response.get("usage") {
            self.state.record_usage(usage);
        }
        let blocks = response
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| PerceptionError::decode("anthropic", "no content array in response", raw))?;

        let mut text = String::new();
        for block in blocks {
            match block.get("type").and_then(Value::as_str).unwrap_or("") {
                "text" => {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
                "thinking" => {
                    if let Some(t) = block.get("thinking").and_then(Value::as_str) {
                        log::debug!("anthropic thinking: {} chars", t.len());
                    }
                }
                other => log::debug!("ignoring anthropic content block type: {}", other),
            }
        }
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(PerceptionError::EmptyResponse {
                provider: "anthropic".into(),
            });
        }
        Ok(text)
    }

    async fn call(&self, ctx: &Context, system: &str, user: &str, structured: bool, thinking: bool) -> Result<String> {
        let ctx = ctx.with_timeout(self.timeout);
        let request_id = generate_request_id("anthropic");
        let body = self.build_request_body(system, user, structured, false, thinking);
        let raw = self
            .http
            .execute(&ctx, &request_id, false, |_| self.request(&body))
            .await?;
        self.parse_response(&raw)
    }
}

/// Parse one Messages API stream event.
pub fn parse_stream_frame(frame: &SseFrame) -> std::result::Result<Vec<StreamChunk>, String> {
    let value: Value = serde_json::from_str(&frame.data).map_err(|e| e.to_string())?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .or(frame.event.as_deref())
        .unwrap_or("");

    let chunk = match kind {
        "content_block_delta" => {
            let delta = value.get("delta").ok_or("content_block_delta without delta")?;
            match delta.get("type").and_then(Value::as_str) {
                Some("text_delta") => delta
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|t| StreamChunk::TextDelta { text: t.to_string() }),
                Some("thinking_delta") => delta
                    .get("thinking")
                    .and_then(Value::as_str)
                    .map(|t| StreamChunk::ThinkingDelta { text: t.to_string() }),
                _ => None,
            }
        }
        "message_delta" => value
            .get("usage")
            .map(|u| StreamChunk::Usage { usage: u.clone() }),
        "message_stop" => Some(StreamChunk::Done),
        "error" => Some(StreamChunk::Error {
            message: value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("stream error")
                .to_string(),
        }),
        _ => None,
    };
    Ok(chunk.into_iter().collect())
}

#[async_trait]
impl Completer for AnthropicClient {
    fn provider(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> String {
        self.state.model()
    }

    fn set_model(&self, model: &str) {
        self.state.set_model(model);
    }

    fn usage(&self) -> TokenUsage {
        self.state.usage()
    }

    async fn complete_with_system(&self, ctx: &Context, system: &str, user: &str) -> Result<String> {
        self.call(ctx, system, user, false, self.enable_thinking).await
    }

    fn streaming(&self) -> Option<&dyn StreamingCompleter> {
        Some(self)
    }

    fn structured(&self) -> Option<&dyn StructuredCompleter> {
        Some(self)
    }
}

#[async_trait]
impl StructuredCompleter for AnthropicClient {
    async fn complete_with_structured_output(
        &self,
        ctx: &Context,
        system: &str,
        user: &str,
        enable_thinking: bool,
    ) -> Result<String> {
        self.call(ctx, system, user, true, enable_thinking).await
    }
}

#[async_trait]
impl StreamingCompleter for AnthropicClient {
    async fn complete_with_streaming(
        &self,
        ctx: &Context,
        system: &str,
        user: &str,
        enable_thinking: bool,
    ) -> Result<CompletionStream> {
        let ctx = ctx.with_timeout(self.timeout);
        let request_id = generate_request_id("anthropic");
        let body = self.build_request_body(system, user, true, true, enable_thinking);
        let (response, permit) = self
            .http
            .open(&ctx, &request_id, false, |_| self.request(&body))
            .await?;
        Ok(spawn_sse_reader(&ctx, "anthropic", &request_id, response, parse_stream_frame, permit))
    }
}
