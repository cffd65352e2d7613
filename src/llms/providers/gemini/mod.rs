//! Google Gemini (Generative Language API) client.
//!
//! Gemini places the system prompt in `systemInstruction` and takes the
//! envelope schema as a sibling field, `generationConfig.responseJsonSchema`,
//! next to `responseMimeType: application/json`. Thought parts (flagged
//! `"thought": true`) are reasoning and never count as completion text.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde_json::{json, Map, Value};

use crate::config::ProviderConfig;
use crate::context::Context;
use crate::error::{PerceptionError, Result};
use crate::llms::completer::{
    generate_request_id, ClientState, Completer, StreamingCompleter, StructuredCompleter, TokenUsage,
};
use crate::llms::schema::{self, SchemaTier};
use crate::llms::streaming::{spawn_sse_reader, CompletionStream, SseFrame, StreamChunk};
use crate::llms::transport::{decode_json, HttpExecutor, RequestGate, RetryPolicy};

pub const GEMINI_DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const MAX_CONCURRENT: usize = 5;
pub const MIN_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug)]
pub struct GeminiClient {
    state: ClientState,
    api_key: String,
    base_url: String,
    timeout: Duration,
    max_tokens: Option<u32>,
    enable_thinking: bool,
    http: HttpExecutor,
}

impl GeminiClient {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(PerceptionError::Config("gemini API key is not set".into()));
        }
        let mut gate = RequestGate::new("gemini", MAX_CONCURRENT, MIN_INTERVAL);
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
                .unwrap_or_else(|| GEMINI_DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout: config.timeout,
            max_tokens: config.extensions.max_tokens,
            enable_thinking: config.extensions.enable_thinking,
            http: HttpExecutor::new("gemini", gate)?,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.http.retry = retry;
        self
    }

    pub fn endpoint(&self, stream: bool) -> String {
        let model = self.state.model();
        let model = model.strip_prefix("models/").unwrap_or(&model).to_string();
        if stream {
            format!("{}/models/{}:streamGenerateContent?alt=sse", self.base_url, model)
        } else {
            format!("{}/models/{}:generateContent", self.base_url, model)
        }
    }

    pub fn build_request_body(&self, system: &str, user: &str, structured: bool, use_schema: bool, thinking: bool) -> Value {
        let mut body = json!({
            "contents": [{"role": "user", "parts": [{"text": user}]}],
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }

        let mut generation = Map::new();
        if let Some(max_tokens) = self.max_tokens {
            generation.insert("maxOutputTokens".into(), json!(max_tokens));
        }
        if structured {
            generation.insert("responseMimeType".into(), json!("application/json"));
            if use_schema {
                generation.insert("responseJsonSchema".into(), schema::descriptor(SchemaTier::RawSchema));
            }
        }
        if thinking {
            generation.insert("thinkingConfig".into(), json!({"includeThoughts": true}));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }
        body
    }

    fn request(&self, stream: bool, body: &Value) -> RequestBuilder {
        self.http
            .client
            .post(self.endpoint(stream))
            .header("content-type", "application/json")
            .header("x-goog-api-key", self.api_key.as_str())
            .json(body)
    }

    /// Concatenate the non-thought text parts of the first candidate.
    pub fn parse_response(&self, raw: &str) -> Result<String> {
        let response = decode_json("gemini", raw)?;
        if let Some(usage) = response.get("usageMetadata") {
            self.state.record_usage(usage);
        }
        if let Some(reason) = response.pointer("/promptFeedback/blockReason").and_then(Value::as_str) {
            return Err(PerceptionError::decode("gemini", format!("prompt blocked: {}", reason), raw));
        }
        let parts = response
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .ok_or_else(|| PerceptionError::decode("gemini", "no candidate parts in response", raw))?;

        let text: String = parts
            .iter()
            .filter(|p| !is_thought(p))
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect();
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(PerceptionError::EmptyResponse {
                provider: "gemini".into(),
            });
        }
        Ok(text)
    }

    async fn call(&self, ctx: &Context, system: &str, user: &str, structured: bool, thinking: bool) -> Result<String> {
        let ctx = ctx.with_timeout(self.timeout);
        let request_id = generate_request_id("gemini");
        let raw = self
            .http
            .execute(&ctx, &request_id, structured, |use_schema| {
                self.request(false, &self.build_request_body(system, user, structured, use_schema, thinking))
            })
            .await?;
        self.parse_response(&raw)
    }
}

fn is_thought(part: &Value) -> bool {
    part.get("thought").and_then(Value::as_bool).unwrap_or(false)
}

/// Parse one `streamGenerateContent` SSE frame.
pub fn parse_stream_frame(frame: &SseFrame) -> std::result::Result<Vec<StreamChunk>, String> {
    let value: Value = serde_json::from_str(&frame.data).map_err(|e| e.to_string())?;
    let mut chunks = Vec::new();
    if let Some(err) = value.get("error") {
        chunks.push(StreamChunk::Error {
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("stream error")
                .to_string(),
        });
        return Ok(chunks);
    }
    if let Some(parts) = value.pointer("/candidates/0/content/parts").and_then(Value::as_array) {
        for part in parts {
            let Some(text) = part.get("text").and_then(Value::as_str) else {
                continue;
            };
            if is_thought(part) {
                chunks.push(StreamChunk::ThinkingDelta { text: text.to_string() });
            } else {
                chunks.push(StreamChunk::TextDelta { text: text.to_string() });
            }
        }
    }
    if let Some(usage) = value.get("usageMetadata") {
        chunks.push(StreamChunk::Usage { usage: usage.clone() });
    }
    if value.pointer("/candidates/0/finishReason").is_some() {
        chunks.push(StreamChunk::Done);
    }
    Ok(chunks)
}

#[async_trait]
impl Completer for GeminiClient {
    fn provider(&self) -> &str {
        "gemini"
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
impl StructuredCompleter for GeminiClient {
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
impl StreamingCompleter for GeminiClient {
    async fn complete_with_streaming(
        &self,
        ctx: &Context,
        system: &str,
        user: &str,
        enable_thinking: bool,
    ) -> Result<CompletionStream> {
        let ctx = ctx.with_timeout(self.timeout);
        let request_id = generate_request_id("gemini");
        let (response, permit) = self
            .http
            .open(&ctx, &request_id, true, |use_schema| {
                self.request(true, &self.build_request_body(system, user, true, use_schema, enable_thinking))
            })
            .await?;
        Ok(spawn_sse_reader(&ctx, "gemini", &request_id, response, parse_stream_frame, permit))
    }
}
