//! OpenAI-compatible chat-completions client.
//!
//! One client type serves every provider that speaks the
//! `/chat/completions` wire shape. A [`ChatDialect`] carries what differs
//! between them: base URL, extra headers, structured-output tier, quota and
//! pacing, and how reasoning is requested and streamed back.
//!
//! | Provider | Dialect | Structured output |
//! |----------|---------|-------------------|
//! | OpenAI | [`ChatDialect::openai`] | strict JSON schema |
//! | xAI | [`ChatDialect::xai`] | strict JSON schema |
//! | OpenRouter | [`ChatDialect::openrouter`] | strict JSON schema |
//! | Z.AI | [`crate::llms::providers::zai`] | `json_object` + prompt |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde_json::{json, Value};

use crate::config::{Provider, ProviderConfig};
use crate::context::Context;
use crate::error::{PerceptionError, Result};
use crate::llms::completer::{
    generate_request_id, ClientState, Completer, StreamingCompleter, StructuredCompleter, TokenUsage,
};
use crate::llms::schema::{self, SchemaTier};
use crate::llms::streaming::{spawn_sse_reader, CompletionStream, SseFrame, StreamChunk};
use crate::llms::transport::{decode_json, rate_limit_in_error_payload, HttpExecutor, RequestGate, RetryPolicy};

pub const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const XAI_DEFAULT_BASE_URL: &str = "https://api.x.ai/v1";
pub const OPENROUTER_DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

// ---------------------------------------------------------------------------
// Dialect
// ---------------------------------------------------------------------------

/// How a provider asks for model reasoning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningStyle {
    /// No reasoning control.
    None,
    /// `"reasoning_effort": "high"` (OpenAI o-series, xAI).
    Effort,
    /// `"thinking": {"type": "enabled"}` (Z.AI GLM).
    ThinkingType,
}

/// Per-provider conventions of the chat-completions family.
#[derive(Debug, Clone)]
pub struct ChatDialect {
    pub name: &'static str,
    pub default_base_url: &'static str,
    pub extra_headers: Vec<(&'static str, &'static str)>,
    pub schema_tier: SchemaTier,
    pub max_concurrent: usize,
    pub min_interval: Duration,
    pub reasoning: ReasoningStyle,
    /// Ask for a trailing usage frame on streams.
    pub stream_usage: bool,
}

impl ChatDialect {
    pub fn openai() -> Self {
        Self {
            name: "openai",
            default_base_url: OPENAI_DEFAULT_BASE_URL,
            extra_headers: Vec::new(),
            schema_tier: SchemaTier::StrictJsonSchema,
            max_concurrent: 10,
            min_interval: Duration::from_millis(100),
            reasoning: ReasoningStyle::Effort,
            stream_usage: true,
        }
    }

    pub fn xai() -> Self {
        Self {
            name: "xai",
            default_base_url: XAI_DEFAULT_BASE_URL,
            extra_headers: Vec::new(),
            schema_tier: SchemaTier::StrictJsonSchema,
            max_concurrent: 5,
            min_interval: Duration::from_millis(200),
            reasoning: ReasoningStyle::Effort,
            stream_usage: false,
        }
    }

    pub fn openrouter() -> Self {
        Self {
            name: "openrouter",
            default_base_url: OPENROUTER_DEFAULT_BASE_URL,
            extra_headers: vec![
                ("HTTP-Referer", "https://github.com/perception-layer"),
                ("X-Title", "perception-layer"),
            ],
            schema_tier: SchemaTier::StrictJsonSchema,
            max_concurrent: 5,
            min_interval: Duration::from_millis(200),
            reasoning: ReasoningStyle::None,
            stream_usage: false,
        }
    }

    /// The dialect for a provider, if it belongs to this family.
    pub fn for_provider(provider: Provider) -> Option<Self> {
        match provider {
            Provider::OpenAI => Some(Self::openai()),
            Provider::Xai => Some(Self::xai()),
            Provider::OpenRouter => Some(Self::openrouter()),
            Provider::Zai => Some(crate::llms::providers::zai::dialect()),
            Provider::Anthropic | Provider::Gemini => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A chat-completions client for one provider.
#[derive(Debug)]
pub struct ChatCompletionsClient {
    dialect: ChatDialect,
    state: ClientState,
    api_key: String,
    base_url: String,
    timeout: Duration,
    max_tokens: Option<u32>,
    enable_thinking: bool,
    http: HttpExecutor,
}

impl ChatCompletionsClient {
    /// Build a client; fails with `Config` when no API key is supplied.
    pub fn new(dialect: ChatDialect, config: &ProviderConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(PerceptionError::Config(format!("{} API key is not set", dialect.name)));
        }
        let mut gate = RequestGate::new(dialect.name, dialect.max_concurrent, dialect.min_interval);
        if config.extensions.disable_semaphore {
            gate = gate.without_semaphore();
        }
        let http = HttpExecutor::new(dialect.name, gate)?;
        let base_url = config
            .extensions
            .base_url
            .clone()
            .unwrap_or_else(|| dialect.default_base_url.to_string());

        Ok(Self {
            state: ClientState::new(config.model_or_default()),
            api_key: config.api_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
            max_tokens: config.extensions.max_tokens,
            enable_thinking: config.extensions.enable_thinking,
            dialect,
            http,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.http.retry = retry;
        self
    }

    pub fn dialect(&self) -> &ChatDialect {
        &self.dialect
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Build the request body.
    ///
    /// `structured` asks for envelope output; `use_schema` controls whether
    /// the `response_format` descriptor is attached (false after a
    /// downgrade).
    pub fn build_request_body(
        &self,
        system: &str,
        user: &str,
        structured: bool,
        use_schema: bool,
        stream: bool,
        thinking: bool,
    ) -> Value {
        let mut system = system.to_string();
        if structured && self.dialect.schema_tier != SchemaTier::StrictJsonSchema {
            system.push_str(&schema::schema_prompt_suffix());
        }

        let mut messages = Vec::with_capacity(2);
        if !system.is_empty() {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": user}));

        let mut body = json!({
            "model": self.state.model(),
            "messages": messages,
        });

        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if structured && use_schema {
            body["response_format"] = schema::descriptor(self.dialect.schema_tier);
        }
        if thinking {
            match self.dialect.reasoning {
                ReasoningStyle::Effort => body["reasoning_effort"] = json!("high"),
                ReasoningStyle::ThinkingType => body["thinking"] = json!({"type": "enabled"}),
                ReasoningStyle::None => {}
            }
        }
        if stream {
            body["stream"] = json!(true);
            if self.dialect.stream_usage {
                body["stream_options"] = json!({"include_usage": true});
            }
        }
        body
    }

    fn request(&self, body: &Value) -> RequestBuilder {
        let mut request = self
            .http
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key));
        for (name, value) in &self.dialect.extra_headers {
            request = request.header(*name, *value);
        }
        request.json(body)
    }

    /// Extract the completion text from a chat-completions response body.
    pub fn parse_response(&self, raw: &str) -> Result<String> {
        let provider = self.dialect.name;
        let response = decode_json(provider, raw)?;

        if let Some(message) = rate_limit_in_error_payload(&response) {
            return Err(PerceptionError::rate_limited(provider, None, format!("error payload: {}", message)));
        }
        if let Some(err) = response.get("error") {
            let message = err.get("message").and_then(Value::as_str).unwrap_or("unknown error");
            return Err(PerceptionError::decode(provider, format!("error payload: {}", message), raw));
        }
        if let Some(usage) = response.get("usage") {
            self.state.record_usage(usage);
        }

        let message = response
            .pointer("/choices/0/message")
            .ok_or_else(|| PerceptionError::decode(provider, "no choices in response", raw))?;
        let content = match message.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        };
        let content = content.trim().to_string();
        if content.is_empty() {
            return Err(PerceptionError::EmptyResponse {
                provider: provider.to_string(),
            });
        }
        Ok(content)
    }

    async fn call(&self, ctx: &Context, system: &str, user: &str, structured: bool, thinking: bool) -> Result<String> {
        let ctx = ctx.with_timeout(self.timeout);
        let request_id = generate_request_id(self.dialect.name);
        log::debug!(
            "{} completion: model={}, structured={}, request_id={}",
            self.dialect.name,
            self.state.model(),
            structured,
            request_id
        );
        let body = self
            .http
            .execute(&ctx, &request_id, structured, |use_schema| {
                self.request(&self.build_request_body(system, user, structured, use_schema, false, thinking))
            })
            .await?;
        self.parse_response(&body)
    }
}

/// Parse one chat-completions stream frame.
pub fn parse_stream_frame(frame: &SseFrame) -> std::result::Result<Vec<StreamChunk>, String> {
    let value: Value = serde_json::from_str(&frame.data).map_err(|e| e.to_string())?;
    let mut chunks = Vec::new();

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        chunks.push(StreamChunk::Error { message });
        return Ok(chunks);
    }

    if let Some(delta) = value.pointer("/choices/0/delta") {
        for key in ["reasoning_content", "reasoning"] {
            if let Some(text) = delta.get(key).and_then(Value::as_str) {
                if !text.is_empty() {
                    chunks.push(StreamChunk::ThinkingDelta { text: text.to_string() });
                }
            }
        }
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                chunks.push(StreamChunk::TextDelta { text: text.to_string() });
            }
        }
    }
    if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
        chunks.push(StreamChunk::Usage { usage: usage.clone() });
    }
    if value
        .pointer("/choices/0/finish_reason")
        .map(|r| !r.is_null())
        .unwrap_or(false)
    {
        chunks.push(StreamChunk::Done);
    }
    Ok(chunks)
}

#[async_trait]
impl Completer for ChatCompletionsClient {
    fn provider(&self) -> &str {
        self.dialect.name
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
impl StructuredCompleter for ChatCompletionsClient {
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
impl StreamingCompleter for ChatCompletionsClient {
    async fn complete_with_streaming(
        &self,
        ctx: &Context,
        system: &str,
        user: &str,
        enable_thinking: bool,
    ) -> Result<CompletionStream> {
        let ctx = ctx.with_timeout(self.timeout);
        let request_id = generate_request_id(self.dialect.name);
        let (response, permit) = self
            .http
            .open(&ctx, &request_id, true, |use_schema| {
                self.request(&self.build_request_body(system, user, true, use_schema, true, enable_thinking))
            })
            .await?;
        tracing::debug!(
            request_id = %request_id,
            provider = self.dialect.name,
            phase = "stream_open",
            ctx_remaining_ms = ctx.remaining_ms(),
            "stream opened"
        );
        Ok(spawn_sse_reader(
            &ctx,
            self.dialect.name,
            &request_id,
            response,
            parse_stream_frame,
            permit,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llms::providers::testing::{envelope_json, fast_retry, spawn_mock, sse_body};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn client(base_url: &str) -> ChatCompletionsClient {
        let config = ProviderConfig::api(Provider::OpenAI, "sk-test").with_base_url(base_url);
        ChatCompletionsClient::new(ChatDialect::openai(), &config)
            .unwrap()
            .with_retry(fast_retry())
    }

    fn ok_body(content: &str) -> String {
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        })
        .to_string()
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let config = ProviderConfig::api(Provider::OpenAI, "");
        let err = ChatCompletionsClient::new(ChatDialect::openai(), &config).unwrap_err();
        assert!(matches!(err, PerceptionError::Config(_)));
    }

    #[test]
    fn test_build_request_body_structured() {
        let c = client("http://localhost:1");
        let body = c.build_request_body("sys", "hello", true, true, false, false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert!(body.get("stream").is_none());

        let downgraded = c.build_request_body("sys", "hello", true, false, true, true);
        assert!(downgraded.get("response_format").is_none());
        assert_eq!(downgraded["stream"], true);
        assert_eq!(downgraded["reasoning_effort"], "high");
    }

    #[test]
    fn test_openrouter_headers_and_base_url() {
        let d = ChatDialect::openrouter();
        assert_eq!(d.default_base_url, OPENROUTER_DEFAULT_BASE_URL);
        assert!(d.extra_headers.iter().any(|(k, _)| *k == "X-Title"));
    }

    #[test]
    fn test_parse_response_empty_content() {
        let c = client("http://localhost:1");
        let err = c.parse_response(&ok_body("   ")).unwrap_err();
        assert!(matches!(err, PerceptionError::EmptyResponse { .. }));
    }

    #[test]
    fn test_parse_response_malformed() {
        let c = client("http://localhost:1");
        let err = c.parse_response("not json").unwrap_err();
        assert!(matches!(err, PerceptionError::Decode { .. }));
    }

    #[test]
    fn test_parse_stream_frame() {
        let frame = SseFrame {
            event: None,
            data: r#"{"choices":[{"delta":{"content":"Hi","reasoning_content":"hmm"},"finish_reason":null}]}"#.into(),
        };
        let chunks = parse_stream_frame(&frame).unwrap();
        assert_eq!(
            chunks,
            vec![
                StreamChunk::ThinkingDelta { text: "hmm".into() },
                StreamChunk::TextDelta { text: "Hi".into() },
            ]
        );
        let bad = SseFrame { event: None, data: "{oops".into() };
        assert!(parse_stream_frame(&bad).is_err());
    }

    #[tokio::test]
    async fn test_complete_success_records_usage() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async { ok_body("hello there") }),
        );
        let base = spawn_mock(router).await;
        let c = client(&base);
        let out = c.complete(&Context::background(), "hi").await.unwrap();
        assert_eq!(out, "hello there");
        assert_eq!(c.usage().total_tokens, 15);
    }

    #[tokio::test]
    async fn test_retries_on_429_then_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/chat/completions",
            post(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        (StatusCode::TOO_MANY_REQUESTS, "slow down".to_string()).into_response()
                    } else {
                        ok_body("finally").into_response()
                    }
                }
            }),
        );
        let base = spawn_mock(router).await;
        let out = client(&base).complete(&Context::background(), "hi").await.unwrap();
        assert_eq!(out, "finally");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_429_is_rate_limited() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/chat/completions",
            post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    (
                        StatusCode::TOO_MANY_REQUESTS,
                        [("retry-after", "2")],
                        "rate limit reached".to_string(),
                    )
                        .into_response()
                }
            }),
        );
        let base = spawn_mock(router).await;
        let err = client(&base).complete(&Context::background(), "hi").await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.provider(), Some("openai"));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_rate_limit_in_success_body_is_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/chat/completions",
            post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { json!({"error": {"message": "Rate limit exceeded", "code": 429}}).to_string() }
            }),
        );
        let base = spawn_mock(router).await;
        let config = ProviderConfig::api(Provider::OpenRouter, "sk-or-test").with_base_url(&base);
        let c = ChatCompletionsClient::new(ChatDialect::openrouter(), &config)
            .unwrap()
            .with_retry(fast_retry());
        let err = c.complete(&Context::background(), "hi").await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.provider(), Some("openrouter"));
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_parse_response_rate_limit_payload() {
        let c = client("http://localhost:1");
        let err = c
            .parse_response(r#"{"error": {"message": "Too Many Requests", "code": 429}}"#)
            .unwrap_err();
        assert!(err.is_rate_limited());
        let err = c.parse_response(r#"{"error": {"message": "model not found"}}"#).unwrap_err();
        assert!(matches!(err, PerceptionError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_non_retryable_status_fails_immediately() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/chat/completions",
            post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { (StatusCode::UNAUTHORIZED, "invalid api key".to_string()).into_response() }
            }),
        );
        let base = spawn_mock(router).await;
        let err = client(&base).complete(&Context::background(), "hi").await.unwrap_err();
        match err {
            PerceptionError::Provider { status, body_excerpt, .. } => {
                assert_eq!(status, 401);
                assert!(body_excerpt.contains("invalid api key"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_structured_output_downgrade() {
        let router = Router::new().route(
            "/chat/completions",
            post(|body: String| async move {
                if body.contains("response_format") {
                    (
                        StatusCode::BAD_REQUEST,
                        "Invalid parameter: response_format json_schema not supported".to_string(),
                    )
                        .into_response()
                } else {
                    ok_body(&envelope_json("/query", "/greet", "Hello!")).into_response()
                }
            }),
        );
        let base = spawn_mock(router).await;
        let c = client(&base);
        let out = c
            .complete_with_structured_output(&Context::background(), "sys", "hi", false)
            .await
            .unwrap();
        assert!(out.contains("control_packet"));
    }

    #[tokio::test]
    async fn test_streaming_releases_surface_only() {
        let envelope = envelope_json("/query", "/greet", "Hello world");
        let frames: Vec<String> = envelope
            .as_bytes()
            .chunks(7)
            .map(|part| {
                json!({"choices": [{"delta": {"content": String::from_utf8_lossy(part)}, "finish_reason": null}]})
                    .to_string()
            })
            .collect();
        let router = Router::new().route(
            "/chat/completions",
            post(move || {
                let frames = frames.clone();
                async move { sse_body(frames, false) }
            }),
        );
        let base = spawn_mock(router).await;
        let c = client(&base);
        let stream = c
            .complete_with_streaming(&Context::background(), "sys", "hi", false)
            .await
            .unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let outcome = stream.finish_forwarding(Some(&tx)).await.unwrap();
        drop(tx);
        let mut shown = String::new();
        while let Some(chunk) = rx.recv().await {
            shown.push_str(&chunk);
        }
        assert_eq!(shown, "Hello world");
        assert_eq!(outcome.content, envelope);
    }

    #[tokio::test]
    async fn test_streaming_cancellation_returns_promptly() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async {
                let first = json!({"choices": [{"delta": {"content": "{\"control"}}]}).to_string();
                sse_body(vec![first], true)
            }),
        );
        let base = spawn_mock(router).await;
        let c = client(&base);
        let ctx = Context::background();
        let stream = c.complete_with_streaming(&ctx, "sys", "hi", false).await.unwrap();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let started = std::time::Instant::now();
        let err = stream.finish().await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_during_http_request() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                ok_body("late")
            }),
        );
        let base = spawn_mock(router).await;
        let c = client(&base);
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let started = std::time::Instant::now();
        let err = c.complete(&ctx, "hi").await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
