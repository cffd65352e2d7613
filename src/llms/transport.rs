//! Shared HTTP transport for the API clients.
//!
//! [`HttpExecutor`] owns the policies every remote provider shares:
//!
//! - a bounded concurrency semaphore per client (the backpressure point for
//!   provider quotas), acquired by racing the slot against cancellation;
//! - a minimum interval between successive requests from one client,
//!   enforced with a cancellable sleep;
//! - retry with exponential backoff (1 s, 2 s, 4 s) on network errors,
//!   429s, rate-limit markers and 5xx statuses;
//! - a one-shot downgrade that drops the structured-output descriptor when a
//!   provider rejects it with a 400.
//!
//! Each phase emits a `tracing` event carrying the request id, duration and
//! the remaining context budget.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::context::Context;
use crate::error::{excerpt, PerceptionError, Result};

/// Substrings that mark a rate-limit error in provider messages and CLI output.
pub const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "rate_limit", "too many requests", "429"];

/// Whether `text` carries any rate-limit marker (case-insensitive).
pub fn contains_rate_limit_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Whether a 400 body complains about the structured-output descriptor.
pub fn mentions_schema_rejection(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("response_format") || lower.contains("json_schema") || lower.contains("responsejsonschema")
}

/// Parse a `Retry-After` header given as delta-seconds or an HTTP-date.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(secs) = raw.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(Duration::from_secs_f64(secs));
        }
    }
    let when = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// The text of an `error` payload carried in a 2xx body, when it reports a
/// rate limit. OpenRouter relays upstream 429s this way; Anthropic uses
/// `{"type": "error", "error": {"type": "rate_limit_error"}}`.
pub fn rate_limit_in_error_payload(body: &Value) -> Option<String> {
    let err = body.get("error")?;
    let text = match err {
        Value::String(s) => s.clone(),
        Value::Object(_) => ["message", "type", "code", "status"]
            .iter()
            .filter_map(|k| err.get(*k))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" "),
        _ => return None,
    };
    contains_rate_limit_marker(&text).then_some(text)
}

/// Decode a JSON body, mapping failures to [`PerceptionError::Decode`].
pub fn decode_json(provider: &str, body: &str) -> Result<Value> {
    serde_json::from_str(body).map_err(|e| PerceptionError::decode(provider, e.to_string(), body))
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base, 2×base, 4×base, ...
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_delay * 2u32.pow(exp)
    }

    /// Sum of all backoff delays when every retry is used.
    pub fn total_backoff(&self) -> Duration {
        (1..=self.max_retries).map(|r| self.backoff(r)).sum()
    }
}

// ---------------------------------------------------------------------------
// Request gate
// ---------------------------------------------------------------------------

/// Per-client concurrency cap and inter-request pacing.
#[derive(Debug)]
pub struct RequestGate {
    provider: String,
    semaphore: Option<Arc<Semaphore>>,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestGate {
    pub fn new(provider: impl Into<String>, max_concurrent: usize, min_interval: Duration) -> Self {
        Self {
            provider: provider.into(),
            semaphore: (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent))),
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// Drop the semaphore when an external scheduler owns concurrency.
    pub fn without_semaphore(mut self) -> Self {
        self.semaphore = None;
        self
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn available_permits(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }

    /// Wait for a concurrency slot, or fail when the context ends first.
    pub async fn acquire(&self, ctx: &Context, request_id: &str) -> Result<Option<OwnedSemaphorePermit>> {
        let Some(semaphore) = self.semaphore.clone() else {
            return Ok(None);
        };
        let started = Instant::now();
        let permit = ctx
            .run(semaphore.acquire_owned())
            .await
            .map_err(|e| {
                tracing::warn!(
                    request_id,
                    provider = %self.provider,
                    phase = "semaphore_wait",
                    waited_ms = started.elapsed().as_millis() as u64,
                    "cancelled while waiting for a concurrency slot"
                );
                e
            })?
            .map_err(|_| PerceptionError::transport(&self.provider, "concurrency semaphore closed"))?;
        tracing::debug!(
            request_id,
            provider = %self.provider,
            phase = "semaphore_wait",
            duration_ms = started.elapsed().as_millis() as u64,
            ctx_remaining_ms = ctx.remaining_ms(),
            "acquired concurrency slot"
        );
        Ok(Some(permit))
    }

    /// Enforce the minimum interval since this client's previous request.
    ///
    /// The pacing lock is held across the sleep so concurrent callers are
    /// spaced out one after another.
    pub async fn pace(&self, ctx: &Context, request_id: &str) -> Result<()> {
        let mut last = ctx.run(self.last_request.lock()).await?;
        if let Some(prev) = *last {
            let since = prev.elapsed();
            if since < self.min_interval {
                let wait = self.min_interval - since;
                tracing::debug!(
                    request_id,
                    provider = %self.provider,
                    phase = "pacing_sleep",
                    duration_ms = wait.as_millis() as u64,
                    ctx_remaining_ms = ctx.remaining_ms(),
                    "pacing before request"
                );
                ctx.sleep(wait).await?;
            }
        }
        *last = Some(Instant::now());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

enum Delivered {
    Body(String),
    Open(Response),
}

/// HTTP client plus the gate and retry policy of one provider client.
#[derive(Debug)]
pub struct HttpExecutor {
    pub provider: String,
    pub client: reqwest::Client,
    pub gate: RequestGate,
    pub retry: RetryPolicy,
}

impl HttpExecutor {
    pub fn new(provider: impl Into<String>, gate: RequestGate) -> Result<Self> {
        let provider = provider.into();
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PerceptionError::Config(format!("{}: http client: {}", provider, e)))?;
        Ok(Self {
            provider,
            client,
            gate,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run a request to completion and return the body of a 2xx response.
    ///
    /// `build(use_schema)` creates a fresh request for each attempt;
    /// `use_schema` turns false after a structured-output downgrade.
    pub async fn execute<B>(&self, ctx: &Context, request_id: &str, structured: bool, build: B) -> Result<String>
    where
        B: Fn(bool) -> RequestBuilder,
    {
        match self.run(ctx, request_id, structured, &build, true).await? {
            Delivered::Body(body) => Ok(body),
            Delivered::Open(resp) => ctx
                .run(resp.text())
                .await?
                .map_err(|e| PerceptionError::transport(&self.provider, format!("body read: {}", e))),
        }
    }

    /// Like [`execute`](Self::execute) but hands back the open 2xx response
    /// for streaming. The caller keeps the returned permit for the stream's
    /// lifetime.
    pub async fn open<B>(
        &self,
        ctx: &Context,
        request_id: &str,
        structured: bool,
        build: B,
    ) -> Result<(Response, Option<OwnedSemaphorePermit>)>
    where
        B: Fn(bool) -> RequestBuilder,
    {
        let permit = self.gate.acquire(ctx, request_id).await?;
        let started = Instant::now();
        let outcome = match self.attempts(ctx, request_id, structured, &build, false).await {
            Ok(Delivered::Open(resp)) => Ok(resp),
            Ok(Delivered::Body(_)) => Err(PerceptionError::transport(
                &self.provider,
                "stream request returned a buffered body",
            )),
            Err(e) => Err(e),
        };
        self.log_outcome(ctx, request_id, started, outcome.as_ref().map(|_| ()), "stream opened");
        outcome.map(|resp| (resp, permit))
    }

    fn log_outcome(
        &self,
        ctx: &Context,
        request_id: &str,
        started: Instant,
        outcome: std::result::Result<(), &PerceptionError>,
        what: &str,
    ) {
        match outcome {
            Ok(()) => tracing::debug!(
                request_id,
                provider = %self.provider,
                phase = "success",
                duration_ms = started.elapsed().as_millis() as u64,
                ctx_remaining_ms = ctx.remaining_ms(),
                "{}",
                what
            ),
            Err(e) => tracing::warn!(
                request_id,
                provider = %self.provider,
                phase = "failure",
                duration_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "request failed"
            ),
        }
    }

    async fn run<B>(
        &self,
        ctx: &Context,
        request_id: &str,
        structured: bool,
        build: &B,
        read_body: bool,
    ) -> Result<Delivered>
    where
        B: Fn(bool) -> RequestBuilder,
    {
        let _permit = self.gate.acquire(ctx, request_id).await?;
        let started = Instant::now();
        let outcome = self.attempts(ctx, request_id, structured, build, read_body).await;
        self.log_outcome(ctx, request_id, started, outcome.as_ref().map(|_| ()), "request succeeded");
        outcome
    }

    async fn attempts<B>(
        &self,
        ctx: &Context,
        request_id: &str,
        structured: bool,
        build: &B,
        read_body: bool,
    ) -> Result<Delivered>
    where
        B: Fn(bool) -> RequestBuilder,
    {
        let provider = self.provider.as_str();
        let mut use_schema = structured;
        let mut downgraded = false;
        let mut retries = 0u32;
        let mut backoff_due = false;
        let mut last_err: Option<PerceptionError> = None;

        loop {
            if backoff_due {
                let delay = self.retry.backoff(retries);
                tracing::info!(
                    request_id,
                    provider,
                    phase = "retry",
                    attempt = retries,
                    delay_ms = delay.as_millis() as u64,
                    ctx_remaining_ms = ctx.remaining_ms(),
                    cause = %last_err.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                    "retrying after backoff"
                );
                ctx.sleep(delay).await?;
                backoff_due = false;
            }

            self.gate.pace(ctx, request_id).await?;

            let sent_at = Instant::now();
            tracing::debug!(
                request_id,
                provider,
                phase = "http_start",
                structured = use_schema,
                ctx_remaining_ms = ctx.remaining_ms(),
                "sending request"
            );
            let sent = ctx.run(build(use_schema).send()).await?;

            let failure = match sent {
                Err(e) => PerceptionError::transport(provider, e.to_string()),
                Ok(resp) => {
                    let status = resp.status();
                    tracing::debug!(
                        request_id,
                        provider,
                        phase = "http_complete",
                        status = status.as_u16(),
                        duration_ms = sent_at.elapsed().as_millis() as u64,
                        "response headers received"
                    );

                    if status.is_success() {
                        if !read_body {
                            return Ok(Delivered::Open(resp));
                        }
                        let read_at = Instant::now();
                        match ctx.run(resp.text()).await? {
                            Ok(body) => {
                                tracing::debug!(
                                    request_id,
                                    provider,
                                    phase = "body_read",
                                    bytes = body.len(),
                                    duration_ms = read_at.elapsed().as_millis() as u64,
                                    "response body read"
                                );
                                let limited = serde_json::from_str::<Value>(&body)
                                    .ok()
                                    .as_ref()
                                    .and_then(rate_limit_in_error_payload);
                                match limited {
                                    Some(message) => PerceptionError::rate_limited(
                                        provider,
                                        None,
                                        format!("error payload: {}", message),
                                    ),
                                    None => return Ok(Delivered::Body(body)),
                                }
                            }
                            Err(e) => PerceptionError::transport(provider, format!("body read: {}", e)),
                        }
                    } else {
                        let retry_after = parse_retry_after(resp.headers());
                        let body = ctx.run(resp.text()).await?.unwrap_or_default();

                        if status == StatusCode::BAD_REQUEST
                            && use_schema
                            && !downgraded
                            && mentions_schema_rejection(&body)
                        {
                            tracing::warn!(
                                request_id,
                                provider,
                                phase = "retry",
                                "structured output rejected; retrying without descriptor"
                            );
                            use_schema = false;
                            downgraded = true;
                            continue;
                        }

                        if status == StatusCode::TOO_MANY_REQUESTS || contains_rate_limit_marker(&body) {
                            PerceptionError::rate_limited(
                                provider,
                                retry_after,
                                format!("status {}: {}", status.as_u16(), excerpt(&body)),
                            )
                        } else if status.is_server_error() {
                            PerceptionError::transport(
                                provider,
                                format!("status {}: {}", status.as_u16(), excerpt(&body)),
                            )
                        } else {
                            return Err(PerceptionError::provider_status(provider, status.as_u16(), &body));
                        }
                    }
                }
            };

            if retries >= self.retry.max_retries {
                return Err(failure);
            }
            retries += 1;
            backoff_due = true;
            last_err = Some(failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.total_backoff(), Duration::from_secs(7));
    }

    #[test]
    fn test_rate_limit_markers() {
        assert!(contains_rate_limit_marker("Rate Limit exceeded"));
        assert!(contains_rate_limit_marker("error: rate_limit_error"));
        assert!(contains_rate_limit_marker("Too Many Requests"));
        assert!(contains_rate_limit_marker("HTTP 429"));
        assert!(!contains_rate_limit_marker("invalid api key"));
    }

    #[test]
    fn test_rate_limit_in_error_payload() {
        let body = serde_json::json!({"error": {"message": "Provider returned error", "code": 429}});
        assert!(rate_limit_in_error_payload(&body).is_some());
        let body = serde_json::json!({"error": "rate limit exceeded"});
        assert_eq!(rate_limit_in_error_payload(&body).as_deref(), Some("rate limit exceeded"));
        let body = serde_json::json!({"error": {"message": "invalid model", "code": 400}});
        assert!(rate_limit_in_error_payload(&body).is_none());
        let body = serde_json::json!({"choices": []});
        assert!(rate_limit_in_error_payload(&body).is_none());
    }

    #[test]
    fn test_schema_rejection() {
        assert!(mentions_schema_rejection("Invalid parameter: 'response_format' of type 'json_schema'"));
        assert!(!mentions_schema_rejection("max_tokens too large"));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_parse_retry_after_http_date_in_past() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_missing() {
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn test_decode_json_error_carries_excerpt() {
        let err = decode_json("openai", "<html>oops</html>").unwrap_err();
        match err {
            PerceptionError::Decode { raw_excerpt, .. } => assert!(raw_excerpt.contains("oops")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_semaphore_wait_cancellable() {
        let gate = RequestGate::new("test", 1, Duration::ZERO);
        let ctx = Context::background();
        let held = gate.acquire(&ctx, "r1").await.unwrap();
        assert!(held.is_some());

        let waiter = ctx.child();
        let canceller = waiter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = gate.acquire(&waiter, "r2").await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_pacing_sleep_cancellable() {
        let gate = RequestGate::new("test", 0, Duration::from_secs(30));
        let ctx = Context::background();
        gate.pace(&ctx, "r1").await.unwrap();

        let short = ctx.with_timeout(Duration::from_millis(20));
        let started = std::time::Instant::now();
        let err = gate.pace(&short, "r2").await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_disabled_semaphore() {
        let gate = RequestGate::new("test", 5, Duration::ZERO).without_semaphore();
        assert!(gate.acquire(&Context::background(), "r").await.unwrap().is_none());
        assert_eq!(gate.available_permits(), None);
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLog {
        type Writer = CapturedLog;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn test_open_logs_terminal_phase() {
        use crate::llms::providers::testing::spawn_mock;
        use axum::{routing::get, Router};

        let captured = CapturedLog::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let url = spawn_mock(Router::new().route("/stream", get(|| async { "data: {}\n\n" }))).await;
        let exec = HttpExecutor::new("mock", RequestGate::new("mock", 2, Duration::ZERO)).unwrap();
        let ctx = Context::background();
        let (resp, permit) = exec
            .open(&ctx, "req-open", false, |_| exec.client.get(format!("{}/stream", url)))
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert!(permit.is_some());

        let out = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(out.contains("stream opened"), "log output: {}", out);
        assert!(out.contains("success"), "log output: {}", out);
        assert!(out.contains("req-open"), "log output: {}", out);
    }
}
