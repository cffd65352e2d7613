//! The uniform completion interface every provider client implements.
//!
//! [`Completer`] is the minimum capability set the transducer programs
//! against. Streaming and provider-constrained structured output are
//! optional capabilities, discovered at runtime through
//! [`Completer::streaming`] and [`Completer::structured`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::Context;
use crate::error::Result;
use crate::llms::streaming::CompletionStream;

// ---------------------------------------------------------------------------
// Request ids
// ---------------------------------------------------------------------------

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A unique id for one completion call, used to correlate log events.
///
/// The short sequence prefix keeps interleaved logs readable; the UUID
/// suffix keeps ids unique across processes.
pub fn generate_request_id(provider: &str) -> String {
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", provider, seq, &uuid[..8])
}

// ---------------------------------------------------------------------------
// Token usage
// ---------------------------------------------------------------------------

/// Cumulative token counters for one client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cached_prompt_tokens: i64,
    pub successful_requests: i64,
}

impl TokenUsage {
    /// Accumulate a provider usage block.
    ///
    /// Accepts OpenAI (`prompt_tokens`), Anthropic (`input_tokens`) and
    /// Gemini (`promptTokenCount`) field names.
    pub fn record(&mut self, usage: &Value) {
        let int = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| usage.get(*k).and_then(Value::as_i64))
                .unwrap_or(0)
        };
        let prompt = int(&["prompt_tokens", "input_tokens", "promptTokenCount"]);
        let completion = int(&["completion_tokens", "output_tokens", "candidatesTokenCount"]);
        let cached = int(&[
            "cached_tokens",
            "cache_read_input_tokens",
            "cachedContentTokenCount",
        ]);

        self.prompt_tokens += prompt;
        self.completion_tokens += completion;
        self.total_tokens += prompt + completion;
        self.cached_prompt_tokens += cached;
        self.successful_requests += 1;
    }
}

// ---------------------------------------------------------------------------
// Shared client state
// ---------------------------------------------------------------------------

/// State every client carries: its model name and usage counters.
///
/// Interior mutability lets `set_model` work through an `Arc<dyn Completer>`.
#[derive(Debug, Default)]
pub struct ClientState {
    model: RwLock<String>,
    usage: Mutex<TokenUsage>,
}

impl ClientState {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: RwLock::new(model.into()),
            usage: Mutex::new(TokenUsage::default()),
        }
    }

    pub fn model(&self) -> String {
        self.model.read().clone()
    }

    pub fn set_model(&self, model: &str) {
        *self.model.write() = model.to_string();
    }

    pub fn record_usage(&self, usage: &Value) {
        self.usage.lock().record(usage);
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Uniform completion interface over every provider.
#[async_trait]
pub trait Completer: Send + Sync + fmt::Debug {
    /// Provider name used in errors and logs (`"anthropic"`, `"claude-cli"`, ...).
    fn provider(&self) -> &str;

    fn model(&self) -> String;

    fn set_model(&self, model: &str);

    /// Cumulative token usage for this client.
    fn usage(&self) -> TokenUsage {
        TokenUsage::default()
    }

    /// Single-shot completion with an empty system prompt.
    async fn complete(&self, ctx: &Context, prompt: &str) -> Result<String> {
        self.complete_with_system(ctx, "", prompt).await
    }

    /// The primary entry point.
    async fn complete_with_system(&self, ctx: &Context, system: &str, user: &str) -> Result<String>;

    /// Streaming capability, if the client supports it.
    fn streaming(&self) -> Option<&dyn StreamingCompleter> {
        None
    }

    /// Provider-constrained structured output capability, if supported.
    fn structured(&self) -> Option<&dyn StructuredCompleter> {
        None
    }
}

/// Clients that can stream incremental output.
#[async_trait]
pub trait StreamingCompleter: Send + Sync {
    /// Start a streaming completion.
    ///
    /// The returned stream yields surface-text chunks only; its
    /// [`CompletionStream::finish`] returns the full raw completion.
    async fn complete_with_streaming(
        &self,
        ctx: &Context,
        system: &str,
        user: &str,
        enable_thinking: bool,
    ) -> Result<CompletionStream>;
}

/// Clients that can ask the provider to constrain output to the Piggyback schema.
#[async_trait]
pub trait StructuredCompleter: Send + Sync {
    /// Returns raw text that still has to go through the envelope parser.
    async fn complete_with_structured_output(
        &self,
        ctx: &Context,
        system: &str,
        user: &str,
        enable_thinking: bool,
    ) -> Result<String>;
}
