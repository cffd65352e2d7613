//! LLM access for the perception layer.
//!
//! - [`completer`] - the uniform `Completer` trait and optional capabilities
//! - [`transport`] - concurrency gate, pacing, retry and downgrade
//! - [`streaming`] - SSE decoding and the thought-first surface gate
//! - [`schema`] - Piggyback envelope schema and provider dialects
//! - [`providers`] - concrete clients (chat-completions family, Anthropic, Gemini, Z.AI, CLI)
//! - [`dispatcher`] - config to client

pub mod completer;
pub mod dispatcher;
pub mod providers;
pub mod schema;
pub mod streaming;
pub mod transport;

pub use completer::{Completer, StreamingCompleter, StructuredCompleter, TokenUsage};
pub use dispatcher::new_completer;
pub use streaming::{CompletionStream, StreamChunk, StreamOutcome, SurfaceGate};
