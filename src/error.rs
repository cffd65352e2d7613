//! Error taxonomy for the perception layer.
//!
//! Every fallible operation in the crate returns [`PerceptionError`]. The
//! variants mirror the public error kinds a harness needs to branch on:
//! configuration problems, cancellation, transport and provider failures,
//! and the parse/validation failures of the Piggyback protocol.

use std::time::Duration;

use thiserror::Error;

/// Maximum number of characters of a response body carried in an error.
pub const BODY_EXCERPT_LIMIT: usize = 500;

/// Errors produced by the perception layer.
#[derive(Debug, Error)]
pub enum PerceptionError {
    /// Missing or invalid configuration (for example, no API key).
    #[error("configuration error: {0}")]
    Config(String),

    /// No provider could be resolved from config or environment.
    #[error("no LLM provider configured: set a provider API key or select a CLI engine")]
    NoProvider,

    /// The context was cancelled or its deadline expired.
    #[error("operation cancelled: {reason}")]
    Cancelled { reason: String },

    /// Network-level failure talking to a provider.
    #[error("{provider} transport error: {message}")]
    Transport { provider: String, message: String },

    /// The provider signalled rate limiting (HTTP 429 or an equivalent marker).
    #[error("{provider} rate limited: {message}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
        message: String,
    },

    /// The provider answered with a non-retryable status.
    #[error("{provider} returned status {status}: {body_excerpt}")]
    Provider {
        provider: String,
        status: u16,
        body_excerpt: String,
    },

    /// The provider returned no completion text.
    #[error("{provider} returned an empty completion")]
    EmptyResponse { provider: String },

    /// The provider response could not be decoded.
    #[error("{provider} response decode failed: {message} (body: {raw_excerpt})")]
    Decode {
        provider: String,
        message: String,
        raw_excerpt: String,
    },

    /// Model output did not contain a usable Piggyback envelope.
    #[error("parse error: {0}")]
    Parse(String),

    /// A decoded structure is missing a field or holds an invalid value.
    #[error("validation error on `{field}`: {message}")]
    Validation { field: String, message: String },

    /// The symbolic kernel rejected an operation.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// The embedding engine failed or returned an unusable vector.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// An optional capability is not supported by this client.
    #[error("unsupported capability: {0}")]
    Unsupported(String),

    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Learned-pattern database error.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PerceptionError>;

impl PerceptionError {
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn transport(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn rate_limited(
        provider: impl Into<String>,
        retry_after: Option<Duration>,
        message: impl Into<String>,
    ) -> Self {
        Self::RateLimited {
            provider: provider.into(),
            retry_after,
            message: message.into(),
        }
    }

    pub fn provider_status(provider: impl Into<String>, status: u16, body: &str) -> Self {
        Self::Provider {
            provider: provider.into(),
            status,
            body_excerpt: excerpt(body),
        }
    }

    pub fn decode(provider: impl Into<String>, message: impl Into<String>, raw: &str) -> Self {
        Self::Decode {
            provider: provider.into(),
            message: message.into(),
            raw_excerpt: excerpt(raw),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether this error is (or wraps) a rate-limit signal.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Transient failures are retried by the transport executor.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::RateLimited { .. } => true,
            Self::Provider { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The provider name carried by provider-originated errors.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Transport { provider, .. }
            | Self::RateLimited { provider, .. }
            | Self::Provider { provider, .. }
            | Self::EmptyResponse { provider }
            | Self::Decode { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// The `Retry-After` hint, when the provider supplied one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Truncate `body` to [`BODY_EXCERPT_LIMIT`] characters on a char boundary.
pub fn excerpt(body: &str) -> String {
    match body.char_indices().nth(BODY_EXCERPT_LIMIT) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let body = "é".repeat(BODY_EXCERPT_LIMIT + 10);
        let out = excerpt(&body);
        assert!(out.ends_with("..."));
        assert_eq!(out.chars().count(), BODY_EXCERPT_LIMIT + 3);
    }

    #[test]
    fn test_excerpt_short_body_untouched() {
        assert_eq!(excerpt("short"), "short");
    }

    #[test]
    fn test_rate_limited_predicates() {
        let err = PerceptionError::rate_limited("claude-cli", Some(Duration::from_secs(3)), "429");
        assert!(err.is_rate_limited());
        assert!(err.is_transient());
        assert_eq!(err.provider(), Some("claude-cli"));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_provider_status_transience() {
        assert!(PerceptionError::provider_status("openai", 503, "busy").is_transient());
        assert!(!PerceptionError::provider_status("openai", 401, "bad key").is_transient());
        assert!(!PerceptionError::NoProvider.is_transient());
    }
}
