//! Request context: cooperative cancellation plus an optional deadline.
//!
//! Every suspension point in the layer (semaphore waits, pacing and backoff
//! sleeps, HTTP IO, SSE reads, subprocess execution, kernel and embedding
//! calls) takes a `&Context` and aborts with [`PerceptionError::Cancelled`]
//! when the token fires or the deadline passes.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{PerceptionError, Result};

const REASON_CANCELED: &str = "context canceled";
const REASON_DEADLINE: &str = "deadline exceeded";

/// A cancellation scope handed down through every blocking call.
///
/// Children derived with [`Context::child`] or [`Context::with_timeout`]
/// are cancelled together with their parent; cancelling a child never
/// affects the parent.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A root context that is never cancelled unless [`cancel`](Self::cancel) is called.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Wrap an existing token, e.g. one owned by the harness.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derive a child that shares this context's deadline.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child whose deadline is `timeout` from now, or the parent's
    /// deadline if that is earlier.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Remaining time in milliseconds for log fields (`-1` means unbounded).
    pub fn remaining_ms(&self) -> i64 {
        self.remaining()
            .map(|d| d.as_millis() as i64)
            .unwrap_or(-1)
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The cancellation error, if this context is already done.
    pub fn err(&self) -> Option<PerceptionError> {
        if self.token.is_cancelled() {
            return Some(PerceptionError::cancelled(REASON_CANCELED));
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(PerceptionError::cancelled(REASON_DEADLINE)),
            _ => None,
        }
    }

    /// Fail fast if the context is already done.
    pub fn check(&self) -> Result<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves when the token fires or the deadline passes.
    pub async fn done(&self) -> PerceptionError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => PerceptionError::cancelled(REASON_CANCELED),
                    _ = tokio::time::sleep_until(deadline) => PerceptionError::cancelled(REASON_DEADLINE),
                }
            }
            None => {
                self.token.cancelled().await;
                PerceptionError::cancelled(REASON_CANCELED)
            }
        }
    }

    /// Run `fut` unless the context finishes first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }

    /// Like [`run`](Self::run) for futures that already return a `Result`.
    pub async fn run_result<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.run(fut).await?
    }

    /// Cancellable sleep. Returns early with `Cancelled` if the context ends.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return self.check();
        }
        self.run(tokio::time::sleep(duration)).await
    }
}
