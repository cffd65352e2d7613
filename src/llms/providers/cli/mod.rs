//! Subprocess-backed completion clients (Claude CLI, Codex CLI).
//!
//! Each call runs one external process with the prompt as an argument and
//! parses its stdout. The child is killed when the context is cancelled or
//! its deadline passes.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::config::{Engine, ProviderConfig};
use crate::context::Context;
use crate::error::{excerpt, PerceptionError, Result};
use crate::llms::completer::{generate_request_id, ClientState, Completer};
use crate::llms::transport::contains_rate_limit_marker;

pub const CLAUDE_BINARY: &str = "claude";
pub const CODEX_BINARY: &str = "codex";
pub const CLAUDE_DEFAULT_MODEL: &str = "sonnet";
pub const CODEX_DEFAULT_MODEL: &str = "gpt-5-codex";

/// Which CLI dialect a client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliKind {
    Claude,
    Codex,
}

impl CliKind {
    /// Provider name used in errors and logs.
    pub fn provider(self) -> &'static str {
        match self {
            Self::Claude => "claude-cli",
            Self::Codex => "codex-cli",
        }
    }

    fn default_binary(self) -> &'static str {
        match self {
            Self::Claude => CLAUDE_BINARY,
            Self::Codex => CODEX_BINARY,
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            Self::Claude => CLAUDE_DEFAULT_MODEL,
            Self::Codex => CODEX_DEFAULT_MODEL,
        }
    }
}

#[derive(Debug)]
pub struct CliClient {
    kind: CliKind,
    binary: String,
    state: ClientState,
    timeout: Duration,
}

impl CliClient {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let kind = match config.engine {
            Engine::ClaudeCli => CliKind::Claude,
            Engine::CodexCli => CliKind::Codex,
            Engine::Api => {
                return Err(PerceptionError::Config("CLI client requires a CLI engine".into()));
            }
        };
        let model = config
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| kind.default_model().to_string());
        Ok(Self {
            kind,
            binary: config
                .extensions
                .cli_binary
                .clone()
                .unwrap_or_else(|| kind.default_binary().to_string()),
            state: ClientState::new(model),
            timeout: config.timeout,
        })
    }

    pub fn kind(&self) -> CliKind {
        self.kind
    }

    /// Command-line arguments for one call.
    pub fn args(&self, prompt: &str) -> Vec<String> {
        let model = self.state.model();
        match self.kind {
            CliKind::Claude => vec![
                "-p".into(),
                prompt.into(),
                "--output-format".into(),
                "json".into(),
                "--model".into(),
                model,
            ],
            CliKind::Codex => vec![
                "exec".into(),
                "--skip-git-repo-check".into(),
                "--model".into(),
                model,
                prompt.into(),
            ],
        }
    }

    async fn run(&self, ctx: &Context, prompt: &str) -> Result<String> {
        let ctx = ctx.with_timeout(self.timeout);
        let provider = self.kind.provider();
        let request_id = generate_request_id(provider);
        let started = tokio::time::Instant::now();

        let child = Command::new(&self.binary)
            .args(self.args(prompt))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PerceptionError::transport(provider, format!("failed to start {}: {}", self.binary, e)))?;

        tracing::debug!(
            request_id = %request_id,
            provider,
            phase = "http_start",
            binary = %self.binary,
            ctx_remaining_ms = ctx.remaining_ms(),
            "cli process started"
        );

        let output = ctx
            .run(child.wait_with_output())
            .await?
            .map_err(|e| PerceptionError::transport(provider, format!("cli wait: {}", e)))?;

        tracing::debug!(
            request_id = %request_id,
            provider,
            phase = "http_complete",
            status = output.status.code().unwrap_or(-1),
            duration_ms = started.elapsed().as_millis() as u64,
            "cli process finished"
        );

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let parsed = match self.kind {
            CliKind::Claude => parse_claude_output(&stdout, &stderr),
            CliKind::Codex => parse_codex_output(&stdout, &stderr),
        };
        match parsed {
            Err(e) if !output.status.success() && !e.is_rate_limited() => Err(PerceptionError::transport(
                provider,
                format!(
                    "{} exited with {}: {}",
                    self.binary,
                    output.status,
                    excerpt(stderr.trim())
                ),
            )),
            other => other,
        }
    }
}

fn rate_limited(provider: &str, message: &str) -> PerceptionError {
    PerceptionError::rate_limited(provider, None, excerpt(message))
}

/// Parse `claude -p --output-format json` stdout.
///
/// `result` may be a plain string or `{content: [{type, text}, ...]}`; text
/// entries are concatenated. Rate limiting is detected from
/// `is_rate_limited`, the `error` object, or markers on stderr.
pub fn parse_claude_output(stdout: &str, stderr: &str) -> Result<String> {
    const PROVIDER: &str = "claude-cli";
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        if contains_rate_limit_marker(stderr) {
            return Err(rate_limited(PROVIDER, stderr));
        }
        return Err(PerceptionError::EmptyResponse {
            provider: PROVIDER.into(),
        });
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            if contains_rate_limit_marker(stderr) {
                return Err(rate_limited(PROVIDER, stderr));
            }
            return Err(PerceptionError::decode(PROVIDER, e.to_string(), trimmed));
        }
    };

    if value.get("is_rate_limited").and_then(Value::as_bool).unwrap_or(false) {
        return Err(rate_limited(PROVIDER, "is_rate_limited"));
    }
    if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
        let kind = err.get("type").and_then(Value::as_str).unwrap_or("");
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        let combined = format!("{}: {}", kind, message);
        if contains_rate_limit_marker(&combined) || contains_rate_limit_marker(stderr) {
            return Err(rate_limited(PROVIDER, &combined));
        }
        return Err(PerceptionError::transport(PROVIDER, combined));
    }

    let text = match value.get("result") {
        Some(Value::String(s)) => s.clone(),
        Some(result) => result
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<String>()
            })
            .unwrap_or_default(),
        None => String::new(),
    };

    if value.get("is_error").and_then(Value::as_bool).unwrap_or(false) {
        if contains_rate_limit_marker(&text) || contains_rate_limit_marker(stderr) {
            return Err(rate_limited(PROVIDER, &text));
        }
        return Err(PerceptionError::transport(PROVIDER, excerpt(&text)));
    }

    let text = text.trim().to_string();
    if text.is_empty() {
        if contains_rate_limit_marker(stderr) {
            return Err(rate_limited(PROVIDER, stderr));
        }
        return Err(PerceptionError::EmptyResponse {
            provider: PROVIDER.into(),
        });
    }
    Ok(text)
}

/// Parse `codex exec` stdout.
///
/// Accepts a JSON object with one of `result`, `output`, `text`, or
/// `message`, JSON-lines where the last line carrying one of those wins,
/// or plain text.
pub fn parse_codex_output(stdout: &str, stderr: &str) -> Result<String> {
    const PROVIDER: &str = "codex-cli";
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        if contains_rate_limit_marker(stderr) {
            return Err(rate_limited(PROVIDER, stderr));
        }
        return Err(PerceptionError::EmptyResponse {
            provider: PROVIDER.into(),
        });
    }

    let pick = |v: &Value| -> Option<String> {
        ["result", "output", "text", "message"]
            .iter()
            .find_map(|k| v.get(*k).and_then(Value::as_str))
            .map(str::to_string)
    };

    let text = if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        pick(&v).unwrap_or_else(|| trimmed.to_string())
    } else {
        trimmed
            .lines()
            .filter_map(|l| serde_json::from_str::<Value>(l.trim()).ok())
            .filter_map(|v| pick(&v))
            .last()
            .unwrap_or_else(|| trimmed.to_string())
    };
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(PerceptionError::EmptyResponse {
            provider: PROVIDER.into(),
        });
    }
    Ok(text)
}

#[async_trait]
impl Completer for CliClient {
    fn provider(&self) -> &str {
        self.kind.provider()
    }

    fn model(&self) -> String {
        self.state.model()
    }

    fn set_model(&self, model: &str) {
        self.state.set_model(model);
    }

    async fn complete_with_system(&self, ctx: &Context, system: &str, user: &str) -> Result<String> {
        let prompt = if system.is_empty() {
            user.to_string()
        } else {
            format!("{}\n\n{}", system, user)
        };
        self.run(ctx, &prompt).await
    }
}
