//! Provider configuration: the user config file, environment fallback, and
//! the resolved [`ProviderConfig`] the dispatcher builds clients from.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PerceptionError, Result};

/// Directory (relative to the workspace root) holding config and learned state.
pub const WORKSPACE_DIR: &str = ".perception";

/// Config file name inside [`WORKSPACE_DIR`].
pub const CONFIG_FILE: &str = "config.json";

/// Default request timeout for API engines.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(120);

/// Default timeout for CLI subprocess engines.
pub const DEFAULT_CLI_TIMEOUT: Duration = Duration::from_secs(300);

/// Environment keys consulted when the config file has no credentials,
/// in precedence order.
pub const ENV_PRECEDENCE: &[(Provider, &str)] = &[
    (Provider::Anthropic, "ANTHROPIC_API_KEY"),
    (Provider::OpenAI, "OPENAI_API_KEY"),
    (Provider::Gemini, "GEMINI_API_KEY"),
    (Provider::Xai, "XAI_API_KEY"),
    (Provider::Zai, "ZAI_API_KEY"),
    (Provider::OpenRouter, "OPENROUTER_API_KEY"),
];

/// Documentation-research key; carried along, never selects a provider.
pub const CONTEXT7_ENV: &str = "CONTEXT7_API_KEY";

// ---------------------------------------------------------------------------
// Engine / Provider
// ---------------------------------------------------------------------------

/// How completions are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Engine {
    /// Remote HTTP API.
    #[default]
    #[serde(rename = "api")]
    Api,
    /// The `claude` CLI subprocess.
    #[serde(rename = "claude-cli")]
    ClaudeCli,
    /// The `codex` CLI subprocess.
    #[serde(rename = "codex-cli")]
    CodexCli,
}

impl FromStr for Engine {
    type Err = PerceptionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "api" => Ok(Self::Api),
            "claude-cli" => Ok(Self::ClaudeCli),
            "codex-cli" => Ok(Self::CodexCli),
            other => Err(PerceptionError::Config(format!("unknown engine '{}'", other))),
        }
    }
}

impl Engine {
    pub fn is_cli(self) -> bool {
        !matches!(self, Self::Api)
    }
}

/// Remote chat completion providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    Gemini,
    Xai,
    Zai,
    #[serde(rename = "openrouter")]
    OpenRouter,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAI => "openai",
            Self::Gemini => "gemini",
            Self::Xai => "xai",
            Self::Zai => "zai",
            Self::OpenRouter => "openrouter",
        }
    }

    /// Model used when neither the config nor the caller names one.
    pub fn default_model(self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-5",
            Self::OpenAI => "gpt-4o",
            Self::Gemini => "gemini-2.5-flash",
            Self::Xai => "grok-4",
            Self::Zai => "glm-4.6",
            Self::OpenRouter => "anthropic/claude-sonnet-4.5",
        }
    }

    pub fn env_key(self) -> &'static str {
        ENV_PRECEDENCE
            .iter()
            .find(|(p, _)| *p == self)
            .map(|(_, k)| *k)
            .unwrap_or("")
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = PerceptionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAI),
            "gemini" | "google" => Ok(Self::Gemini),
            "xai" | "grok" => Ok(Self::Xai),
            "zai" | "glm" => Ok(Self::Zai),
            "openrouter" => Ok(Self::OpenRouter),
            other => Err(PerceptionError::Config(format!("unknown provider '{}'", other))),
        }
    }
}

// ---------------------------------------------------------------------------
// User config file
// ---------------------------------------------------------------------------

/// Settings block for a CLI engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliSettings {
    #[serde(default)]
    pub model: Option<String>,
    /// Timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// The JSON configuration file at `<workspace>/.perception/config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// API request timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub gemini_api_key: Option<String>,
    #[serde(default)]
    pub xai_api_key: Option<String>,
    #[serde(default)]
    pub zai_api_key: Option<String>,
    #[serde(default)]
    pub openrouter_api_key: Option<String>,
    #[serde(default)]
    pub context7_api_key: Option<String>,
    #[serde(default)]
    pub claude_cli: Option<CliSettings>,
    #[serde(default)]
    pub codex_cli: Option<CliSettings>,
}

impl UserConfig {
    /// `<workspace>/.perception/config.json`
    pub fn default_path(workspace: &Path) -> PathBuf {
        workspace.join(WORKSPACE_DIR).join(CONFIG_FILE)
    }

    /// Load the config file. A missing file yields `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| PerceptionError::Config(format!("{}: {}", path.display(), e)))
    }

    /// The key stored in the file for `provider`, ignoring blanks.
    pub fn key_for(&self, provider: Provider) -> Option<&str> {
        let key = match provider {
            Provider::Anthropic => &self.anthropic_api_key,
            Provider::OpenAI => &self.openai_api_key,
            Provider::Gemini => &self.gemini_api_key,
            Provider::Xai => &self.xai_api_key,
            Provider::Zai => &self.zai_api_key,
            Provider::OpenRouter => &self.openrouter_api_key,
        };
        key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Resolved config
// ---------------------------------------------------------------------------

/// Provider-specific knobs beyond the common fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderExtensions {
    /// Override the provider base URL (proxies, tests).
    pub base_url: Option<String>,
    /// Skip the client's concurrency semaphore when an external scheduler owns it.
    pub disable_semaphore: bool,
    /// Ask for model thinking/reasoning where supported.
    pub enable_thinking: bool,
    pub max_tokens: Option<u32>,
    /// Override the CLI binary name/path.
    pub cli_binary: Option<String>,
    pub context7_api_key: Option<String>,
}

/// A fully resolved provider selection.
#[derive(Clone, PartialEq)]
pub struct ProviderConfig {
    pub engine: Engine,
    /// `None` for CLI engines.
    pub provider: Option<Provider>,
    pub api_key: String,
    pub model: Option<String>,
    pub timeout: Duration,
    pub extensions: ProviderExtensions,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("engine", &self.engine)
            .field("provider", &self.provider)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "<redacted>" })
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .field("extensions", &self.extensions)
            .finish()
    }
}

impl ProviderConfig {
    /// An API config for `provider` with the given key.
    pub fn api(provider: Provider, api_key: impl Into<String>) -> Self {
        Self {
            engine: Engine::Api,
            provider: Some(provider),
            api_key: api_key.into(),
            model: None,
            timeout: DEFAULT_API_TIMEOUT,
            extensions: ProviderExtensions::default(),
        }
    }

    /// A CLI config; no key required.
    pub fn cli(engine: Engine) -> Self {
        Self {
            engine,
            provider: None,
            api_key: String::new(),
            model: None,
            timeout: DEFAULT_CLI_TIMEOUT,
            extensions: ProviderExtensions::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.extensions.base_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The model to use, falling back to the provider default.
    pub fn model_or_default(&self) -> String {
        match (&self.model, self.provider) {
            (Some(m), _) if !m.is_empty() => m.clone(),
            (_, Some(p)) => p.default_model().to_string(),
            _ => String::new(),
        }
    }
}

/// Resolve a provider from the config file and the process environment.
pub fn resolve_provider(user: Option<&UserConfig>) -> Result<ProviderConfig> {
    resolve_provider_with(user, |key| std::env::var(key).ok())
}

/// Resolve with an injectable environment lookup.
///
/// Precedence: CLI engine in the file, then the file's explicit provider,
/// then the first keyed provider in the file, then the environment.
pub fn resolve_provider_with<F>(user: Option<&UserConfig>, env: F) -> Result<ProviderConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let env_key = |name: &str| env(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let context7 = user
        .and_then(|u| u.context7_api_key.clone())
        .filter(|k| !k.trim().is_empty())
        .or_else(|| env_key(CONTEXT7_ENV));

    let mut resolved = match user {
        Some(cfg) => resolve_from_file(cfg, &env_key)?,
        None => None,
    };

    if resolved.is_none() {
        resolved = ENV_PRECEDENCE.iter().find_map(|(provider, key)| {
            env_key(key).map(|k| ProviderConfig::api(*provider, k))
        });
        if let (Some(cfg), Some(user)) = (resolved.as_mut(), user) {
            apply_common(cfg, user);
        }
    }

    let mut cfg = resolved.ok_or(PerceptionError::NoProvider)?;
    cfg.extensions.context7_api_key = context7;
    log::debug!(
        "resolved provider: engine={:?} provider={:?} model={:?}",
        cfg.engine,
        cfg.provider,
        cfg.model
    );
    Ok(cfg)
}

fn resolve_from_file<F>(user: &UserConfig, env_key: &F) -> Result<Option<ProviderConfig>>
where
    F: Fn(&str) -> Option<String>,
{
    let engine = match user.engine.as_deref() {
        Some(e) => e.parse::<Engine>()?,
        None => Engine::Api,
    };

    if engine.is_cli() {
        let settings = match engine {
            Engine::ClaudeCli => user.claude_cli.clone(),
            _ => user.codex_cli.clone(),
        }
        .unwrap_or_default();
        let mut cfg = ProviderConfig::cli(engine);
        cfg.model = settings.model.or_else(|| user.model.clone());
        if let Some(secs) = settings.timeout.filter(|s| *s > 0) {
            cfg.timeout = Duration::from_secs(secs);
        }
        return Ok(Some(cfg));
    }

    if let Some(name) = user.provider.as_deref().filter(|p| !p.trim().is_empty()) {
        let provider: Provider = name.parse()?;
        let key = user
            .key_for(provider)
            .map(str::to_string)
            .or_else(|| env_key(provider.env_key()));
        return match key {
            Some(key) => {
                let mut cfg = ProviderConfig::api(provider, key);
                apply_common(&mut cfg, user);
                Ok(Some(cfg))
            }
            None => Err(PerceptionError::Config(format!(
                "provider '{}' selected but no API key found (set {} or {}_api_key)",
                provider,
                provider.env_key(),
                provider.as_str()
            ))),
        };
    }

    let from_file = ENV_PRECEDENCE
        .iter()
        .find_map(|(provider, _)| user.key_for(*provider).map(|k| ProviderConfig::api(*provider, k)));
    Ok(from_file.map(|mut cfg| {
        apply_common(&mut cfg, user);
        cfg
    }))
}

fn apply_common(cfg: &mut ProviderConfig, user: &UserConfig) {
    if let Some(model) = user.model.as_ref().filter(|m| !m.is_empty()) {
        cfg.model = Some(model.clone());
    }
    if let Some(secs) = user.timeout.filter(|s| *s > 0) {
        cfg.timeout = Duration::from_secs(secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_env_precedence_order() {
        let env = env_of(&[("OPENROUTER_API_KEY", "or"), ("GEMINI_API_KEY", "gm")]);
        let cfg = resolve_provider_with(None, env).unwrap();
        assert_eq!(cfg.provider, Some(Provider::Gemini));
        assert_eq!(cfg.api_key, "gm");
    }

    #[test]
    fn test_no_provider() {
        let err = resolve_provider_with(None, env_of(&[])).unwrap_err();
        assert!(matches!(err, PerceptionError::NoProvider));
    }

    #[test]
    fn test_context7_never_selects_provider() {
        let err = resolve_provider_with(None, env_of(&[("CONTEXT7_API_KEY", "c7")])).unwrap_err();
        assert!(matches!(err, PerceptionError::NoProvider));
    }

    #[test]
    fn test_cli_engine_needs_no_key() {
        let user = UserConfig {
            engine: Some("claude-cli".into()),
            claude_cli: Some(CliSettings {
                model: Some("sonnet".into()),
                timeout: Some(42),
            }),
            ..Default::default()
        };
        let cfg = resolve_provider_with(Some(&user), env_of(&[])).unwrap();
        assert_eq!(cfg.engine, Engine::ClaudeCli);
        assert_eq!(cfg.model.as_deref(), Some("sonnet"));
        assert_eq!(cfg.timeout, Duration::from_secs(42));
        assert!(cfg.api_key.is_empty());
    }

    #[test]
    fn test_file_key_beats_env() {
        let user = UserConfig {
            openai_api_key: Some("file-key".into()),
            model: Some("gpt-4.1".into()),
            ..Default::default()
        };
        let env = env_of(&[("ANTHROPIC_API_KEY", "env-key")]);
        let cfg = resolve_provider_with(Some(&user), env).unwrap();
        assert_eq!(cfg.provider, Some(Provider::OpenAI));
        assert_eq!(cfg.api_key, "file-key");
        assert_eq!(cfg.model_or_default(), "gpt-4.1");
    }

    #[test]
    fn test_explicit_provider_uses_env_key() {
        let user = UserConfig {
            provider: Some("zai".into()),
            ..Default::default()
        };
        let env = env_of(&[("ANTHROPIC_API_KEY", "a"), ("ZAI_API_KEY", "z")]);
        let cfg = resolve_provider_with(Some(&user), env).unwrap();
        assert_eq!(cfg.provider, Some(Provider::Zai));
        assert_eq!(cfg.api_key, "z");
    }

    #[test]
    fn test_explicit_provider_without_key_is_config_error() {
        let user = UserConfig {
            provider: Some("xai".into()),
            ..Default::default()
        };
        let err = resolve_provider_with(Some(&user), env_of(&[])).unwrap_err();
        assert!(matches!(err, PerceptionError::Config(_)));
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = UserConfig::default_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{"provider":"gemini","gemini_api_key":"k","engine":"","codex_cli":{"model":"o4","timeout":9},"extra":1}"#,
        )
        .unwrap();
        let cfg = UserConfig::load(&path).unwrap().unwrap();
        assert_eq!(cfg.provider.as_deref(), Some("gemini"));
        assert_eq!(cfg.codex_cli.unwrap().timeout, Some(9));
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(UserConfig::load(&dir.path().join("nope.json")).unwrap().is_none());
    }

    #[test]
    fn test_debug_redacts_key() {
        let cfg = ProviderConfig::api(Provider::OpenAI, "sk-secret");
        assert!(!format!("{:?}", cfg).contains("sk-secret"));
    }
}
