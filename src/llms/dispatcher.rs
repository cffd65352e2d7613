//! Construct a [`Completer`] from a resolved [`ProviderConfig`].

use std::sync::Arc;

use crate::config::{self, Engine, Provider, ProviderConfig, UserConfig};
use crate::error::{PerceptionError, Result};
use crate::llms::completer::Completer;
use crate::llms::providers::anthropic::AnthropicClient;
use crate::llms::providers::cli::CliClient;
use crate::llms::providers::gemini::GeminiClient;
use crate::llms::providers::openai::{ChatCompletionsClient, ChatDialect};

/// Build the client for `config`.
pub fn new_completer(config: &ProviderConfig) -> Result<Arc<dyn Completer>> {
    if config.engine.is_cli() {
        log::info!("using {:?} engine", config.engine);
        return Ok(Arc::new(CliClient::new(config)?));
    }

    let provider = config.provider.ok_or(PerceptionError::NoProvider)?;
    log::info!("using {} provider, model {}", provider, config.model_or_default());
    let client: Arc<dyn Completer> = match provider {
        Provider::Anthropic => Arc::new(AnthropicClient::new(config)?),
        Provider::Gemini => Arc::new(GeminiClient::new(config)?),
        Provider::OpenAI | Provider::Xai | Provider::OpenRouter | Provider::Zai => {
            let dialect = ChatDialect::for_provider(provider).ok_or_else(|| {
                PerceptionError::Config(format!("{} has no chat-completions dialect", provider))
            })?;
            Arc::new(ChatCompletionsClient::new(dialect, config)?)
        }
    };
    Ok(client)
}

/// Resolve config from the user file and environment, then build the client.
pub fn completer_from_user_config(user: Option<&UserConfig>) -> Result<Arc<dyn Completer>> {
    let resolved = config::resolve_provider(user)?;
    new_completer(&resolved)
}

/// Whether `config` can be built without a key (CLI engines).
pub fn requires_api_key(config: &ProviderConfig) -> bool {
    config.engine == Engine::Api
}
