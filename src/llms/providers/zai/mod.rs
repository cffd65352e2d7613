//! Z.AI (GLM) client.
//!
//! Z.AI speaks the chat-completions wire shape but only supports loose
//! `json_object` mode, so the envelope schema travels in the system prompt.
//! Reasoning is requested with `thinking.type = "enabled"` and streamed back
//! as `delta.reasoning_content`. The account-wide quota is five concurrent
//! requests.

use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::Result;
use crate::llms::providers::openai::{ChatCompletionsClient, ChatDialect, ReasoningStyle};
use crate::llms::schema::SchemaTier;

pub const ZAI_DEFAULT_BASE_URL: &str = "https://api.z.ai/api/paas/v4";

/// Maximum concurrent requests allowed by the Z.AI quota.
pub const ZAI_MAX_CONCURRENT: usize = 5;

pub fn dialect() -> ChatDialect {
    ChatDialect {
        name: "zai",
        default_base_url: ZAI_DEFAULT_BASE_URL,
        extra_headers: vec![("Accept-Language", "en-US,en")],
        schema_tier: SchemaTier::JsonObject,
        max_concurrent: ZAI_MAX_CONCURRENT,
        min_interval: Duration::from_millis(600),
        reasoning: ReasoningStyle::ThinkingType,
        stream_usage: false,
    }
}

pub fn new_client(config: &ProviderConfig) -> Result<ChatCompletionsClient> {
    ChatCompletionsClient::new(dialect(), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Provider;
    use crate::llms::completer::Completer;

    #[test]
    fn test_zai_uses_json_object_and_prompt_schema() {
        let config = ProviderConfig::api(Provider::Zai, "key");
        let client = new_client(&config).unwrap();
        assert_eq!(client.provider(), "zai");
        assert_eq!(client.model(), "glm-4.6");

        let body = client.build_request_body("sys", "hi", true, true, false, true);
        assert_eq!(body["response_format"], serde_json::json!({"type": "json_object"}));
        let system = body["messages"][0]["content"].as_str().unwrap();
        assert!(system.starts_with("sys"));
        assert!(system.contains("control_packet"));
        assert_eq!(body["thinking"]["type"], "enabled");
    }

    #[test]
    fn test_zai_semaphore_can_be_disabled() {
        let mut config = ProviderConfig::api(Provider::Zai, "key");
        config.extensions.disable_semaphore = true;
        assert!(new_client(&config).is_ok());
        assert_eq!(dialect().max_concurrent, ZAI_MAX_CONCURRENT);
    }
}
