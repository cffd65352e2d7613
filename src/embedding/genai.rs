//! Gemini `embedContent` engine.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::context::Context;
use crate::error::{PerceptionError, Result};
use crate::llms::completer::generate_request_id;
use crate::llms::transport::{decode_json, HttpExecutor, RequestGate, RetryPolicy};

use super::{EmbeddingEngine, TASK_RETRIEVAL_DOCUMENT};

pub const DEFAULT_EMBEDDING_MODEL: &str = "gemini-embedding-001";
pub const DEFAULT_DIMENSIONS: usize = 768;
pub const GENAI_DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug)]
pub struct GenAiEmbedder {
    api_key: String,
    model: String,
    dimensions: usize,
    base_url: String,
    timeout: Duration,
    http: HttpExecutor,
}

impl GenAiEmbedder {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(PerceptionError::Config("gemini API key is required for embeddings".into()));
        }
        Ok(Self {
            api_key,
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimensions: DEFAULT_DIMENSIONS,
            base_url: GENAI_DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            http: HttpExecutor::new("genai-embed", RequestGate::new("genai-embed", 8, Duration::ZERO))?,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.http.retry = retry;
        self
    }

    pub fn build_request_body(&self, text: &str, task: &str) -> Value {
        json!({
            "model": format!("models/{}", self.model),
            "content": {"parts": [{"text": text}]},
            "taskType": task,
            "outputDimensionality": self.dimensions,
        })
    }

    fn parse_response(&self, raw: &str) -> Result<Vec<f32>> {
        let value = decode_json("genai-embed", raw)?;
        let values = value
            .pointer("/embedding/values")
            .and_then(Value::as_array)
            .ok_or_else(|| PerceptionError::Embedding("response has no embedding values".into()))?;
        let vector: Vec<f32> = values.iter().filter_map(Value::as_f64).map(|v| v as f32).collect();
        if vector.len() != self.dimensions {
            return Err(PerceptionError::Embedding(format!(
                "expected {} dimensions, got {}",
                self.dimensions,
                vector.len()
            )));
        }
        Ok(vector)
    }
}

#[async_trait]
impl EmbeddingEngine for GenAiEmbedder {
    fn name(&self) -> &str {
        "genai"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, ctx: &Context, text: &str) -> Result<Vec<f32>> {
        self.embed_with_task(ctx, text, TASK_RETRIEVAL_DOCUMENT).await
    }

    fn supports_task_hints(&self) -> bool {
        true
    }

    async fn embed_with_task(&self, ctx: &Context, text: &str, task: &str) -> Result<Vec<f32>> {
        let ctx = ctx.with_timeout(self.timeout);
        let request_id = generate_request_id("genai-embed");
        let url = format!("{}/models/{}:embedContent", self.base_url, self.model);
        let body = self.build_request_body(text, task);
        let raw = self
            .http
            .execute(&ctx, &request_id, false, |_| {
                self.http
                    .client
                    .post(&url)
                    .header("x-goog-api-key", self.api_key.as_str())
                    .json(&body)
            })
            .await?;
        self.parse_response(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llms::providers::testing::{fast_retry, spawn_mock};
    use axum::routing::post;
    use axum::Router;

    #[test]
    fn test_request_body_carries_task_type() {
        let e = GenAiEmbedder::new("k").unwrap().with_dimensions(4);
        let body = e.build_request_body("hello", "RETRIEVAL_QUERY");
        assert_eq!(body["taskType"], "RETRIEVAL_QUERY");
        assert_eq!(body["outputDimensionality"], 4);
        assert_eq!(body["model"], "models/gemini-embedding-001");
    }

    #[tokio::test]
    async fn test_embed_checks_dimensions() {
        let router = Router::new().route(
            "/models/:model",
            post(|body: String| async move {
                if body.contains("RETRIEVAL_QUERY") {
                    json!({"embedding": {"values": [0.1, 0.2, 0.3]}}).to_string()
                } else {
                    json!({"embedding": {"values": [0.1, 0.2]}}).to_string()
                }
            }),
        );
        let base = spawn_mock(router).await;
        let e = GenAiEmbedder::new("k")
            .unwrap()
            .with_dimensions(3)
            .with_base_url(base)
            .with_retry(fast_retry());
        let ctx = Context::background();
        let v = e.embed_with_task(&ctx, "q", "RETRIEVAL_QUERY").await.unwrap();
        assert_eq!(v.len(), 3);
        let err = e.embed(&ctx, "doc").await.unwrap_err();
        assert!(matches!(err, PerceptionError::Embedding(_)));
    }
}
