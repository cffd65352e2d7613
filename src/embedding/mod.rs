//! Embedding engine interface.
//!
//! The semantic classifier needs two things from an embedding backend: a
//! vector per text and cosine similarity between vectors. Engines that
//! understand retrieval task hints (query vs. document) advertise it through
//! [`EmbeddingEngine::supports_task_hints`].

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;

pub mod genai;

pub use genai::GenAiEmbedder;

/// Task hint for embedding a user query.
pub const TASK_RETRIEVAL_QUERY: &str = "RETRIEVAL_QUERY";
/// Task hint for embedding a stored exemplar.
pub const TASK_RETRIEVAL_DOCUMENT: &str = "RETRIEVAL_DOCUMENT";

#[async_trait]
pub trait EmbeddingEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Length of every vector this engine returns.
    fn dimensions(&self) -> usize;

    async fn embed(&self, ctx: &Context, text: &str) -> Result<Vec<f32>>;

    fn supports_task_hints(&self) -> bool {
        false
    }

    /// Embed with a retrieval task hint; engines without hints ignore it.
    async fn embed_with_task(&self, ctx: &Context, text: &str, _task: &str) -> Result<Vec<f32>> {
        self.embed(ctx, text).await
    }
}

/// Cosine similarity of two vectors; 0.0 when lengths differ or either is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic embedder for tests.

    use super::*;
    use crate::error::PerceptionError;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Hashes words into buckets, so texts sharing words score high.
    #[derive(Debug)]
    pub struct BagOfWordsEmbedder {
        pub dims: usize,
        pub task_hints: bool,
        pub fail: AtomicBool,
    }

    impl BagOfWordsEmbedder {
        pub fn new(dims: usize) -> Self {
            Self {
                dims,
                task_hints: false,
                fail: AtomicBool::new(false),
            }
        }
    }

    fn bucket(word: &str, dims: usize) -> usize {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in word.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h % dims as u64) as usize
    }

    #[async_trait]
    impl EmbeddingEngine for BagOfWordsEmbedder {
        fn name(&self) -> &str {
            "bag-of-words"
        }

        fn dimensions(&self) -> usize {
            self.dims
        }

        async fn embed(&self, ctx: &Context, text: &str) -> Result<Vec<f32>> {
            ctx.check()?;
            if self.fail.load(Ordering::SeqCst) {
                return Err(PerceptionError::Embedding("engine offline".into()));
            }
            let mut v = vec![0.0f32; self.dims];
            for word in text
                .to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
            {
                v[bucket(word, self.dims)] += 1.0;
            }
            Ok(v)
        }

        fn supports_task_hints(&self) -> bool {
            self.task_hints
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_bag_of_words_similarity() {
        let e = testing::BagOfWordsEmbedder::new(128);
        let ctx = Context::background();
        let a = e.embed(&ctx, "review my code").await.unwrap();
        let b = e.embed(&ctx, "please review my code").await.unwrap();
        let c = e.embed(&ctx, "delete everything").await.unwrap();
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }
}
