//! The two retrieval corpora searched by the semantic classifier.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::context::Context;
use crate::embedding::{cosine_similarity, EmbeddingEngine, TASK_RETRIEVAL_DOCUMENT};
use crate::error::{PerceptionError, Result};
use crate::kernel::{Kernel, Term};
use crate::perception::intent::normalize_verb;
use crate::perception::semantic::store::{LearnedPattern, PatternStore};
use crate::perception::semantic::{CorpusEntry, MatchSource, SemanticMatch};

/// Entries and their vectors stored side by side.
#[derive(Debug, Default, Clone)]
pub(crate) struct VectorIndex {
    entries: Vec<CorpusEntry>,
    vectors: Vec<Vec<f32>>,
}

impl VectorIndex {
    fn push(&mut self, entry: CorpusEntry, vector: Vec<f32>) {
        self.entries.push(entry);
        self.vectors.push(vector);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Top `k` entries by cosine similarity, best first, ranked 1..k.
    pub(crate) fn search(&self, query: &[f32], k: usize, source: MatchSource) -> Vec<SemanticMatch> {
        let mut scored: Vec<(usize, f64)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, cosine_similarity(query, v)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored
            .into_iter()
            .take(k)
            .enumerate()
            .map(|(rank, (i, similarity))| {
                let e = &self.entries[i];
                SemanticMatch {
                    text_content: e.text_content.clone(),
                    verb: e.verb.clone(),
                    target: e.target.clone(),
                    constraint: e.constraint.clone(),
                    similarity: similarity.clamp(0.0, 1.0),
                    rank: rank + 1,
                    source,
                }
            })
            .collect()
    }
}

async fn embed_document(ctx: &Context, engine: &dyn EmbeddingEngine, text: &str) -> Result<Vec<f32>> {
    if engine.supports_task_hints() {
        engine.embed_with_task(ctx, text, TASK_RETRIEVAL_DOCUMENT).await
    } else {
        engine.embed(ctx, text).await
    }
}

// ---------------------------------------------------------------------------
// Embedded corpus
// ---------------------------------------------------------------------------

/// Canonical phrases from `intent_definition` facts. Immutable after hydration.
#[derive(Debug)]
pub struct EmbeddedCorpus {
    index: RwLock<Arc<VectorIndex>>,
    dimensions: usize,
}

impl EmbeddedCorpus {
    pub fn new(dimensions: usize) -> Self {
        Self {
            index: RwLock::new(Arc::new(VectorIndex::default())),
            dimensions,
        }
    }

    /// Embed every `intent_definition("phrase", /verb, "target", "constraint")`
    /// fact. Phrases that fail to embed are skipped; returns the count indexed.
    pub async fn hydrate(&self, ctx: &Context, kernel: &dyn Kernel, engine: &dyn EmbeddingEngine) -> Result<usize> {
        let facts = ctx.run_result(kernel.query("intent_definition")).await?;
        let mut index = VectorIndex::default();
        for fact in &facts {
            let (Some(phrase), Some(verb)) = (fact.arg(0).and_then(Term::as_str), fact.arg(1).and_then(Term::as_str))
            else {
                log::warn!("Skipping malformed intent_definition: {}", fact);
                continue;
            };
            let vector = match embed_document(ctx, engine, phrase).await {
                Ok(v) => v,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    log::warn!("Failed to embed intent phrase {:?}: {}", phrase, e);
                    continue;
                }
            };
            if vector.len() != self.dimensions {
                log::warn!(
                    "Embedding for {:?} has {} dimensions, expected {}",
                    phrase,
                    vector.len(),
                    self.dimensions
                );
                continue;
            }
            index.push(
                CorpusEntry {
                    text_content: phrase.to_string(),
                    verb: normalize_verb(verb),
                    target: fact.arg(2).and_then(Term::as_str).unwrap_or("").to_string(),
                    constraint: fact.arg(3).and_then(Term::as_str).unwrap_or("").to_string(),
                    confidence: 1.0,
                },
                vector,
            );
        }
        let n = index.len();
        *self.index.write() = Arc::new(index);
        log::debug!("Embedded intent corpus hydrated with {} phrases", n);
        Ok(n)
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn search(&self, query: &[f32], k: usize) -> Vec<SemanticMatch> {
        self.snapshot().search(query, k, MatchSource::Embedded)
    }

    pub(crate) fn snapshot(&self) -> Arc<VectorIndex> {
        self.index.read().clone()
    }
}

// ---------------------------------------------------------------------------
// Learned corpus
// ---------------------------------------------------------------------------

/// Exemplars learned from conversations, backed by a [`PatternStore`].
pub struct LearnedCorpus {
    store: Arc<dyn PatternStore>,
    index: Mutex<Arc<VectorIndex>>,
    dimensions: usize,
}

impl std::fmt::Debug for LearnedCorpus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearnedCorpus")
            .field("entries", &self.len())
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

impl LearnedCorpus {
    /// Open the corpus over `store`, loading existing patterns whose
    /// dimensions match.
    pub async fn open(store: Arc<dyn PatternStore>, dimensions: usize) -> Result<Self> {
        let mut index = VectorIndex::default();
        for pattern in store.scan_patterns().await? {
            if pattern.embedding.len() != dimensions {
                log::warn!(
                    "Skipping learned pattern {:?} with {} dimensions",
                    pattern.entry.text_content,
                    pattern.embedding.len()
                );
                continue;
            }
            index.push(pattern.entry, pattern.embedding);
        }
        Ok(Self {
            store,
            index: Mutex::new(Arc::new(index)),
            dimensions,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn store(&self) -> &Arc<dyn PatternStore> {
        &self.store
    }

    /// Append an entry. The vector must match the corpus dimensions.
    pub async fn add(&self, entry: CorpusEntry, embedding: Vec<f32>) -> Result<()> {
        if embedding.len() != self.dimensions {
            return Err(PerceptionError::Embedding(format!(
                "learned pattern has {} dimensions, corpus expects {}",
                embedding.len(),
                self.dimensions
            )));
        }
        self.store
            .append_pattern(LearnedPattern {
                entry: entry.clone(),
                embedding: embedding.clone(),
            })
            .await?;
        Arc::make_mut(&mut *self.index.lock()).push(entry, embedding);
        Ok(())
    }

    pub fn search(&self, query: &[f32], k: usize) -> Vec<SemanticMatch> {
        self.snapshot().search(query, k, MatchSource::Learned)
    }

    pub(crate) fn snapshot(&self) -> Arc<VectorIndex> {
        self.index.lock().clone()
    }
}
