//! Semantic classifier: vector retrieval over the embedded and learned
//! corpora, asserted into the kernel as `semantic_match` facts.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinError;

use crate::context::Context;
use crate::embedding::{EmbeddingEngine, TASK_RETRIEVAL_DOCUMENT, TASK_RETRIEVAL_QUERY};
use crate::error::{PerceptionError, Result};
use crate::kernel::{Fact, Kernel, Term};
use crate::perception::intent::{clamp_confidence, normalize_verb, sanitize_fact_arg};
use crate::perception::taxonomy::Candidate;

pub mod corpus;
pub mod store;

use corpus::VectorIndex;

pub use corpus::{EmbeddedCorpus, LearnedCorpus};
pub use store::{LearnedPattern, MemoryPatternStore, PatternStore, SqlitePatternStore};

/// Predicate of the facts the classifier asserts.
pub const SEMANTIC_MATCH: &str = "semantic_match";

pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_LEARNED_BOOST: f64 = 0.1;
pub const DEFAULT_MIN_SIMILARITY: f64 = 0.5;

/// Similarity (0-100) of facts seeded from regex candidates when retrieval
/// is unavailable.
pub const FALLBACK_SIMILARITY: i64 = 50;

/// How many regex candidates seed fallback facts.
pub const FALLBACK_CANDIDATES: usize = 3;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusEntry {
    pub text_content: String,
    pub verb: String,
    pub target: String,
    pub constraint: String,
    /// Base prior in `[0, 1]`.
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchSource {
    Embedded,
    Learned,
}

impl MatchSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Embedded => "embedded",
            Self::Learned => "learned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticMatch {
    pub text_content: String,
    pub verb: String,
    pub target: String,
    pub constraint: String,
    /// Cosine similarity in `[0, 1]`.
    pub similarity: f64,
    /// 1-based rank after merging.
    pub rank: usize,
    pub source: MatchSource,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SemanticConfig {
    pub top_k: usize,
    pub learned_boost: f64,
    pub min_similarity: f64,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            learned_boost: DEFAULT_LEARNED_BOOST,
            min_similarity: DEFAULT_MIN_SIMILARITY,
        }
    }
}

// ---------------------------------------------------------------------------
// Merge and facts
// ---------------------------------------------------------------------------

/// Merge embedded and learned results.
///
/// Learned similarities get `boost` (capped at 1.0); the union is sorted
/// descending (stable), de-duplicated by `(verb, text)` keeping the first
/// and therefore highest score, capped at `2 * k`, and re-ranked from 1.
pub fn merge_matches(embedded: Vec<SemanticMatch>, learned: Vec<SemanticMatch>, boost: f64, k: usize) -> Vec<SemanticMatch> {
    let mut all: Vec<SemanticMatch> = embedded;
    all.extend(learned.into_iter().map(|mut m| {
        m.similarity = (m.similarity + boost).min(1.0);
        m
    }));
    all.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

    let mut merged: Vec<SemanticMatch> = Vec::with_capacity(all.len());
    for m in all {
        if merged.iter().any(|x| x.verb == m.verb && x.text_content == m.text_content) {
            continue;
        }
        merged.push(m);
        if merged.len() == 2 * k {
            break;
        }
    }
    rerank(merged)
}

/// Drop matches below `min` and re-rank.
pub fn filter_min_similarity(matches: Vec<SemanticMatch>, min: f64) -> Vec<SemanticMatch> {
    rerank(matches.into_iter().filter(|m| m.similarity >= min).collect())
}

fn rerank(mut matches: Vec<SemanticMatch>) -> Vec<SemanticMatch> {
    for (i, m) in matches.iter_mut().enumerate() {
        m.rank = i + 1;
    }
    matches
}

/// `semantic_match(user_input, phrase, verb, target, rank, similarity_0_100)`.
pub fn semantic_match_fact(input: &str, m: &SemanticMatch) -> Fact {
    Fact::new(
        SEMANTIC_MATCH,
        vec![
            Term::str(sanitize_fact_arg(input)),
            Term::str(sanitize_fact_arg(&m.text_content)),
            Term::atom(normalize_verb(&m.verb)),
            Term::str(sanitize_fact_arg(&m.target)),
            Term::Int(m.rank as i64),
            Term::Int((clamp_confidence(m.similarity) * 100.0).round() as i64),
        ],
    )
}

/// Assert facts as one batch, falling back to one at a time. Returns how
/// many were asserted.
pub async fn assert_facts(ctx: &Context, kernel: &dyn Kernel, facts: Vec<Fact>) -> Result<usize> {
    if facts.is_empty() {
        return Ok(0);
    }
    let n = facts.len();
    match ctx.run_result(kernel.load_facts(facts.clone())).await {
        Ok(()) => Ok(n),
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            log::warn!("Batch assert of {} facts failed, asserting individually: {}", n, e);
            let mut ok = 0;
            for fact in facts {
                match ctx.run_result(kernel.assert_fact(fact)).await {
                    Ok(()) => ok += 1,
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => log::debug!("Fact assert failed: {}", e),
                }
            }
            Ok(ok)
        }
    }
}

/// Drop the previous turn's `semantic_match` facts. Kernels without
/// retraction keep them.
pub async fn clear_semantic_facts(ctx: &Context, kernel: &dyn Kernel) -> Result<usize> {
    match ctx.run_result(kernel.retract(SEMANTIC_MATCH)).await {
        Ok(n) => Ok(n),
        Err(e) if e.is_cancelled() => Err(e),
        Err(PerceptionError::Unsupported(_)) => Ok(0),
        Err(e) => {
            log::warn!("Failed to retract stale semantic matches: {}", e);
            Ok(0)
        }
    }
}

/// Seed low-similarity `semantic_match` facts from the top regex candidates,
/// replacing those of the previous turn.
pub async fn seed_fallback_facts(ctx: &Context, kernel: &dyn Kernel, input: &str, candidates: &[Candidate]) -> Result<usize> {
    clear_semantic_facts(ctx, kernel).await?;
    let mut ranked: Vec<&Candidate> = candidates.iter().collect();
    ranked.sort_by(|a, b| b.heuristic_score().total_cmp(&a.heuristic_score()));
    let facts = ranked
        .into_iter()
        .take(FALLBACK_CANDIDATES)
        .enumerate()
        .map(|(i, c)| {
            Fact::new(
                SEMANTIC_MATCH,
                vec![
                    Term::str(sanitize_fact_arg(input)),
                    Term::str(c.verb.trim_start_matches('/')),
                    Term::atom(&c.verb),
                    Term::str("none"),
                    Term::Int(i as i64 + 1),
                    Term::Int(FALLBACK_SIMILARITY),
                ],
            )
        })
        .collect();
    assert_facts(ctx, kernel, facts).await
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

pub struct SemanticClassifier {
    engine: Arc<dyn EmbeddingEngine>,
    embedded: EmbeddedCorpus,
    learned: LearnedCorpus,
    config: SemanticConfig,
}

impl std::fmt::Debug for SemanticClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticClassifier")
            .field("engine", &self.engine.name())
            .field("embedded", &self.embedded.len())
            .field("learned", &self.learned)
            .field("config", &self.config)
            .finish()
    }
}

impl SemanticClassifier {
    /// Build a classifier, hydrating the embedded corpus from the kernel
    /// and opening the learned corpus over `store`.
    pub async fn new(
        ctx: &Context,
        engine: Arc<dyn EmbeddingEngine>,
        kernel: &dyn Kernel,
        store: Arc<dyn PatternStore>,
        config: SemanticConfig,
    ) -> Result<Self> {
        let dims = engine.dimensions();
        let embedded = EmbeddedCorpus::new(dims);
        embedded.hydrate(ctx, kernel, engine.as_ref()).await?;
        let learned = LearnedCorpus::open(store, dims).await?;
        Ok(Self {
            engine,
            embedded,
            learned,
            config,
        })
    }

    pub fn config(&self) -> SemanticConfig {
        self.config
    }

    pub fn embedded(&self) -> &EmbeddedCorpus {
        &self.embedded
    }

    pub fn learned(&self) -> &LearnedCorpus {
        &self.learned
    }

    async fn embed_query(&self, ctx: &Context, input: &str) -> Result<Vec<f32>> {
        if self.engine.supports_task_hints() {
            self.engine.embed_with_task(ctx, input, TASK_RETRIEVAL_QUERY).await
        } else {
            self.engine.embed(ctx, input).await
        }
    }

    /// Rank corpus entries for `input`.
    ///
    /// The embedded and learned corpora are searched on blocking threads
    /// concurrently, each over a snapshot of its index. A failed search is
    /// logged and treated as empty.
    pub async fn classify(&self, ctx: &Context, input: &str) -> Result<Vec<SemanticMatch>> {
        let query = Arc::new(self.embed_query(ctx, input).await?);
        let k = self.config.top_k;

        let spawn = |source: MatchSource, index: Arc<VectorIndex>| {
            let query = query.clone();
            tokio::task::spawn_blocking(move || index.search(&query, k, source))
        };
        let embedded = spawn(MatchSource::Embedded, self.embedded.snapshot());
        let learned = spawn(MatchSource::Learned, self.learned.snapshot());
        let (embedded, learned) = ctx.run(async { tokio::join!(embedded, learned) }).await?;

        let searched = |source: MatchSource, found: std::result::Result<Vec<SemanticMatch>, JoinError>| match found {
            Ok(v) => v,
            Err(e) => {
                log::warn!("{} corpus search failed: {}", source.as_str(), e);
                Vec::new()
            }
        };
        let embedded = searched(MatchSource::Embedded, embedded);
        let learned = searched(MatchSource::Learned, learned);

        let merged = merge_matches(embedded, learned, self.config.learned_boost, k);
        Ok(filter_min_similarity(merged, self.config.min_similarity))
    }

    /// Classify and assert the matches into the kernel. When retrieval
    /// fails, seeds fallback facts from `candidates` and returns no matches.
    /// Only cancellation is returned as an error.
    pub async fn classify_and_assert(
        &self,
        ctx: &Context,
        kernel: &dyn Kernel,
        input: &str,
        candidates: &[Candidate],
    ) -> Result<Vec<SemanticMatch>> {
        let classified = self.classify(ctx, input).await;
        if classified.is_ok() {
            clear_semantic_facts(ctx, kernel).await?;
        }
        match classified {
            Ok(matches) => {
                let facts = matches.iter().map(|m| semantic_match_fact(input, m)).collect();
                let asserted = assert_facts(ctx, kernel, facts).await?;
                log::debug!("Asserted {} of {} semantic matches", asserted, matches.len());
                Ok(matches)
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                log::warn!("Semantic classification failed, seeding regex fallback: {}", e);
                seed_fallback_facts(ctx, kernel, input, candidates).await?;
                Ok(Vec::new())
            }
        }
    }

    /// Embed and append a learned exemplar.
    pub async fn add_learned_pattern(
        &self,
        ctx: &Context,
        phrase: &str,
        verb: &str,
        target: &str,
        constraint: &str,
        confidence: f64,
    ) -> Result<()> {
        let embedding = if self.engine.supports_task_hints() {
            self.engine.embed_with_task(ctx, phrase, TASK_RETRIEVAL_DOCUMENT).await?
        } else {
            self.engine.embed(ctx, phrase).await?
        };
        if embedding.len() != self.learned.dimensions() {
            return Err(PerceptionError::Embedding(format!(
                "embedding has {} dimensions, learned corpus expects {}",
                embedding.len(),
                self.learned.dimensions()
            )));
        }
        self.learned
            .add(
                CorpusEntry {
                    text_content: phrase.to_string(),
                    verb: normalize_verb(verb),
                    target: target.to_string(),
                    constraint: constraint.to_string(),
                    confidence: clamp_confidence(confidence),
                },
                embedding,
            )
            .await
    }
}
