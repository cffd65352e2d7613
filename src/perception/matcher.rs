//! Hybrid verb matcher: regex candidates, semantic retrieval, kernel verdict,
//! heuristic scoring, in that order of preference.

use serde::Serialize;

use crate::context::Context;
use crate::error::Result;
use crate::kernel::Kernel;
use crate::perception::intent::{clamp_confidence, normalize_verb, sanitize_fact_arg, Category, FALLBACK_CONFIDENCE, FALLBACK_VERB};
use crate::perception::semantic::{seed_fallback_facts, SemanticClassifier, SemanticMatch};
use crate::perception::taxonomy::{best_heuristic, Candidate, Taxonomy};

/// Where a verb decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchOrigin {
    Kernel,
    Heuristic,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerbMatch {
    pub verb: String,
    pub category: Category,
    pub confidence: f64,
    pub shard_type: String,
    pub origin: MatchOrigin,
    /// Regex candidates considered.
    #[serde(skip)]
    pub candidates: Vec<Candidate>,
    /// Semantic matches asserted into the kernel this turn.
    #[serde(skip)]
    pub semantic: Vec<SemanticMatch>,
}

impl VerbMatch {
    fn fallback(candidates: Vec<Candidate>, semantic: Vec<SemanticMatch>) -> Self {
        Self {
            verb: FALLBACK_VERB.to_string(),
            category: Category::Query,
            confidence: FALLBACK_CONFIDENCE,
            shard_type: String::new(),
            origin: MatchOrigin::Fallback,
            candidates,
            semantic,
        }
    }
}

/// Pick the best verb for `input`.
///
/// Semantic and kernel failures are logged and skipped; only cancellation
/// is returned as an error.
pub async fn match_verb(
    ctx: &Context,
    input: &str,
    taxonomy: &Taxonomy,
    semantic: Option<&SemanticClassifier>,
    kernel: Option<&dyn Kernel>,
) -> Result<VerbMatch> {
    ctx.check()?;
    let corpus = taxonomy.corpus();
    let candidates = corpus.candidates(input);
    let mut semantic_matches = Vec::new();

    if let Some(kernel) = kernel {
        match semantic {
            Some(classifier) => {
                semantic_matches = classifier.classify_and_assert(ctx, kernel, input, &candidates).await?;
            }
            None => match seed_fallback_facts(ctx, kernel, input, &candidates).await {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => log::warn!("Failed to seed fallback semantic facts: {}", e),
            },
        }

        let verbs: Vec<String> = candidates.iter().map(|c| c.verb.clone()).collect();
        let verdict = match ctx
            .run_result(kernel.classify_input(&sanitize_fact_arg(input), &verbs))
            .await
        {
            Ok(v) => v,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                log::warn!("Kernel classification failed: {}", e);
                None
            }
        };

        if let Some(verdict) = verdict.filter(|v| !v.verb.trim().is_empty()) {
            let verb = normalize_verb(&verdict.verb);
            let found = candidates
                .iter()
                .find(|c| c.verb == verb)
                .map(|c| (c.category, c.shard_type.clone()))
                .or_else(|| corpus.get(&verb).map(|e| (e.category, e.shard_type.clone())));
            match found {
                Some((category, shard_type)) => {
                    log::debug!("Kernel selected {} ({:.2})", verb, verdict.confidence);
                    return Ok(VerbMatch {
                        verb,
                        category,
                        confidence: clamp_confidence(verdict.confidence),
                        shard_type,
                        origin: MatchOrigin::Kernel,
                        candidates,
                        semantic: semantic_matches,
                    });
                }
                None => log::debug!("Kernel verb {} is not in the taxonomy, ignoring", verb),
            }
        }
    }

    if let Some((best, score)) = best_heuristic(&candidates) {
        let (verb, category, shard_type) = (best.verb.clone(), best.category, best.shard_type.clone());
        return Ok(VerbMatch {
            verb,
            category,
            confidence: score,
            shard_type,
            origin: MatchOrigin::Heuristic,
            candidates,
            semantic: semantic_matches,
        });
    }

    Ok(VerbMatch::fallback(candidates, semantic_matches))
}
