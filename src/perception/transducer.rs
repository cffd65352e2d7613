//! The transducer: one user turn in, one classified [`Intent`] out.
//!
//! A turn runs in a fixed order: hybrid verb matching (which may assert
//! semantic facts), the model call, envelope parsing, then validation of
//! any rule updates the model proposed. Every failure short of
//! cancellation degrades through the simple pipe-delimited parser and then
//! the offline heuristic, so a caller always gets a usable intent.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::context::Context;
use crate::error::{PerceptionError, Result};
use crate::kernel::{syntax, Kernel};
use crate::llms::Completer;
use crate::perception::envelope::{extract_json, lowercase_keys, parse_envelope, PiggybackEnvelope};
use crate::perception::fallback::{intent_from_match, parse_simple_response};
use crate::perception::intent::{clamp_confidence, normalize_verb, Category, Intent, Understanding, FALLBACK_VERB, NO_TARGET};
use crate::perception::matcher::{match_verb, MatchOrigin, VerbMatch};
use crate::perception::prompts::{
    gcd_retry_section, transducer_system_prompt, FOCUS_SYSTEM_PROMPT, SIMPLE_SYSTEM_PROMPT, TRANSDUCER_SYSTEM_PROMPT,
};
use crate::perception::semantic::SemanticClassifier;
use crate::perception::taxonomy::Taxonomy;

pub const DEFAULT_HISTORY_TURNS: usize = 6;

/// Assistant turns longer than this many characters are cut in the prompt.
pub const ASSISTANT_TRUNCATE: usize = 400;

pub const DEFAULT_GCD_RETRIES: usize = 3;

/// Ambiguity marker added when rule updates never validated.
pub const GCD_FAILURE_MARKER: &str = "GCD_VALIDATION_FAILED";

/// Confidence for a focus reference with exactly one candidate.
pub const SINGLE_CANDIDATE_CONFIDENCE: u8 = 90;

/// Upper bound for focus resolutions made without the model.
pub const LEXICAL_FOCUS_CAP: u8 = 50;

// ---------------------------------------------------------------------------
// Conversation history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message of prior conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Prompt section with the last `max_turns` turns of `history`.
/// Empty when there is no history.
pub fn format_history(history: &[Turn], max_turns: usize) -> String {
    if history.is_empty() || max_turns == 0 {
        return String::new();
    }
    let start = history.len().saturating_sub(max_turns);
    let mut out = String::from("## Conversation so far\n");
    for turn in &history[start..] {
        match turn.role {
            Role::User => out.push_str(&format!("User: {}\n", turn.content.trim())),
            Role::Assistant => out.push_str(&format!(
                "Assistant: {}\n",
                truncate_chars(turn.content.trim(), ASSISTANT_TRUNCATE)
            )),
        }
    }
    out.push('\n');
    out
}

fn hint_section(hint: &VerbMatch) -> String {
    let mut out = String::new();
    if hint.origin != MatchOrigin::Fallback {
        out.push_str(&format!(
            "## Classifier hints\nLikely verb: {} ({}, confidence {:.2}, from {})\n",
            hint.verb,
            hint.category,
            hint.confidence,
            match hint.origin {
                MatchOrigin::Kernel => "kernel",
                _ => "keywords",
            }
        ));
    }
    if !hint.semantic.is_empty() {
        if out.is_empty() {
            out.push_str("## Classifier hints\n");
        }
        out.push_str("Similar requests:\n");
        for m in hint.semantic.iter().take(3) {
            out.push_str(&format!("- {:?} -> {} ({:.2})\n", m.text_content, m.verb, m.similarity));
        }
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// Focus resolution
// ---------------------------------------------------------------------------

/// Outcome of resolving a vague reference against candidate paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusResolution {
    pub reference: String,
    pub selected: Option<String>,
    /// 0-100.
    pub confidence: u8,
    pub reasoning: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FocusReply {
    selected: String,
    confidence: f64,
    reasoning: String,
}

fn focus_confidence(raw: f64) -> u8 {
    let pct = if raw > 0.0 && raw <= 1.0 { raw * 100.0 } else { raw };
    pct.clamp(0.0, 100.0).round() as u8
}

const FOCUS_STOP_WORDS: &[&str] = &["the", "that", "this", "in", "of", "to", "and", "my", "it", "one", "thing"];

/// Pick a candidate by shared terms with `reference`, without a model.
pub fn lexical_focus(reference: &str, candidates: &[String]) -> FocusResolution {
    let lowered = reference.to_lowercase();
    let terms: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 2 && !FOCUS_STOP_WORDS.contains(t))
        .collect();

    let mut best: Option<(&String, usize)> = None;
    for candidate in candidates {
        let path = candidate.to_lowercase();
        let stem = Path::new(&path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_string();
        let score = terms
            .iter()
            .map(|t| usize::from(path.contains(t)) + usize::from(stem == *t))
            .sum::<usize>();
        if score > 0 && best.map_or(true, |(_, s)| score > s) {
            best = Some((candidate, score));
        }
    }

    match best {
        Some((candidate, score)) => FocusResolution {
            reference: reference.to_string(),
            selected: Some(candidate.clone()),
            confidence: (20 + 10 * score).min(LEXICAL_FOCUS_CAP as usize) as u8,
            reasoning: format!("lexical match on {} term(s)", score),
        },
        None => FocusResolution {
            reference: reference.to_string(),
            selected: None,
            confidence: 0,
            reasoning: "no candidate shares a term with the reference".to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Transducer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransducerConfig {
    /// Prior turns included in the prompt.
    pub history_turns: usize,
    /// Total model calls allowed while rule updates fail validation.
    pub max_gcd_retries: usize,
    pub enable_thinking: bool,
    /// Use the streaming capability on the first attempt when available.
    pub prefer_streaming: bool,
    /// Base system prompt; the verb catalog and schema note are appended.
    pub system_prompt: String,
    /// Replace `user_intent` in the kernel after each turn.
    pub assert_intent: bool,
}

impl Default for TransducerConfig {
    fn default() -> Self {
        Self {
            history_turns: DEFAULT_HISTORY_TURNS,
            max_gcd_retries: DEFAULT_GCD_RETRIES,
            enable_thinking: false,
            prefer_streaming: true,
            system_prompt: TRANSDUCER_SYSTEM_PROMPT.to_string(),
            assert_intent: true,
        }
    }
}

struct TurnOutcome {
    intent: Intent,
    updates: Vec<String>,
    understanding: Option<Value>,
}

impl TurnOutcome {
    fn intent_only(intent: Intent) -> Self {
        Self {
            intent,
            updates: Vec::new(),
            understanding: None,
        }
    }
}

pub struct Transducer {
    completer: Arc<dyn Completer>,
    taxonomy: Arc<Taxonomy>,
    semantic: Option<Arc<SemanticClassifier>>,
    kernel: Option<Arc<dyn Kernel>>,
    config: TransducerConfig,
    surface_sink: Option<mpsc::Sender<String>>,
}

impl std::fmt::Debug for Transducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transducer")
            .field("provider", &self.completer.provider())
            .field("model", &self.completer.model())
            .field("semantic", &self.semantic.is_some())
            .field("kernel", &self.kernel.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl Transducer {
    pub fn new(completer: Arc<dyn Completer>, taxonomy: Arc<Taxonomy>) -> Self {
        Self {
            completer,
            taxonomy,
            semantic: None,
            kernel: None,
            config: TransducerConfig::default(),
            surface_sink: None,
        }
    }

    pub fn with_kernel(mut self, kernel: Arc<dyn Kernel>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    pub fn with_semantic(mut self, semantic: Arc<SemanticClassifier>) -> Self {
        self.semantic = Some(semantic);
        self
    }

    pub fn with_config(mut self, config: TransducerConfig) -> Self {
        self.config = config;
        self
    }

    /// Forward surface text to `sink` while a streaming call runs.
    pub fn with_surface_sink(mut self, sink: mpsc::Sender<String>) -> Self {
        self.surface_sink = Some(sink);
        self
    }

    pub fn completer(&self) -> &Arc<dyn Completer> {
        &self.completer
    }

    pub fn taxonomy(&self) -> &Arc<Taxonomy> {
        &self.taxonomy
    }

    pub fn config(&self) -> &TransducerConfig {
        &self.config
    }

    pub async fn parse_intent(&self, ctx: &Context, input: &str) -> Result<Intent> {
        self.parse_intent_with_context(ctx, input, &[]).await
    }

    pub async fn parse_intent_with_context(&self, ctx: &Context, input: &str, history: &[Turn]) -> Result<Intent> {
        let (intent, _) = self
            .parse_intent_with_gcd(ctx, input, history, self.config.max_gcd_retries)
            .await?;
        Ok(intent)
    }

    /// Classify `input` and validate the model's rule updates, asking the
    /// model to repair rejected updates up to `max_retries` calls in total.
    ///
    /// Returns the intent and the updates that validated. When updates
    /// still fail after the last call, the intent's confidence is halved and
    /// [`GCD_FAILURE_MARKER`] is added to its ambiguity notes.
    pub async fn parse_intent_with_gcd(
        &self,
        ctx: &Context,
        input: &str,
        history: &[Turn],
        max_retries: usize,
    ) -> Result<(Intent, Vec<String>)> {
        let outcome = self.run_turn(ctx, input, history, max_retries).await?;
        self.record_intent(ctx, &outcome.intent).await?;
        Ok((outcome.intent, outcome.updates))
    }

    /// Classify `input` and expand the result into an [`Understanding`].
    pub async fn parse_understanding(&self, ctx: &Context, input: &str, history: &[Turn]) -> Result<Understanding> {
        let outcome = self.run_turn(ctx, input, history, self.config.max_gcd_retries).await?;
        self.record_intent(ctx, &outcome.intent).await?;

        let shard = self
            .taxonomy
            .corpus()
            .get(&outcome.intent.verb)
            .map(|e| e.shard_type.clone())
            .unwrap_or_default();
        let mut understanding = Understanding::from_intent(&outcome.intent, input).with_primary_shard(&shard);
        if let Some(overrides) = &outcome.understanding {
            understanding.apply_overrides(overrides);
        }
        Ok(understanding)
    }

    /// Resolve a fuzzy `reference` ("that auth thing") to one of `candidates`.
    pub async fn resolve_focus(&self, ctx: &Context, reference: &str, candidates: &[String]) -> Result<FocusResolution> {
        ctx.check()?;
        match candidates {
            [] => {
                return Ok(FocusResolution {
                    reference: reference.to_string(),
                    selected: None,
                    confidence: 0,
                    reasoning: "no candidates".to_string(),
                })
            }
            [only] => {
                return Ok(FocusResolution {
                    reference: reference.to_string(),
                    selected: Some(only.clone()),
                    confidence: SINGLE_CANDIDATE_CONFIDENCE,
                    reasoning: "single candidate".to_string(),
                })
            }
            _ => {}
        }

        let mut user = format!("Reference: {}\nCandidates:\n", reference);
        for c in candidates {
            user.push_str(&format!("- {}\n", c));
        }
        let raw = match self.completer.complete_with_system(ctx, FOCUS_SYSTEM_PROMPT, &user).await {
            Ok(raw) => raw,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                log::warn!("Focus resolution call failed, using lexical match: {}", e);
                return Ok(lexical_focus(reference, candidates));
            }
        };

        let reply = serde_json::from_str::<Value>(&extract_json(&raw))
            .ok()
            .and_then(|v| serde_json::from_value::<FocusReply>(lowercase_keys(v)).ok());
        match reply {
            Some(reply) if candidates.iter().any(|c| c == reply.selected.trim()) => Ok(FocusResolution {
                reference: reference.to_string(),
                selected: Some(reply.selected.trim().to_string()),
                confidence: focus_confidence(reply.confidence),
                reasoning: reply.reasoning,
            }),
            _ => {
                log::debug!("Focus reply did not name a candidate, using lexical match");
                Ok(lexical_focus(reference, candidates))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Turn internals
    // -----------------------------------------------------------------------

    async fn run_turn(&self, ctx: &Context, input: &str, history: &[Turn], max_retries: usize) -> Result<TurnOutcome> {
        let hint = match_verb(
            ctx,
            input,
            &self.taxonomy,
            self.semantic.as_deref(),
            self.kernel.as_deref(),
        )
        .await?;

        let system = transducer_system_prompt(&self.config.system_prompt, &self.taxonomy.corpus());
        let base_user = format!(
            "{}{}## User message\n{}",
            format_history(history, self.config.history_turns),
            hint_section(&hint),
            input
        );
        let max_attempts = max_retries.max(1);
        let mut errors: Vec<String> = Vec::new();
        let mut attempt = 0;

        loop {
            let user = if errors.is_empty() {
                base_user.clone()
            } else {
                format!("{}{}", gcd_retry_section(attempt, &errors), base_user)
            };

            let raw = match self.invoke(ctx, &system, &user, attempt == 0).await {
                Ok(raw) => raw,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    log::warn!("Transducer call failed, degrading: {}", e);
                    let intent = self.degraded(ctx, input, history, &hint).await?;
                    return Ok(TurnOutcome::intent_only(intent));
                }
            };

            let envelope = match parse_envelope(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    log::warn!("Envelope parse failed: {}", e);
                    let intent = match parse_simple_response(&raw) {
                        Some(mut intent) => {
                            self.close_verb(&mut intent, &hint);
                            intent
                        }
                        None => intent_from_match(input, &hint),
                    };
                    return Ok(TurnOutcome::intent_only(intent));
                }
            };

            let mut intent = self.intent_from_envelope(&envelope, input, &hint);
            let (valid, failures) = self.validate_updates(ctx, &envelope.control_packet.mangle_updates).await?;
            if failures.is_empty() {
                log::debug!("Classified {} as {} ({:.2})", intent.category, intent.verb, intent.confidence);
                return Ok(TurnOutcome {
                    intent,
                    updates: valid,
                    understanding: envelope.control_packet.understanding,
                });
            }

            attempt += 1;
            if attempt < max_attempts {
                log::info!("{} rule update(s) rejected, retrying (attempt {})", failures.len(), attempt + 1);
                errors = failures;
                continue;
            }

            log::warn!("Rule updates still invalid after {} attempt(s)", attempt);
            intent.confidence = clamp_confidence(intent.confidence / 2.0);
            intent
                .ambiguity
                .push(format!("{}: {}", GCD_FAILURE_MARKER, failures.join("; ")));
            return Ok(TurnOutcome {
                intent,
                updates: valid,
                understanding: envelope.control_packet.understanding,
            });
        }
    }

    /// Streaming on the first attempt when available, else structured
    /// output, else a plain completion.
    async fn invoke(&self, ctx: &Context, system: &str, user: &str, first: bool) -> Result<String> {
        if first && self.config.prefer_streaming {
            if let Some(streaming) = self.completer.streaming() {
                match streaming
                    .complete_with_streaming(ctx, system, user, self.config.enable_thinking)
                    .await
                {
                    Ok(stream) => {
                        let outcome = stream.finish_forwarding(self.surface_sink.as_ref()).await?;
                        return Ok(outcome.content);
                    }
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => log::warn!("Streaming call failed, retrying without streaming: {}", e),
                }
            }
        }
        if let Some(structured) = self.completer.structured() {
            match structured
                .complete_with_structured_output(ctx, system, user, self.config.enable_thinking)
                .await
            {
                Err(PerceptionError::Unsupported(what)) => log::debug!("Structured output unsupported: {}", what),
                other => return other,
            }
        }
        self.completer.complete_with_system(ctx, system, user).await
    }

    /// Simple pipe-delimited prompt, then the heuristic.
    async fn degraded(&self, ctx: &Context, input: &str, history: &[Turn], hint: &VerbMatch) -> Result<Intent> {
        let user = format!(
            "{}## User message\n{}",
            format_history(history, self.config.history_turns),
            input
        );
        match self.completer.complete_with_system(ctx, SIMPLE_SYSTEM_PROMPT, &user).await {
            Ok(text) => {
                if let Some(mut intent) = parse_simple_response(&text) {
                    self.close_verb(&mut intent, hint);
                    intent.ambiguity.push("simple classification".to_string());
                    return Ok(intent);
                }
                log::warn!("Simple classification reply was not parseable");
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => log::warn!("Simple classification failed: {}", e),
        }
        Ok(intent_from_match(input, hint))
    }

    fn intent_from_envelope(&self, envelope: &PiggybackEnvelope, input: &str, hint: &VerbMatch) -> Intent {
        let c = envelope.classification();
        let packet = &envelope.control_packet;

        let mut intent = if normalize_verb(&c.verb).trim_start_matches('/').is_empty() {
            let mut intent = intent_from_match(input, hint);
            intent.ambiguity.insert(0, "model returned no verb".to_string());
            if !envelope.surface_response.trim().is_empty() {
                intent.response = envelope.surface_response.clone();
            }
            intent
        } else {
            let target = c.target.trim();
            let mut intent = Intent {
                category: Category::parse(&c.category).unwrap_or(hint.category),
                verb: normalize_verb(&c.verb),
                target: if target.is_empty() { NO_TARGET.to_string() } else { target.to_string() },
                constraint: c.constraint.trim().to_string(),
                confidence: clamp_confidence(c.confidence),
                response: envelope.surface_response.clone(),
                ..Intent::fallback()
            };
            self.close_verb(&mut intent, hint);
            intent
        };

        intent.memory_operations = packet.memory_operations.clone();
        if let Some(correction) = packet.self_correction.as_ref().filter(|sc| sc.triggered) {
            intent
                .ambiguity
                .push(format!("self-correction: {}", correction.hypothesis));
        }
        intent
    }

    /// Replace a verb outside the taxonomy with the matcher's verb.
    fn close_verb(&self, intent: &mut Intent, hint: &VerbMatch) {
        if intent.verb == FALLBACK_VERB || self.taxonomy.contains(&intent.verb) {
            return;
        }
        intent.ambiguity.push(format!(
            "model verb {} is not in the taxonomy, using {}",
            intent.verb, hint.verb
        ));
        intent.verb = hint.verb.clone();
    }

    /// Split `updates` into those that validate and error descriptions for
    /// the rest.
    async fn validate_updates(&self, ctx: &Context, updates: &[String]) -> Result<(Vec<String>, Vec<String>)> {
        let mut valid = Vec::new();
        let mut errors = Vec::new();
        for rule in updates {
            let checked = match &self.kernel {
                Some(kernel) => ctx.run_result(kernel.validate_rule(rule)).await,
                None => syntax::validate_rule(rule),
            };
            match checked {
                Ok(()) => valid.push(rule.clone()),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => errors.push(format!("{} => {}", rule, e)),
            }
        }
        Ok((valid, errors))
    }

    /// Replace the kernel's `user_intent` fact. Failures other than
    /// cancellation are logged.
    async fn record_intent(&self, ctx: &Context, intent: &Intent) -> Result<()> {
        let Some(kernel) = self.kernel.as_deref() else {
            return Ok(());
        };
        if !self.config.assert_intent {
            return Ok(());
        }
        match ctx.run_result(kernel.retract("user_intent")).await {
            Ok(_) | Err(PerceptionError::Unsupported(_)) => {}
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => log::warn!("Failed to retract previous user_intent: {}", e),
        }
        match ctx.run_result(kernel.assert_fact(intent.to_fact())).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                log::warn!("Failed to assert user_intent: {}", e);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MemoryKernel;
    use crate::llms::completer::testing::ScriptedCompleter;
    use crate::perception::intent::Domain;
    use crate::perception::taxonomy::DEFAULT_TAXONOMY;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn envelope(category: &str, verb: &str, target: &str, confidence: f64, updates: &[&str], surface: &str) -> String {
        json!({
            "control_packet": {
                "intent_classification": {
                    "category": category,
                    "verb": verb,
                    "target": target,
                    "constraint": "",
                    "confidence": confidence
                },
                "mangle_updates": updates,
                "memory_operations": []
            },
            "surface_response": surface
        })
        .to_string()
    }

    async fn setup(completer: ScriptedCompleter) -> (Arc<ScriptedCompleter>, Arc<MemoryKernel>, Transducer) {
        let kernel = Arc::new(MemoryKernel::from_source(DEFAULT_TAXONOMY).unwrap());
        let taxonomy = Arc::new(Taxonomy::load(&Context::background(), kernel.as_ref()).await);
        let completer = Arc::new(completer);
        let transducer = Transducer::new(completer.clone(), taxonomy).with_kernel(kernel.clone());
        (completer, kernel, transducer)
    }

    #[tokio::test]
    async fn test_specific_fix_from_envelope() {
        let input = "fix the null pointer in internal/perception/transducer.go line 42";
        let reply = envelope(
            "/mutation",
            "/fix",
            "internal/perception/transducer.go",
            0.92,
            &[],
            "I'll fix the null pointer.",
        );
        let (completer, kernel, transducer) = setup(ScriptedCompleter::new(&[&reply])).await;

        let intent = transducer.parse_intent(&Context::background(), input).await.unwrap();
        assert_eq!(intent.category, Category::Mutation);
        assert_eq!(intent.verb, "/fix");
        assert!(intent.target.contains("transducer.go"));
        assert!(intent.confidence >= 0.7);
        assert_eq!(intent.response, "I'll fix the null pointer.");

        let prompts = completer.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].0.contains("Canonical verbs"));
        assert!(prompts[0].1.contains("Likely verb:"));
        assert!(prompts[0].1.ends_with(input));

        let facts = kernel.facts_of("user_intent");
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].args[2].as_str(), Some("/fix"));
    }

    #[tokio::test]
    async fn test_user_intent_is_replaced_each_turn() {
        let first = envelope("/query", "/explain", "none", 0.8, &[], "a");
        let second = envelope("/mutation", "/refactor", "lib.rs", 0.8, &[], "b");
        let (_, kernel, transducer) = setup(ScriptedCompleter::new(&[&first, &second])).await;
        let ctx = Context::background();
        transducer.parse_intent(&ctx, "what is this").await.unwrap();
        transducer.parse_intent(&ctx, "refactor lib.rs").await.unwrap();
        let facts = kernel.facts_of("user_intent");
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].args[2].as_str(), Some("/refactor"));
    }

    #[tokio::test]
    async fn test_greeting_streams_surface() {
        let reply = envelope("/query", "/greet", "none", 0.95, &[], "Hello! How can I help?");
        let (completer, _, transducer) = setup(ScriptedCompleter::new(&[&reply]).with_streaming()).await;
        let (tx, mut rx) = mpsc::channel(8);
        let transducer = transducer.with_surface_sink(tx);

        let intent = transducer.parse_intent(&Context::background(), "Hello world").await.unwrap();
        assert_eq!(intent.category, Category::Query);
        assert!(intent.verb == "/greet" || intent.verb == "/converse");
        assert!(intent.confidence >= 0.7);
        assert!(!intent.response.is_empty());
        assert_eq!(completer.streamed.load(Ordering::SeqCst), 1);
        assert_eq!(rx.try_recv().unwrap(), "Hello! How can I help?");
    }

    #[tokio::test]
    async fn test_gcd_retry_repairs_updates() {
        let bad = envelope("/instruction", "/configure", "none", 0.8, &["prefers tabs"], "ok");
        let good = envelope("/instruction", "/configure", "none", 0.8, &["preference(/indent, \"tabs\")."], "ok");
        let (completer, _, transducer) = setup(ScriptedCompleter::new(&[&bad, &good])).await;

        let (intent, updates) = transducer
            .parse_intent_with_gcd(&Context::background(), "always use tabs", &[], 3)
            .await
            .unwrap();
        assert_eq!(updates, vec!["preference(/indent, \"tabs\").".to_string()]);
        assert!((intent.confidence - 0.8).abs() < 1e-9);
        assert!(intent.ambiguity.iter().all(|a| !a.contains(GCD_FAILURE_MARKER)));

        let prompts = completer.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].1.starts_with("## Previous attempt 1 was rejected"));
        assert!(prompts[1].1.contains("prefers tabs"));
    }

    #[tokio::test]
    async fn test_gcd_exhaustion_halves_confidence() {
        let bad = envelope("/instruction", "/configure", "none", 0.8, &["p(X).", "ok(/a)."], "ok");
        let (completer, _, transducer) = setup(ScriptedCompleter::new(&[&bad, &bad, &bad])).await;

        let (intent, updates) = transducer
            .parse_intent_with_gcd(&Context::background(), "always use tabs", &[], 3)
            .await
            .unwrap();
        assert_eq!(completer.prompts().len(), 3);
        assert!((intent.confidence - 0.4).abs() < 1e-9);
        assert!(intent.ambiguity.iter().any(|a| a.starts_with(GCD_FAILURE_MARKER)));
        assert_eq!(updates, vec!["ok(/a).".to_string()]);
    }

    #[tokio::test]
    async fn test_unparseable_reply_uses_simple_parser() {
        let (_, _, transducer) = setup(ScriptedCompleter::new(&["/mutation|/fix|auth.go|none|0.8\nOn it."])).await;
        let intent = transducer
            .parse_intent(&Context::background(), "fix auth.go")
            .await
            .unwrap();
        assert_eq!(intent.verb, "/fix");
        assert_eq!(intent.target, "auth.go");
        assert_eq!(intent.response, "On it.");
    }

    #[tokio::test]
    async fn test_prose_reply_uses_heuristic() {
        let (_, _, transducer) = setup(ScriptedCompleter::new(&["I'm not sure what you mean."])).await;
        let intent = transducer
            .parse_intent(&Context::background(), "check my code for security issues")
            .await
            .unwrap();
        assert_eq!(intent.verb, "/security");
        assert_eq!(intent.category, Category::Query);
        assert!(intent.target.contains("code"));
        assert!(intent.ambiguity.iter().any(|a| a.starts_with("heuristic")));
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back_to_simple_prompt() {
        let completer = ScriptedCompleter::new(&[]);
        completer.push_err(PerceptionError::transport("scripted", "connection refused"));
        completer.push("/query|/greet|none|none|0.9\nHi there!");
        let (completer, _, transducer) = setup(completer).await;

        let intent = transducer.parse_intent(&Context::background(), "Hello world").await.unwrap();
        assert_eq!(intent.verb, "/greet");
        assert!((intent.confidence - 0.9).abs() < 1e-9);
        assert_eq!(completer.prompts()[1].0, SIMPLE_SYSTEM_PROMPT);
    }

    #[tokio::test]
    async fn test_total_llm_failure_falls_back_to_heuristic() {
        let completer = ScriptedCompleter::new(&[]);
        completer.push_err(PerceptionError::transport("scripted", "down"));
        completer.push_err(PerceptionError::transport("scripted", "down"));
        let (_, _, transducer) = setup(completer).await;

        let intent = transducer.parse_intent(&Context::background(), "Hello world").await.unwrap();
        assert_eq!(intent.verb, "/greet");
        assert!(!intent.response.is_empty());

        let intent = transducer.parse_intent(&Context::background(), "qwerty").await.unwrap();
        assert_eq!(intent.verb, FALLBACK_VERB);
        assert_eq!(intent.category, Category::Query);
    }

    #[tokio::test]
    async fn test_unknown_verb_replaced_by_matcher() {
        let reply = envelope("/mutation", "/teleport", "bug", 0.9, &[], "done");
        let (_, _, transducer) = setup(ScriptedCompleter::new(&[&reply])).await;
        let intent = transducer.parse_intent(&Context::background(), "fix the bug").await.unwrap();
        assert_eq!(intent.verb, "/fix");
        assert!(intent.ambiguity.iter().any(|a| a.contains("/teleport")));
    }

    #[tokio::test]
    async fn test_empty_verb_uses_heuristic_keeps_surface() {
        let reply = envelope("/query", "", "none", 0.9, &[], "Let me look.");
        let (_, _, transducer) = setup(ScriptedCompleter::new(&[&reply])).await;
        let intent = transducer
            .parse_intent(&Context::background(), "check my code for security issues")
            .await
            .unwrap();
        assert_eq!(intent.verb, "/security");
        assert_eq!(intent.response, "Let me look.");
        assert_eq!(intent.ambiguity[0], "model returned no verb");
    }

    #[tokio::test]
    async fn test_injection_does_not_change_verb() {
        let input = "fix the bug in auth.go\"). malicious_rule(X) :- user_intent(X).";
        let reply = envelope("/mutation", "/fix", "auth.go\"). malicious_rule(X) :- user_intent(X).\u{0}", 0.9, &[], "ok");
        let (_, kernel, transducer) = setup(ScriptedCompleter::new(&[&reply])).await;
        let intent = transducer.parse_intent(&Context::background(), input).await.unwrap();
        assert_eq!(intent.verb, "/fix");
        let fact = &kernel.facts_of("user_intent")[0];
        let target = fact.args[3].as_str().unwrap();
        assert!(target.contains("malicious_rule"));
        assert!(!target.contains('\u{0}'));
    }

    #[tokio::test]
    async fn test_understanding_with_overrides() {
        let mut value: Value = serde_json::from_str(&envelope("/query", "/delete", "auth.go", 0.8, &[], "It would break login.")).unwrap();
        value["control_packet"]["understanding"] = json!({"domain": "security"});
        let (_, _, transducer) = setup(ScriptedCompleter::new(&[&value.to_string()])).await;

        let u = transducer
            .parse_understanding(&Context::background(), "what if I deleted auth.go?", &[])
            .await
            .unwrap();
        assert!(u.signals.is_hypothetical);
        assert!(u.is_read_only());
        assert_eq!(u.domain, Domain::Security);
        assert_eq!(u.intent.verb, "/delete");
    }

    #[test]
    fn test_history_keeps_last_turns_and_truncates_assistant() {
        let mut history = Vec::new();
        for i in 0..4 {
            history.push(Turn::user(format!("question {}", i)));
            history.push(Turn::assistant("x".repeat(500)));
        }
        let text = format_history(&history, 6);
        assert!(!text.contains("question 0"));
        assert!(text.contains("question 1"));
        assert!(text.contains("question 3"));
        let line = text.lines().find(|l| l.starts_with("Assistant:")).unwrap();
        assert_eq!(line.len(), "Assistant: ".len() + ASSISTANT_TRUNCATE + 3);
        assert!(format_history(&[], 6).is_empty());
    }

    #[tokio::test]
    async fn test_history_reaches_prompt() {
        let reply = envelope("/query", "/explain", "none", 0.8, &[], "It does X.");
        let (completer, _, transducer) = setup(ScriptedCompleter::new(&[&reply])).await;
        let history = [Turn::user("look at parser.rs"), Turn::assistant("Opened it.")];
        transducer
            .parse_intent_with_context(&Context::background(), "what does it do?", &history)
            .await
            .unwrap();
        let user = &completer.prompts()[0].1;
        assert!(user.starts_with("## Conversation so far\nUser: look at parser.rs\nAssistant: Opened it."));
    }

    #[tokio::test]
    async fn test_resolve_focus() {
        let candidates = vec!["src/db/pool.rs".to_string(), "src/auth/login.rs".to_string()];
        let reply = r#"Sure: {"selected": "src/auth/login.rs", "confidence": 0.8, "reasoning": "login handler"}"#;
        let (completer, _, transducer) = setup(ScriptedCompleter::new(&[reply, "{\"selected\": \"nope.rs\"}"])).await;
        let ctx = Context::background();

        let none = transducer.resolve_focus(&ctx, "that thing", &[]).await.unwrap();
        assert_eq!((none.selected, none.confidence), (None, 0));

        let one = transducer.resolve_focus(&ctx, "that thing", &candidates[..1]).await.unwrap();
        assert_eq!(one.selected.as_deref(), Some("src/db/pool.rs"));
        assert_eq!(one.confidence, SINGLE_CANDIDATE_CONFIDENCE);
        assert!(completer.prompts().is_empty());

        let many = transducer.resolve_focus(&ctx, "the login handler", &candidates).await.unwrap();
        assert_eq!(many.selected.as_deref(), Some("src/auth/login.rs"));
        assert_eq!(many.confidence, 80);
        assert_eq!(completer.prompts()[0].0, FOCUS_SYSTEM_PROMPT);

        let invalid = transducer.resolve_focus(&ctx, "the login handler", &candidates).await.unwrap();
        assert_eq!(invalid.selected.as_deref(), Some("src/auth/login.rs"));
        assert!(invalid.confidence <= LEXICAL_FOCUS_CAP);
    }

    #[test]
    fn test_lexical_focus_without_overlap() {
        let r = lexical_focus("zzz", &["a.rs".to_string(), "b.rs".to_string()]);
        assert_eq!(r.selected, None);
        assert_eq!(r.confidence, 0);
    }

    #[tokio::test]
    async fn test_cancelled_turn() {
        let (completer, _, transducer) = setup(ScriptedCompleter::new(&["{}"])).await;
        let ctx = Context::background();
        ctx.cancel();
        let err = transducer.parse_intent(&ctx, "fix it").await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(completer.prompts().is_empty());
    }
}
