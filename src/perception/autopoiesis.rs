//! Autopoiesis: learning new exemplars from corrected conversations.
//!
//! The [`Critic`] asks the model to spot a phrase the agent misread and the
//! user then clarified. Such a phrase comes back as one
//! `learned_exemplar("phrase", /verb, "target", "constraint", confidence).`
//! fact, which is loaded into the running kernel and written through to
//! the pattern store, the semantic classifier and `learned_taxonomy.mg`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::context::Context;
use crate::error::{PerceptionError, Result};
use crate::kernel::{Fact, Kernel, Term};
use crate::llms::Completer;
use crate::perception::intent::sanitize_fact_arg;
use crate::perception::prompts::CRITIC_SYSTEM_PROMPT;
use crate::perception::semantic::store::PatternStore;
use crate::perception::semantic::SemanticClassifier;
use crate::perception::taxonomy::Taxonomy;
use crate::perception::transducer::{Role, Turn};

/// Append-only file of learned facts inside the workspace rule directory.
pub const LEARNED_TAXONOMY_FILE: &str = "learned_taxonomy.mg";

/// Turns of history shown to the critic.
pub const CRITIC_HISTORY_TURNS: usize = 5;

const LEARNED_PREDICATE: &str = "learned_exemplar";

/// One parsed `learned_exemplar` fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedExemplar {
    pub phrase: String,
    pub verb: String,
    pub target: String,
    pub constraint: String,
    /// As written in the fact: a fraction or an integer percentage.
    pub confidence: f64,
}

impl LearnedExemplar {
    /// Confidence as an integer percentage.
    pub fn confidence_percent(&self) -> i64 {
        if self.confidence <= 1.0 {
            (self.confidence.max(0.0) * 100.0).round() as i64
        } else {
            self.confidence.round() as i64
        }
    }

    /// The fact with an integer confidence.
    pub fn to_fact(&self) -> Fact {
        Fact::new(
            LEARNED_PREDICATE,
            vec![
                Term::str(sanitize_fact_arg(&self.phrase)),
                Term::atom(&self.verb),
                Term::str(sanitize_fact_arg(&self.target)),
                Term::str(sanitize_fact_arg(&self.constraint)),
                Term::Int(self.confidence_percent()),
            ],
        )
    }
}

// ---------------------------------------------------------------------------
// Fact text handling
// ---------------------------------------------------------------------------

/// Pull the first complete `learned_exemplar(...)` fact out of model output.
///
/// Parentheses inside quoted strings (with escapes) do not count. Returns
/// an empty string when no complete fact is present.
pub fn extract_learned_fact(text: &str) -> String {
    let needle = format!("{}(", LEARNED_PREDICATE);
    let mut from = 0;
    while let Some(pos) = text[from..].find(&needle) {
        let start = from + pos;
        let open = start + LEARNED_PREDICATE.len();
        if let Some(end) = balanced_end(text, open) {
            let mut fact = text[start..end].to_string();
            fact.push('.');
            return fact;
        }
        from = open + 1;
    }
    String::new()
}

/// Byte index just past the `)` closing the `(` at `open`.
fn balanced_end(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[open..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(open + i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on commas outside quoted strings.
fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            ',' => {
                parts.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(text[start..].trim());
    parts
}

fn unquote(field: &str, name: &str) -> Result<String> {
    let inner = field
        .strip_prefix('"')
        .and_then(|f| f.strip_suffix('"'))
        .ok_or_else(|| PerceptionError::validation(name, format!("expected a quoted string, got {}", field)))?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    Ok(out)
}

/// Strict parser for `learned_exemplar("phrase", /verb, "target", "constraint", confidence).`
pub fn parse_learned_fact(fact: &str) -> Result<LearnedExemplar> {
    let body = fact.trim().trim_end_matches('.').trim_end();
    let inner = body
        .strip_prefix(LEARNED_PREDICATE)
        .map(str::trim_start)
        .and_then(|b| b.strip_prefix('('))
        .and_then(|b| b.strip_suffix(')'))
        .ok_or_else(|| PerceptionError::Parse(format!("not a {} fact: {}", LEARNED_PREDICATE, fact)))?;

    let fields = split_top_level(inner);
    let [phrase, verb, target, constraint, confidence] = fields.as_slice() else {
        return Err(PerceptionError::validation(
            LEARNED_PREDICATE,
            format!("expected 5 arguments, found {}", fields.len()),
        ));
    };

    if !verb.starts_with('/') || verb.len() < 2 || verb.contains('"') {
        return Err(PerceptionError::validation("verb", format!("expected an atom like /fix, got {}", verb)));
    }
    let confidence = confidence
        .parse::<f64>()
        .ok()
        .filter(|c| c.is_finite() && *c >= 0.0)
        .ok_or_else(|| PerceptionError::validation("confidence", format!("not a number: {}", confidence)))?;

    Ok(LearnedExemplar {
        phrase: unquote(phrase, "phrase")?,
        verb: verb.to_string(),
        target: unquote(target, "target")?,
        constraint: unquote(constraint, "constraint")?,
        confidence,
    })
}

/// Rewrite a learned fact with an integer confidence (fractions scaled to 0-100).
pub fn normalize_learned_fact(fact: &str) -> Result<String> {
    Ok(parse_learned_fact(fact)?.to_fact().to_source())
}

fn format_transcript(history: &[Turn]) -> String {
    let start = history.len().saturating_sub(CRITIC_HISTORY_TURNS);
    history[start..]
        .iter()
        .map(|t| match t.role {
            Role::User => format!("User: {}", t.content.trim()),
            Role::Assistant => format!("Agent: {}", t.content.trim()),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Critic
// ---------------------------------------------------------------------------

pub struct Critic {
    completer: Arc<dyn Completer>,
    kernel: Arc<dyn Kernel>,
    taxonomy: Option<Arc<Taxonomy>>,
    semantic: Option<Arc<SemanticClassifier>>,
    store: Option<Arc<dyn PatternStore>>,
    learned_dir: Option<PathBuf>,
    system_prompt: String,
}

impl std::fmt::Debug for Critic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Critic")
            .field("provider", &self.completer.provider())
            .field("semantic", &self.semantic.is_some())
            .field("store", &self.store.is_some())
            .field("learned_dir", &self.learned_dir)
            .finish()
    }
}

impl Critic {
    pub fn new(completer: Arc<dyn Completer>, kernel: Arc<dyn Kernel>) -> Self {
        Self {
            completer,
            kernel,
            taxonomy: None,
            semantic: None,
            store: None,
            learned_dir: None,
            system_prompt: CRITIC_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_taxonomy(mut self, taxonomy: Arc<Taxonomy>) -> Self {
        self.taxonomy = Some(taxonomy);
        self
    }

    pub fn with_semantic(mut self, semantic: Arc<SemanticClassifier>) -> Self {
        self.semantic = Some(semantic);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn PatternStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Directory holding `learned_taxonomy.mg`.
    pub fn with_learned_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.learned_dir = Some(dir.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn learned_file(&self) -> Option<PathBuf> {
        self.learned_dir.as_ref().map(|d| d.join(LEARNED_TAXONOMY_FILE))
    }

    /// Ask the model for one learnable exemplar in the recent turns.
    /// Returns the fact text, or an empty string when there is nothing to learn.
    pub async fn learn_from_interaction(&self, ctx: &Context, history: &[Turn]) -> Result<String> {
        ctx.check()?;
        if history.is_empty() {
            return Ok(String::new());
        }
        let transcript = format_transcript(history);
        let reply = self
            .completer
            .complete_with_system(ctx, &self.system_prompt, &transcript)
            .await?;
        let fact = extract_learned_fact(&reply);
        if fact.is_empty() {
            log::debug!("Critic found nothing to learn");
        } else {
            log::info!("Critic proposed {}", fact);
        }
        Ok(fact)
    }

    /// Load a learned fact everywhere it belongs.
    ///
    /// The kernel load must succeed. The pattern store, semantic corpus and
    /// `learned_taxonomy.mg` writes are attempted in turn and only logged on
    /// failure. Returns the normalized exemplar.
    pub async fn persist_learned_fact(&self, ctx: &Context, fact: &str) -> Result<LearnedExemplar> {
        ctx.check()?;
        let exemplar = parse_learned_fact(fact)?;
        let normalized = exemplar.to_fact().to_source();

        ctx.run_result(self.kernel.hot_load(&normalized)).await?;

        if let Some(store) = &self.store {
            match ctx.run_result(store.append_fact(&normalized)).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => log::warn!("Failed to store learned fact: {}", e),
            }
        }

        let confidence = exemplar.confidence_percent() as f64 / 100.0;
        if let Some(semantic) = &self.semantic {
            let added = semantic
                .add_learned_pattern(ctx, &exemplar.phrase, &exemplar.verb, &exemplar.target, &exemplar.constraint, confidence)
                .await;
            match added {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => log::warn!("Failed to add learned pattern to semantic corpus: {}", e),
            }
        }

        if let Some(path) = self.learned_file() {
            match ctx.run_result(append_line(&path, &normalized)).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => log::warn!("Failed to append to {}: {}", path.display(), e),
            }
        }

        if let Some(taxonomy) = &self.taxonomy {
            if !taxonomy.learn_synonym(&exemplar.verb, &exemplar.phrase) {
                log::debug!("Learned verb {} is not in the taxonomy", exemplar.verb);
            }
        }

        Ok(LearnedExemplar {
            confidence: exemplar.confidence_percent() as f64,
            ..exemplar
        })
    }

    /// Run the critic over `history` and persist whatever it learns.
    pub async fn learn_and_persist(&self, ctx: &Context, history: &[Turn]) -> Result<Option<LearnedExemplar>> {
        let fact = self.learn_from_interaction(ctx, history).await?;
        if fact.is_empty() {
            return Ok(None);
        }
        self.persist_learned_fact(ctx, &fact).await.map(Some)
    }

    /// Replay facts previously written to `learned_taxonomy.mg`.
    ///
    /// The file is read line by line; malformed lines (a truncated append,
    /// a hand edit) are skipped with a warning. Returns the number of facts
    /// loaded; a missing file loads none.
    pub async fn load_learned(&self, ctx: &Context) -> Result<usize> {
        let Some(path) = self.learned_file() else {
            return Ok(0);
        };
        let source = match ctx.run_result(read_optional(&path)).await? {
            Some(source) => source,
            None => return Ok(0),
        };

        let mut exemplars = Vec::new();
        let mut skipped = 0usize;
        for (i, line) in source.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_learned_fact(line) {
                Ok(exemplar) => exemplars.push(exemplar),
                Err(e) => {
                    skipped += 1;
                    log::warn!("{}:{}: skipping learned fact: {}", path.display(), i + 1, e);
                }
            }
        }

        let facts: Vec<Fact> = exemplars.iter().map(LearnedExemplar::to_fact).collect();
        let n = facts.len();
        ctx.run_result(self.kernel.load_facts(facts)).await?;
        if let Some(taxonomy) = &self.taxonomy {
            for exemplar in &exemplars {
                taxonomy.learn_synonym(&exemplar.verb, &exemplar.phrase);
            }
        }
        if skipped > 0 {
            log::warn!("Skipped {} malformed lines in {}", skipped, path.display());
        }
        log::debug!("Loaded {} learned facts from {}", n, path.display());
        Ok(n)
    }
}

async fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(format!("{}\n", line).as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
