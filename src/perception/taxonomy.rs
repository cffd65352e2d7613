//! Verb taxonomy: canonical verbs with synonyms, patterns and priorities.
//!
//! The corpus is built from kernel facts (`verb_def`, `verb_synonym`,
//! `verb_pattern`). When the kernel is unavailable or holds no
//! definitions, a minimal safe corpus containing only `/explain` is used.

use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};

use crate::context::Context;
use crate::error::{PerceptionError, Result};
use crate::kernel::{Fact, Kernel, Term};
use crate::perception::intent::{normalize_verb, Category, FALLBACK_VERB, NO_TARGET};

/// Default taxonomy program shipped with the crate.
pub const DEFAULT_TAXONOMY: &str = include_str!("taxonomy.mg");

/// Inputs are cut to this many characters before any regex runs.
pub const MAX_CLASSIFY_INPUT: usize = 2000;

/// Priority of verbs known only from `intent_definition` facts.
pub const DEFINITION_PRIORITY: i64 = 50;

const PATTERN_SIZE_LIMIT: usize = 1 << 20;

// ---------------------------------------------------------------------------
// Verb entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VerbEntry {
    pub verb: String,
    pub category: Category,
    /// Lower-case phrases matched as substrings.
    pub synonyms: Vec<String>,
    /// Case-insensitive patterns, in declaration order.
    pub patterns: Vec<Regex>,
    /// Tie-breaker; higher wins.
    pub priority: i64,
    pub shard_type: String,
}

impl VerbEntry {
    pub fn new(verb: &str, category: Category, priority: i64, shard_type: &str) -> Self {
        Self {
            verb: normalize_verb(verb),
            category,
            synonyms: Vec::new(),
            patterns: Vec::new(),
            priority,
            shard_type: shard_type.to_string(),
        }
    }

    pub fn add_synonym(&mut self, synonym: &str) {
        let synonym = synonym.trim().to_lowercase();
        if !synonym.is_empty() && !self.synonyms.contains(&synonym) {
            self.synonyms.push(synonym);
        }
    }

    pub fn add_pattern(&mut self, pattern: &str) -> Result<()> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
            .map_err(|e| PerceptionError::validation("verb_pattern", format!("{}: {}", self.verb, e)))?;
        self.patterns.push(regex);
        Ok(())
    }

    pub fn with_synonym(mut self, synonym: &str) -> Self {
        self.add_synonym(synonym);
        self
    }

    pub fn with_pattern(mut self, pattern: &str) -> Result<Self> {
        self.add_pattern(pattern)?;
        Ok(self)
    }

    /// How `lowered` matches this entry, if at all. Pattern matches win.
    fn match_kind(&self, lowered: &str) -> Option<MatchKind> {
        if self.patterns.iter().any(|p| p.is_match(lowered)) {
            return Some(MatchKind::Pattern);
        }
        self.synonyms
            .iter()
            .filter(|s| lowered.contains(s.as_str()))
            .map(|s| s.chars().count())
            .max()
            .map(MatchKind::Synonym)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Pattern,
    /// Matched through a synonym of this many characters.
    Synonym(usize),
}

/// A verb proposed by regex candidate generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub verb: String,
    pub category: Category,
    pub priority: i64,
    pub shard_type: String,
    pub matched: MatchKind,
}

impl Candidate {
    /// Heuristic confidence in `[0.3, 1.0]`.
    pub fn heuristic_score(&self) -> f64 {
        let p = self.priority as f64;
        let base = match self.matched {
            MatchKind::Pattern => 50.0 + p / 10.0,
            MatchKind::Synonym(len) => 20.0 + len as f64 / 2.0 + p / 20.0,
        };
        ((base + p / 50.0) / 100.0).clamp(0.3, 1.0)
    }
}

/// The highest-scoring candidate; ties keep corpus order.
pub fn best_heuristic(candidates: &[Candidate]) -> Option<(&Candidate, f64)> {
    let mut best: Option<(&Candidate, f64)> = None;
    for c in candidates {
        let score = c.heuristic_score();
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((c, score));
        }
    }
    best
}

/// Cut `input` to [`MAX_CLASSIFY_INPUT`] characters.
pub fn truncate_input(input: &str) -> &str {
    match input.char_indices().nth(MAX_CLASSIFY_INPUT) {
        Some((idx, _)) => &input[..idx],
        None => input,
    }
}

// ---------------------------------------------------------------------------
// Corpus
// ---------------------------------------------------------------------------

/// Ordered set of verb entries with unique verbs.
#[derive(Debug, Clone, Default)]
pub struct VerbCorpus {
    entries: Vec<VerbEntry>,
}

impl VerbCorpus {
    pub fn new(entries: Vec<VerbEntry>) -> Result<Self> {
        let mut seen = HashSet::new();
        for e in &entries {
            if !seen.insert(e.verb.clone()) {
                return Err(PerceptionError::validation("verb", format!("duplicate verb {}", e.verb)));
            }
        }
        Ok(Self { entries })
    }

    /// The corpus used when no definitions can be loaded.
    pub fn safe() -> Self {
        Self {
            entries: vec![VerbEntry::new(FALLBACK_VERB, Category::Query, 1, "")],
        }
    }

    /// Build a corpus from taxonomy facts. Malformed facts and bad
    /// patterns are skipped with a warning.
    ///
    /// A verb that only appears in `intent_definition` facts gets an entry
    /// whose category comes from its phrases, with each phrase as a synonym.
    pub fn from_facts(defs: &[Fact], synonyms: &[Fact], patterns: &[Fact], definitions: &[Fact]) -> Self {
        let mut entries: Vec<VerbEntry> = Vec::new();
        for def in defs {
            let (Some(verb), Some(category)) = (
                def.arg(0).and_then(Term::as_str),
                def.arg(1).and_then(Term::as_str).and_then(Category::parse),
            ) else {
                log::warn!("Skipping malformed verb_def: {}", def);
                continue;
            };
            let shard = def.arg(2).and_then(Term::as_str).unwrap_or("");
            let priority = def.arg(3).and_then(Term::as_i64).unwrap_or(0);
            let verb = normalize_verb(verb);
            if entries.iter().any(|e| e.verb == verb) {
                continue;
            }
            entries.push(VerbEntry::new(&verb, category, priority, shard));
        }

        let defined = entries.len();
        for fact in definitions {
            let (Some(phrase), Some(verb)) = (
                fact.arg(0).and_then(Term::as_str),
                fact.arg(1).and_then(Term::as_str),
            ) else {
                log::warn!("Skipping malformed intent_definition: {}", fact);
                continue;
            };
            let verb = normalize_verb(verb);
            match entries.iter().position(|e| e.verb == verb) {
                Some(i) if i < defined => {}
                Some(i) => entries[i].add_synonym(phrase),
                None => {
                    let category = refine_category(phrase, Category::Query);
                    let mut entry = VerbEntry::new(&verb, category, DEFINITION_PRIORITY, "");
                    entry.add_synonym(phrase);
                    entries.push(entry);
                }
            }
        }

        let entry_for = |entries: &[VerbEntry], fact: &Fact| -> Option<usize> {
            let verb = normalize_verb(fact.arg(0).and_then(Term::as_str)?);
            entries.iter().position(|e| e.verb == verb)
        };
        for fact in synonyms {
            match (entry_for(&entries, fact), fact.arg(1).and_then(Term::as_str)) {
                (Some(i), Some(syn)) => entries[i].add_synonym(syn),
                _ => log::debug!("Ignoring verb_synonym without verb_def: {}", fact),
            }
        }
        for fact in patterns {
            match (entry_for(&entries, fact), fact.arg(1).and_then(Term::as_str)) {
                (Some(i), Some(pattern)) => {
                    if let Err(e) = entries[i].add_pattern(pattern) {
                        log::warn!("Skipping invalid verb pattern: {}", e);
                    }
                }
                _ => log::debug!("Ignoring verb_pattern without verb_def: {}", fact),
            }
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[VerbEntry] {
        &self.entries
    }

    pub fn get(&self, verb: &str) -> Option<&VerbEntry> {
        let verb = normalize_verb(verb);
        self.entries.iter().find(|e| e.verb == verb)
    }

    pub fn contains(&self, verb: &str) -> bool {
        self.get(verb).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Verbs whose patterns or synonyms match `input`, in corpus order.
    pub fn candidates(&self, input: &str) -> Vec<Candidate> {
        let lowered = truncate_input(input).to_lowercase();
        self.entries
            .iter()
            .filter_map(|e| {
                e.match_kind(&lowered).map(|matched| Candidate {
                    verb: e.verb.clone(),
                    category: e.category,
                    priority: e.priority,
                    shard_type: e.shard_type.clone(),
                    matched,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Target, constraint and category extraction
// ---------------------------------------------------------------------------

const FILE_EXT: &str = r"(?:go|rs|py|js|jsx|ts|tsx|java|kt|c|cc|cpp|h|hpp|rb|php|cs|swift|scala|md|json|ya?ml|toml|sql|sh|mg|proto|html|css)";

static TARGET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // quoted path
        format!(r#"["'`]((?:[\w.\-]+/)*[\w.\-]+\.{})["'`]"#, FILE_EXT),
        // bare path
        format!(r"(?:^|[\s(])((?:[\w.\-]+/)*[\w\-]+(?:\.[\w\-]+)*\.{})\b", FILE_EXT),
        r"(?i)\b(?:function|func|method|fn|class|struct|type|interface|trait|enum)\s+`?([A-Za-z_][\w:.]*)".to_string(),
        r"\b([A-Za-z_][\w:.]*)\(\)".to_string(),
        r"`([^`]+)`".to_string(),
        r#""([^"]+)""#.to_string(),
        r"(?i)\b(?:my|the|this|our|entire|whole)\s+(code(?:base)?|project|repo(?:sitory)?)\b".to_string(),
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static CONSTRAINT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(?:in|using|with)\s+(go|golang|rust|python|typescript|javascript|java|kotlin|swift|ruby|c\+\+|c#)\b",
        r"(?i)\b(without\s+[\w\s\-]+?)(?:[.,;!?]|$)",
        r"(?i)\b(only\s+[\w\s\-]+?)(?:[.,;!?]|$)",
        r"(?i)\b(?:for|focus(?:ing)?\s+on)\s+(performance|readability|security|memory(?:\s+usage)?|correctness|maintainability|thread[\s\-]safety)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static INSTRUCTION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(always|never|from now on|remember to|remember that|prefer|don't ever|by default)\b").unwrap()
});
static QUERY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(what|why|how|where|when|who|which|is|are|can you explain|could you explain|does|do|should|would)\b|\?\s*$")
        .unwrap()
});
static MUTATION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(please\s+)?(fix|add|create|delete|remove|refactor|rename|update|change|implement|write|move|replace|make)\b")
        .unwrap()
});

/// First target reference found in `input`, or `"none"`.
pub fn extract_target(input: &str) -> String {
    let input = truncate_input(input);
    TARGET_PATTERNS
        .iter()
        .find_map(|re| re.captures(input).and_then(|c| c.get(1)).map(|m| m.as_str().trim().to_string()))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| NO_TARGET.to_string())
}

/// First constraint phrase found in `input`, or an empty string.
pub fn extract_constraint(input: &str) -> String {
    let input = truncate_input(input);
    CONSTRAINT_PATTERNS
        .iter()
        .find_map(|re| re.captures(input).and_then(|c| c.get(1)).map(|m| m.as_str().trim().to_string()))
        .unwrap_or_default()
}

/// Override `default` when the phrasing clearly signals a category.
pub fn refine_category(input: &str, default: Category) -> Category {
    let input = truncate_input(input);
    if INSTRUCTION_PATTERN.is_match(input) {
        Category::Instruction
    } else if QUERY_PATTERN.is_match(input) {
        Category::Query
    } else if MUTATION_PATTERN.is_match(input) {
        Category::Mutation
    } else {
        default
    }
}

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

/// Shared, reloadable handle to the verb corpus.
#[derive(Debug)]
pub struct Taxonomy {
    corpus: RwLock<Arc<VerbCorpus>>,
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self::new(VerbCorpus::safe())
    }
}

impl Taxonomy {
    pub fn new(corpus: VerbCorpus) -> Self {
        Self {
            corpus: RwLock::new(Arc::new(corpus)),
        }
    }

    /// Load the corpus from the kernel, falling back to the safe corpus.
    pub async fn load(ctx: &Context, kernel: &dyn Kernel) -> Self {
        let taxonomy = Self::default();
        if let Err(e) = taxonomy.reload(ctx, kernel).await {
            log::warn!("Verb taxonomy unavailable, using safe corpus: {}", e);
        }
        taxonomy
    }

    /// Rebuild the corpus from kernel facts. Returns the number of verbs.
    pub async fn reload(&self, ctx: &Context, kernel: &dyn Kernel) -> Result<usize> {
        let defs = ctx.run_result(kernel.query("verb_def")).await?;
        let definitions = ctx.run_result(kernel.query("intent_definition")).await?;
        if defs.is_empty() && definitions.is_empty() {
            return Err(PerceptionError::Kernel("no verb_def or intent_definition facts loaded".into()));
        }
        let synonyms = ctx.run_result(kernel.query("verb_synonym")).await?;
        let patterns = ctx.run_result(kernel.query("verb_pattern")).await?;
        let corpus = VerbCorpus::from_facts(&defs, &synonyms, &patterns, &definitions);
        let n = corpus.len();
        *self.corpus.write() = Arc::new(corpus);
        log::debug!("Verb taxonomy loaded with {} verbs", n);
        Ok(n)
    }

    /// Snapshot of the current corpus.
    pub fn corpus(&self) -> Arc<VerbCorpus> {
        self.corpus.read().clone()
    }

    pub fn candidates(&self, input: &str) -> Vec<Candidate> {
        self.corpus().candidates(input)
    }

    pub fn contains(&self, verb: &str) -> bool {
        self.corpus().contains(verb)
    }

    /// Record a learned phrase as a synonym of an existing verb.
    /// Returns false when the verb is unknown.
    pub fn learn_synonym(&self, verb: &str, phrase: &str) -> bool {
        let mut guard = self.corpus.write();
        let mut corpus = (**guard).clone();
        let verb = normalize_verb(verb);
        let Some(entry) = corpus.entries.iter_mut().find(|e| e.verb == verb) else {
            return false;
        };
        entry.add_synonym(phrase);
        *guard = Arc::new(corpus);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MemoryKernel;

    async fn default_taxonomy() -> Taxonomy {
        let kernel = MemoryKernel::from_source(DEFAULT_TAXONOMY).unwrap();
        Taxonomy::load(&Context::background(), &kernel).await
    }

    #[tokio::test]
    async fn test_default_taxonomy_loads() {
        let t = default_taxonomy().await;
        let corpus = t.corpus();
        assert!(corpus.len() >= 20);
        let fix = corpus.get("fix").unwrap();
        assert_eq!(fix.category, Category::Mutation);
        assert_eq!(fix.shard_type, "coder");
        assert!(!fix.patterns.is_empty());
    }

    #[tokio::test]
    async fn test_corpus_from_intent_definitions_only() {
        let kernel = MemoryKernel::from_source(
            "intent_definition(\"fix the bug\", /fix, \"bug\").\n\
             intent_definition(\"deploy it\", /deploy, \"none\").\n\
             intent_definition(\"ship to prod\", /deploy, \"none\").",
        )
        .unwrap();
        let t = Taxonomy::load(&Context::background(), &kernel).await;
        let corpus = t.corpus();
        let verbs: Vec<&str> = corpus.entries().iter().map(|e| e.verb.as_str()).collect();
        assert_eq!(verbs, vec!["/fix", "/deploy"]);
        assert_eq!(corpus.get("/fix").unwrap().category, Category::Mutation);
        let deploy = corpus.get("/deploy").unwrap();
        assert_eq!(deploy.priority, DEFINITION_PRIORITY);
        assert_eq!(deploy.synonyms, vec!["deploy it", "ship to prod"]);

        let candidates = t.candidates("please ship to prod tonight");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].verb, "/deploy");
    }

    #[tokio::test]
    async fn test_intent_definitions_extend_verb_defs() {
        let kernel = MemoryKernel::from_source(
            "verb_def(/fix, /mutation, \"coder\", 90).\n\
             intent_definition(\"fix the bug\", /fix, \"none\", \"\").\n\
             intent_definition(\"deploy it\", /deploy, \"none\", \"\").",
        )
        .unwrap();
        let t = Taxonomy::load(&Context::background(), &kernel).await;
        let corpus = t.corpus();
        assert_eq!(corpus.len(), 2);
        let fix = corpus.get("/fix").unwrap();
        assert_eq!(fix.priority, 90);
        assert!(fix.synonyms.is_empty());
        assert!(corpus.contains("/deploy"));
    }

    #[tokio::test]
    async fn test_safe_corpus_when_kernel_empty() {
        let t = Taxonomy::load(&Context::background(), &MemoryKernel::new()).await;
        let corpus = t.corpus();
        assert_eq!(corpus.len(), 1);
        assert_eq!(corpus.entries()[0].verb, "/explain");
        assert_eq!(corpus.entries()[0].priority, 1);
    }

    #[tokio::test]
    async fn test_candidates_and_heuristic() {
        let t = default_taxonomy().await;
        let c = t.candidates("check my code for security issues");
        let verbs: Vec<&str> = c.iter().map(|c| c.verb.as_str()).collect();
        assert!(verbs.contains(&"/security"));
        assert!(verbs.contains(&"/review"));
        let (best, score) = best_heuristic(&c).unwrap();
        assert_eq!(best.verb, "/security");
        assert!((0.3..=1.0).contains(&score));

        let c = t.candidates("fix the null pointer in internal/perception/transducer.go line 42");
        assert_eq!(best_heuristic(&c).unwrap().0.verb, "/fix");

        let c = t.candidates("Hello world");
        assert_eq!(best_heuristic(&c).unwrap().0.verb, "/greet");
    }

    #[test]
    fn test_heuristic_formula() {
        let pattern = Candidate {
            verb: "/x".into(),
            category: Category::Query,
            priority: 100,
            shard_type: String::new(),
            matched: MatchKind::Pattern,
        };
        assert!((pattern.heuristic_score() - 0.62).abs() < 1e-9);
        let synonym = Candidate {
            matched: MatchKind::Synonym(4),
            priority: 0,
            ..pattern
        };
        assert!((synonym.heuristic_score() - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_long_input_truncated() {
        let t = default_taxonomy().await;
        let input = format!("{}fix", "a".repeat(5000));
        assert!(t.candidates(&input).is_empty());
        assert_eq!(truncate_input(&input).chars().count(), MAX_CLASSIFY_INPUT);
    }

    #[test]
    fn test_extract_target() {
        assert_eq!(
            extract_target("fix the null pointer in internal/perception/transducer.go line 42"),
            "internal/perception/transducer.go"
        );
        assert_eq!(extract_target("look at 'src/main.rs' please"), "src/main.rs");
        assert_eq!(extract_target("refactor function parseIntent"), "parseIntent");
        assert_eq!(extract_target("why does handle() fail"), "handle");
        assert_eq!(extract_target("check my code for security issues"), "code");
        assert_eq!(extract_target("hello"), NO_TARGET);
    }

    #[test]
    fn test_extract_constraint() {
        assert_eq!(extract_constraint("rewrite this in Rust"), "Rust");
        assert_eq!(extract_constraint("refactor without breaking the api."), "without breaking the api");
        assert_eq!(extract_constraint("review only public functions"), "only public functions");
        assert_eq!(extract_constraint("review it for performance"), "performance");
        assert_eq!(extract_constraint("hello"), "");
    }

    #[test]
    fn test_refine_category() {
        assert_eq!(refine_category("always use tabs", Category::Query), Category::Instruction);
        assert_eq!(refine_category("what if I deleted auth.go?", Category::Mutation), Category::Query);
        assert_eq!(refine_category("please fix it", Category::Query), Category::Mutation);
        assert_eq!(refine_category("security scan", Category::Query), Category::Query);
    }

    #[tokio::test]
    async fn test_learn_synonym() {
        let t = default_taxonomy().await;
        assert!(t.learn_synonym("/review", "give it a once-over"));
        assert!(!t.learn_synonym("/nonexistent", "x"));
        let c = t.candidates("give it a once-over");
        assert!(c.iter().any(|c| c.verb == "/review"));
    }
}
