//! Intent and Understanding: the structured output of a perception turn.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PerceptionError, Result};
use crate::kernel::{Fact, Term};
use crate::perception::envelope::MemoryOperation;

/// Maximum length in characters of a string argument written into a fact.
pub const MAX_FACT_ARG_LEN: usize = 2048;

/// Verb used whenever nothing better can be determined.
pub const FALLBACK_VERB: &str = "/explain";

/// Confidence of the last-resort fallback intent.
pub const FALLBACK_CONFIDENCE: f64 = 0.3;

/// Target sentinel for "no explicit target".
pub const NO_TARGET: &str = "none";

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Category {
    #[default]
    #[serde(rename = "/query")]
    Query,
    #[serde(rename = "/mutation")]
    Mutation,
    #[serde(rename = "/instruction")]
    Instruction,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "/query",
            Self::Mutation => "/mutation",
            Self::Instruction => "/instruction",
        }
    }

    /// Lenient parse: accepts `query`, `/query`, `QUERY`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().trim_start_matches('/').to_ascii_lowercase().as_str() {
            "query" => Some(Self::Query),
            "mutation" => Some(Self::Mutation),
            "instruction" => Some(Self::Instruction),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = PerceptionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| PerceptionError::validation("category", format!("unknown category {:?}", s)))
    }
}

/// Normalize a verb to its canonical `/name` form.
pub fn normalize_verb(verb: &str) -> String {
    let v = verb.trim().to_ascii_lowercase();
    if v.is_empty() {
        return v;
    }
    if v.starts_with('/') {
        v
    } else {
        format!("/{}", v)
    }
}

/// Clamp a confidence into `[0, 1]`; NaN becomes 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// Sanitization
// ---------------------------------------------------------------------------

/// Strip NUL, DEL and C0 control characters (keeping `\n`, `\r`, `\t`) and cap
/// the length at [`MAX_FACT_ARG_LEN`] characters.
///
/// Quotes and rule syntax are kept; escaping happens when the fact is
/// rendered.
pub fn sanitize_fact_arg(value: &str) -> String {
    value
        .chars()
        .filter(|c| matches!(c, '\n' | '\r' | '\t') || ((*c as u32) >= 0x20 && *c != '\u{7f}'))
        .take(MAX_FACT_ARG_LEN)
        .collect()
}

/// Reduce a verb to characters valid in an atom name.
fn sanitize_atom(verb: &str) -> String {
    let name: String = normalize_verb(verb)
        .trim_start_matches('/')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if name.is_empty() {
        FALLBACK_VERB.to_string()
    } else {
        format!("/{}", name)
    }
}

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

/// The classified meaning of one user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub category: Category,
    pub verb: String,
    pub target: String,
    pub constraint: String,
    pub confidence: f64,
    pub response: String,
    #[serde(default)]
    pub ambiguity: Vec<String>,
    #[serde(default)]
    pub memory_operations: Vec<MemoryOperation>,
}

impl Default for Intent {
    fn default() -> Self {
        Self::fallback()
    }
}

impl Intent {
    /// The safe last-resort intent `(/explain, /query, 0.3)`.
    pub fn fallback() -> Self {
        Self {
            category: Category::Query,
            verb: FALLBACK_VERB.to_string(),
            target: NO_TARGET.to_string(),
            constraint: String::new(),
            confidence: FALLBACK_CONFIDENCE,
            response: String::new(),
            ambiguity: Vec::new(),
            memory_operations: Vec::new(),
        }
    }

    pub fn has_target(&self) -> bool {
        !self.target.is_empty() && self.target != NO_TARGET
    }

    /// `user_intent(/current_intent, /category, /verb, "target", "constraint")`.
    pub fn to_fact(&self) -> Fact {
        Fact::new(
            "user_intent",
            vec![
                Term::atom("current_intent"),
                Term::atom(self.category.as_str()),
                Term::atom(sanitize_atom(&self.verb)),
                Term::str(sanitize_fact_arg(&self.target)),
                Term::str(sanitize_fact_arg(&self.constraint)),
            ],
        )
    }
}

// ---------------------------------------------------------------------------
// Understanding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    #[default]
    Explanation,
    Definition,
    Diagnosis,
    Transformation,
    Creation,
    Removal,
    Verification,
    Search,
    Evaluation,
    Conversation,
    Planning,
    Documentation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    #[default]
    Read,
    Analyze,
    Modify,
    Create,
    Delete,
    Execute,
    Research,
    Converse,
    Plan,
    Document,
    Review,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    #[default]
    General,
    Code,
    Testing,
    Security,
    Performance,
    Documentation,
    Infrastructure,
    Data,
    Architecture,
    Dependencies,
    Git,
    Research,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    Line,
    Block,
    Function,
    Type,
    File,
    Package,
    Module,
    #[default]
    Codebase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Scope {
    pub level: ScopeLevel,
    pub target: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub symbol: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Signals {
    pub is_question: bool,
    pub is_hypothetical: bool,
    pub is_multi_step: bool,
    pub is_negated: bool,
    pub requires_confirmation: bool,
    pub urgency: Urgency,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SuggestedApproach {
    pub mode: String,
    pub primary_shard: String,
    #[serde(default)]
    pub supporting_shards: Vec<String>,
    #[serde(default)]
    pub tools_needed: Vec<String>,
    #[serde(default)]
    pub context_needed: Vec<String>,
}

/// Routing decision filled in by the harness after perception.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Routing {
    pub shard: String,
    #[serde(default)]
    pub reason: String,
}

/// An [`Intent`] with the richer signals downstream planners use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Understanding {
    #[serde(flatten)]
    pub intent: Intent,
    pub semantic_type: SemanticType,
    pub action_type: ActionType,
    pub domain: Domain,
    pub scope: Scope,
    pub signals: Signals,
    #[serde(default)]
    pub user_constraints: Vec<String>,
    #[serde(default)]
    pub implicit_assumptions: Vec<String>,
    pub suggested_approach: SuggestedApproach,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<Routing>,
}

static INTERROGATIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(what|why|how|where|when|who|which|is|are|can|could|does|do|did|should|would|will|has|have)\b")
        .unwrap()
});
static HYPOTHETICAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(what if|suppose|supposing|hypothetically|imagine if|what would happen|would it)\b")
        .unwrap()
});
static MULTI_STEP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\bthen\b|\bafter that\b|\bfirst\b.*\bnext\b|\bstep \d|\band also\b|(?m)^\s*2[.)]\s)")
        .unwrap()
});
static NEGATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(don't|dont|do not|never|not|no longer|stop|shouldn't|mustn't)\b").unwrap()
});
static CRITICAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(critical|outage|emergency|production (is )?down|p0|sev ?1)\b").unwrap()
});
static HIGH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(urgent|urgently|asap|immediately|right now|blocking|quickly)\b").unwrap()
});
static LOW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(no rush|when you have time|eventually|low priority|someday)\b").unwrap()
});
static DESTRUCTIVE_WORDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(--force|force push|rm -rf|\bdrop table\b|\ball files\b)").unwrap());
static LINE_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bline\s+\d+").unwrap());
static FUNCTION_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(function|func|method|fn)\b|\w+\(\)").unwrap());
static TYPE_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(struct|class|type|interface|trait|enum)\b").unwrap());
static MODULE_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(module|crate|package)\b").unwrap());

const DESTRUCTIVE_VERBS: &[&str] = &["/delete", "/deploy", "/migrate", "/reset"];

/// Classification of a verb: semantic type, action type, domain, default shard.
fn verb_profile(verb: &str) -> (SemanticType, ActionType, Domain, &'static str) {
    use ActionType as A;
    use Domain as D;
    use SemanticType as S;
    match verb {
        "/greet" | "/converse" => (S::Conversation, A::Converse, D::General, ""),
        "/explain" => (S::Explanation, A::Read, D::Code, ""),
        "/define" => (S::Definition, A::Read, D::Code, ""),
        "/review" => (S::Evaluation, A::Review, D::Code, "reviewer"),
        "/security" => (S::Evaluation, A::Review, D::Security, "reviewer"),
        "/analyze" => (S::Evaluation, A::Analyze, D::Code, "reviewer"),
        "/performance" | "/optimize" => (S::Transformation, A::Modify, D::Performance, "coder"),
        "/fix" => (S::Transformation, A::Modify, D::Code, "coder"),
        "/debug" => (S::Diagnosis, A::Analyze, D::Code, "coder"),
        "/refactor" => (S::Transformation, A::Modify, D::Architecture, "coder"),
        "/create" | "/implement" => (S::Creation, A::Create, D::Code, "coder"),
        "/delete" => (S::Removal, A::Delete, D::Code, "coder"),
        "/test" => (S::Verification, A::Test, D::Testing, "tester"),
        "/search" => (S::Search, A::Read, D::Code, ""),
        "/document" => (S::Documentation, A::Document, D::Documentation, "coder"),
        "/research" => (S::Search, A::Research, D::Research, "researcher"),
        "/plan" => (S::Planning, A::Plan, D::Architecture, ""),
        "/deploy" => (S::Transformation, A::Execute, D::Infrastructure, "coder"),
        "/migrate" => (S::Transformation, A::Modify, D::Data, "coder"),
        "/git" | "/commit" => (S::Transformation, A::Execute, D::Git, "coder"),
        "/dependencies" => (S::Evaluation, A::Analyze, D::Dependencies, "researcher"),
        _ => (S::Explanation, A::Read, D::General, ""),
    }
}

fn derive_signals(intent: &Intent, input: &str) -> Signals {
    let trimmed = input.trim();
    let urgency = if CRITICAL.is_match(trimmed) {
        Urgency::Critical
    } else if HIGH.is_match(trimmed) {
        Urgency::High
    } else if LOW.is_match(trimmed) {
        Urgency::Low
    } else {
        Urgency::Normal
    };
    Signals {
        is_question: trimmed.ends_with('?') || INTERROGATIVE.is_match(trimmed),
        is_hypothetical: HYPOTHETICAL.is_match(trimmed),
        is_multi_step: MULTI_STEP.is_match(trimmed),
        is_negated: NEGATION.is_match(trimmed),
        requires_confirmation: DESTRUCTIVE_VERBS.contains(&intent.verb.as_str()) || DESTRUCTIVE_WORDS.is_match(trimmed),
        urgency,
    }
}

fn looks_like_file(target: &str) -> bool {
    let last = target.rsplit('/').next().unwrap_or(target);
    match last.rsplit_once('.') {
        Some((stem, ext)) => !stem.is_empty() && !ext.is_empty() && ext.len() <= 6 && ext.chars().all(|c| c.is_ascii_alphanumeric()),
        None => false,
    }
}

fn derive_scope(intent: &Intent, input: &str) -> Scope {
    if !intent.has_target() || intent.target.eq_ignore_ascii_case("codebase") {
        return Scope {
            level: ScopeLevel::Codebase,
            target: "codebase".to_string(),
            ..Default::default()
        };
    }
    let target = intent.target.clone();
    if looks_like_file(&target) {
        let level = if LINE_REF.is_match(input) {
            ScopeLevel::Line
        } else if FUNCTION_REF.is_match(input) {
            ScopeLevel::Function
        } else {
            ScopeLevel::File
        };
        return Scope {
            level,
            file: target.clone(),
            target,
            symbol: String::new(),
        };
    }
    if target.ends_with('/') || target.contains('/') {
        let level = if MODULE_REF.is_match(input) { ScopeLevel::Module } else { ScopeLevel::Package };
        return Scope {
            level,
            target,
            ..Default::default()
        };
    }
    let level = if TYPE_REF.is_match(input) {
        ScopeLevel::Type
    } else if FUNCTION_REF.is_match(input) || target.ends_with("()") {
        ScopeLevel::Function
    } else if MODULE_REF.is_match(input) {
        ScopeLevel::Module
    } else {
        ScopeLevel::Block
    };
    Scope {
        level,
        symbol: target.trim_end_matches("()").to_string(),
        target,
        file: String::new(),
    }
}

fn approach_mode(intent: &Intent, signals: &Signals) -> &'static str {
    if signals.is_hypothetical {
        return "analyze";
    }
    match intent.category {
        Category::Mutation if signals.is_multi_step => "plan",
        Category::Mutation => "execute",
        Category::Instruction => "configure",
        Category::Query if intent.verb == "/greet" || intent.verb == "/converse" => "converse",
        Category::Query => "answer",
    }
}

impl Understanding {
    /// Derive an Understanding from a classified intent and its input text.
    pub fn from_intent(intent: &Intent, input: &str) -> Self {
        let (semantic_type, action_type, domain, shard) = verb_profile(&intent.verb);
        let signals = derive_signals(intent, input);
        let scope = derive_scope(intent, input);

        let mut user_constraints = Vec::new();
        if !intent.constraint.trim().is_empty() && intent.constraint != NO_TARGET {
            user_constraints.push(intent.constraint.clone());
        }
        let mut implicit_assumptions = Vec::new();
        if scope.level == ScopeLevel::Codebase && intent.category == Category::Mutation {
            implicit_assumptions.push("change applies across the codebase".to_string());
        }
        if intent.category == Category::Mutation && !signals.is_hypothetical {
            implicit_assumptions.push("existing behaviour outside the target is preserved".to_string());
        }

        let mut context_needed = Vec::new();
        if !scope.file.is_empty() {
            context_needed.push(scope.file.clone());
        }
        let tools_needed = match action_type {
            ActionType::Modify | ActionType::Create | ActionType::Delete => vec!["edit".to_string()],
            ActionType::Test | ActionType::Execute => vec!["exec".to_string()],
            ActionType::Research => vec!["web".to_string()],
            ActionType::Review | ActionType::Analyze | ActionType::Read => vec!["read".to_string()],
            _ => Vec::new(),
        };
        let supporting_shards = match domain {
            Domain::Security if shard != "reviewer" => vec!["reviewer".to_string()],
            Domain::Testing if shard != "tester" => vec!["tester".to_string()],
            _ if intent.category == Category::Mutation && shard == "coder" => vec!["tester".to_string()],
            _ => Vec::new(),
        };

        Self {
            semantic_type,
            action_type,
            domain,
            suggested_approach: SuggestedApproach {
                mode: approach_mode(intent, &signals).to_string(),
                primary_shard: shard.to_string(),
                supporting_shards,
                tools_needed,
                context_needed,
            },
            scope,
            signals,
            user_constraints,
            implicit_assumptions,
            routing: None,
            intent: intent.clone(),
        }
    }

    /// Replace the primary shard with the taxonomy's hint when it has one.
    pub fn with_primary_shard(mut self, shard: &str) -> Self {
        if !shard.is_empty() {
            self.suggested_approach.primary_shard = shard.to_string();
        }
        self
    }

    /// Apply model-provided fields from a `control_packet.understanding`
    /// object. Unknown or malformed fields are ignored.
    pub fn apply_overrides(&mut self, value: &Value) {
        let Some(obj) = value.as_object() else {
            return;
        };
        fn take<T: serde::de::DeserializeOwned>(obj: &serde_json::Map<String, Value>, key: &str) -> Option<T> {
            obj.get(key).and_then(|v| serde_json::from_value(v.clone()).ok())
        }
        if let Some(v) = take(obj, "semantic_type") {
            self.semantic_type = v;
        }
        if let Some(v) = take(obj, "action_type") {
            self.action_type = v;
        }
        if let Some(v) = take(obj, "domain") {
            self.domain = v;
        }
        if let Some(v) = take(obj, "scope") {
            self.scope = v;
        }
        if let Some(v) = take(obj, "signals") {
            self.signals = v;
        }
        if let Some(v) = take(obj, "user_constraints") {
            self.user_constraints = v;
        }
        if let Some(v) = take(obj, "implicit_assumptions") {
            self.implicit_assumptions = v;
        }
        if let Some(v) = take(obj, "suggested_approach") {
            self.suggested_approach = v;
        }
    }

    /// Whether acting on this understanding must not change anything.
    pub fn is_read_only(&self) -> bool {
        self.intent.category == Category::Query || self.signals.is_hypothetical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_parse_and_serde() {
        assert_eq!(Category::parse("QUERY"), Some(Category::Query));
        assert_eq!(Category::parse("/mutation"), Some(Category::Mutation));
        assert!("bogus".parse::<Category>().is_err());
        assert_eq!(serde_json::to_string(&Category::Instruction).unwrap(), "\"/instruction\"");
    }

    #[test]
    fn test_sanitize_fact_arg() {
        let raw = "a\0b\x01c\nd\te\rf\u{7f}g é 漢";
        assert_eq!(sanitize_fact_arg(raw), "abc\nd\te\rfg é 漢");
        let long: String = "x".repeat(5000);
        assert_eq!(sanitize_fact_arg(&long).chars().count(), MAX_FACT_ARG_LEN);
    }

    #[test]
    fn test_to_fact_strips_controls_and_keeps_syntax() {
        let intent = Intent {
            category: Category::Mutation,
            verb: "/fix".into(),
            target: "auth.go\"). malicious_rule(X) :- user_intent(X).\0".into(),
            constraint: "none".into(),
            ..Intent::fallback()
        };
        let fact = intent.to_fact();
        assert_eq!(fact.predicate, "user_intent");
        assert_eq!(fact.args[2], Term::atom("/fix"));
        let target = fact.args[3].as_str().unwrap();
        assert!(!target.contains('\0'));
        assert!(target.contains("malicious_rule"));
        // The rendered fact keeps the quote escaped inside the string.
        assert!(fact.to_source().contains("auth.go\\\")"));
    }

    #[test]
    fn test_to_fact_sanitizes_verb() {
        let intent = Intent {
            verb: "fix). evil(X".into(),
            ..Intent::fallback()
        };
        assert_eq!(intent.to_fact().args[2], Term::atom("/fixevilx"));
    }

    #[test]
    fn test_hypothetical_is_read_only() {
        let intent = Intent {
            category: Category::Mutation,
            verb: "/delete".into(),
            target: "auth.go".into(),
            ..Intent::fallback()
        };
        let u = Understanding::from_intent(&intent, "what if I deleted auth.go?");
        assert!(u.signals.is_hypothetical);
        assert!(u.signals.is_question);
        assert!(u.signals.requires_confirmation);
        assert!(u.is_read_only());
        assert_eq!(u.scope.level, ScopeLevel::File);
        assert_eq!(u.suggested_approach.mode, "analyze");
    }

    #[test]
    fn test_signals_and_scope() {
        let intent = Intent {
            category: Category::Mutation,
            verb: "/fix".into(),
            target: "internal/perception/transducer.go".into(),
            ..Intent::fallback()
        };
        let u = Understanding::from_intent(&intent, "urgent: fix line 42 in transducer.go then run tests");
        assert_eq!(u.signals.urgency, Urgency::High);
        assert!(u.signals.is_multi_step);
        assert_eq!(u.scope.level, ScopeLevel::Line);
        assert_eq!(u.scope.file, "internal/perception/transducer.go");
        assert_eq!(u.suggested_approach.primary_shard, "coder");
        assert!(!u.is_read_only());
    }

    #[test]
    fn test_apply_overrides() {
        let mut u = Understanding::from_intent(&Intent::fallback(), "explain this");
        u.apply_overrides(&serde_json::json!({
            "domain": "security",
            "signals": {"is_question": true, "is_hypothetical": false, "is_multi_step": false,
                        "is_negated": false, "requires_confirmation": false, "urgency": "critical"},
            "action_type": "not-a-variant"
        }));
        assert_eq!(u.domain, Domain::Security);
        assert_eq!(u.signals.urgency, Urgency::Critical);
        assert_eq!(u.action_type, ActionType::Read);
    }
}
