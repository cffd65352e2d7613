//! Degraded parsing paths used when the Piggyback envelope is unavailable.
//!
//! The simple parser reads a pipe-delimited line
//! (`category|verb|target|constraint[|confidence]`) followed by free text.
//! The heuristic parser needs no model at all.

use crate::context::Context;
use crate::error::Result;
use crate::kernel::Kernel;
use crate::perception::envelope::normalize_confidence;
use crate::perception::intent::{normalize_verb, Category, Intent, NO_TARGET};
use crate::perception::matcher::{match_verb, MatchOrigin, VerbMatch};
use crate::perception::semantic::SemanticClassifier;
use crate::perception::taxonomy::{extract_constraint, extract_target, refine_category, Taxonomy};

/// Confidence given to simple-parser results that carry none.
pub const SIMPLE_DEFAULT_CONFIDENCE: f64 = 0.6;

/// Parse a pipe-delimited classification.
///
/// Returns `None` unless a line with at least four fields, a known
/// category and a non-empty verb is present.
pub fn parse_simple_response(text: &str) -> Option<Intent> {
    let lines: Vec<&str> = text.lines().collect();
    let (idx, fields) = lines.iter().enumerate().find_map(|(i, line)| {
        let line = line.trim().trim_matches('`');
        let fields: Vec<&str> = line.split('|').map(str::trim).collect();
        (fields.len() >= 4).then_some((i, fields))
    })?;

    let category = Category::parse(fields[0])?;
    let verb = normalize_verb(fields[1]);
    if verb.is_empty() || verb == "/" {
        return None;
    }
    let target = match fields[2] {
        "" => NO_TARGET.to_string(),
        t => t.to_string(),
    };
    let constraint = match fields[3] {
        c if c.eq_ignore_ascii_case("none") => String::new(),
        c => c.to_string(),
    };
    let confidence = fields
        .get(4)
        .and_then(|c| c.trim_end_matches('%').parse::<f64>().ok())
        .map(normalize_confidence)
        .unwrap_or(SIMPLE_DEFAULT_CONFIDENCE);
    let response = lines[idx + 1..].join("\n").trim().to_string();

    Some(Intent {
        category,
        verb,
        target,
        constraint,
        confidence,
        response,
        ..Intent::fallback()
    })
}

/// Surface text for intents produced without a model.
pub fn heuristic_response(intent: &Intent) -> String {
    match intent.verb.as_str() {
        "/greet" => "Hello! What would you like to work on?".to_string(),
        "/converse" => "Happy to help. What's next?".to_string(),
        verb if intent.has_target() => format!("Understood: {} {}.", verb.trim_start_matches('/'), intent.target),
        verb => format!("Understood: {}.", verb.trim_start_matches('/')),
    }
}

/// Build an intent from a hybrid verb match plus regex target, constraint
/// and category extraction.
pub fn intent_from_match(input: &str, m: &VerbMatch) -> Intent {
    let mut intent = Intent {
        category: refine_category(input, m.category),
        verb: m.verb.clone(),
        target: extract_target(input),
        constraint: extract_constraint(input),
        confidence: m.confidence,
        ..Intent::fallback()
    };
    intent.ambiguity.push(format!(
        "heuristic classification ({})",
        match m.origin {
            MatchOrigin::Kernel => "kernel",
            MatchOrigin::Heuristic => "regex",
            MatchOrigin::Fallback => "fallback",
        }
    ));
    intent.response = heuristic_response(&intent);
    intent
}

/// Classify `input` without a model.
pub async fn heuristic_intent(
    ctx: &Context,
    input: &str,
    taxonomy: &Taxonomy,
    semantic: Option<&SemanticClassifier>,
    kernel: Option<&dyn Kernel>,
) -> Result<Intent> {
    let m = match_verb(ctx, input, taxonomy, semantic, kernel).await?;
    Ok(intent_from_match(input, &m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MemoryKernel;
    use crate::perception::taxonomy::DEFAULT_TAXONOMY;

    #[test]
    fn test_parse_simple_response() {
        let intent = parse_simple_response("/mutation|/fix|auth.go|none|0.8\nFixing the bug now.").unwrap();
        assert_eq!(intent.category, Category::Mutation);
        assert_eq!(intent.verb, "/fix");
        assert_eq!(intent.target, "auth.go");
        assert_eq!(intent.constraint, "");
        assert!((intent.confidence - 0.8).abs() < 1e-9);
        assert_eq!(intent.response, "Fixing the bug now.");

        let intent = parse_simple_response("Sure.\nquery|explain||in Rust").unwrap();
        assert_eq!(intent.verb, "/explain");
        assert_eq!(intent.target, NO_TARGET);
        assert_eq!(intent.constraint, "in Rust");
        assert_eq!(intent.confidence, SIMPLE_DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_parse_simple_rejects_garbage() {
        assert!(parse_simple_response("just prose").is_none());
        assert!(parse_simple_response("bogus|/fix|a|b").is_none());
        assert!(parse_simple_response("/query||a|b").is_none());
    }

    #[tokio::test]
    async fn test_heuristic_scenarios() {
        let kernel = MemoryKernel::from_source(DEFAULT_TAXONOMY).unwrap();
        let ctx = Context::background();
        let taxonomy = Taxonomy::load(&ctx, &kernel).await;

        let i = heuristic_intent(&ctx, "fix the null pointer in internal/perception/transducer.go line 42", &taxonomy, None, Some(&kernel))
            .await
            .unwrap();
        assert_eq!(i.category, Category::Mutation);
        assert!(i.verb == "/fix" || i.verb == "/debug");
        assert!(i.target.contains("transducer.go"));

        let i = heuristic_intent(&ctx, "check my code for security issues", &taxonomy, None, Some(&kernel))
            .await
            .unwrap();
        assert_eq!(i.verb, "/security");
        assert_eq!(i.category, Category::Query);
        assert!(i.target.contains("code"));

        let i = heuristic_intent(&ctx, "Hello world", &taxonomy, None, None).await.unwrap();
        assert_eq!(i.verb, "/greet");
        assert!(!i.response.is_empty());

        let i = heuristic_intent(&ctx, "qwerty", &taxonomy, None, None).await.unwrap();
        assert_eq!(i.verb, "/explain");
        assert_eq!(i.confidence, 0.3);
    }
}
