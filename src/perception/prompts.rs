//! Default system prompts and prompt section builders.
//!
//! Harnesses with their own prompt assembly override these through
//! [`TransducerConfig`](crate::perception::transducer::TransducerConfig)
//! and the critic's builder; the defaults keep the layer usable on its own.

use crate::llms::schema::schema_prompt_suffix;
use crate::perception::taxonomy::VerbCorpus;

pub const TRANSDUCER_SYSTEM_PROMPT: &str = r#"You are the perception layer of a coding agent. Classify the user's message and answer it.

Reply with exactly one JSON object and nothing else. It has two fields, in this order:

1. "control_packet" (write this FIRST):
   - "intent_classification": {"category", "verb", "target", "constraint", "confidence"}
     category is one of /query, /mutation, /instruction.
     verb is one of the canonical verbs listed below.
     target is the file, symbol, or "codebase" the request is about ("none" if there is none).
     constraint is any restriction the user stated ("" if none).
     confidence is a number between 0 and 1.
   - "mangle_updates": rule-language facts or rules to record, each ending with a period. Use [] when there are none.
   - "memory_operations": [{"op", "key", "value"}] for facts worth remembering. Use [] when there are none.
   - "self_correction": {"triggered", "hypothesis"} when you are correcting an earlier misunderstanding.
2. "surface_response": the reply shown to the user.

Never describe an action as done in surface_response unless the control_packet records it.
Never mention the control_packet to the user."#;

pub const SIMPLE_SYSTEM_PROMPT: &str = "Classify the user's message. Reply with one line in the form \
category|verb|target|constraint|confidence where category is /query, /mutation or /instruction, \
verb is a canonical verb such as /explain or /fix, target is a file, symbol or \"none\", and \
confidence is between 0 and 1. After that line, write a short reply to the user.";

pub const FOCUS_SYSTEM_PROMPT: &str = r#"You resolve vague references to code locations.
Given a reference and a list of candidate paths, pick the candidate the user most likely means.
Reply with one JSON object: {"selected": "<one candidate, copied exactly>", "confidence": <0-100>, "reasoning": "<one sentence>"}.
If no candidate fits, set "selected" to "" and "confidence" to 0."#;

pub const CRITIC_SYSTEM_PROMPT: &str = r#"You review a short conversation between a user and a coding agent.
Look for a phrase the user used whose meaning the agent misread at first and the user then clarified.
If you find one, reply with exactly one fact and nothing else:
learned_exemplar("<user phrase>", /<verb>, "<target>", "<constraint>", <confidence 0.0-1.0>).
If there is nothing to learn, reply with nothing."#;

/// Section listing the verbs the model may choose from.
pub fn verb_catalog(corpus: &VerbCorpus) -> String {
    let mut out = String::from("Canonical verbs:\n");
    for entry in corpus.entries() {
        out.push_str(&format!("- {} ({})", entry.verb, entry.category));
        if !entry.synonyms.is_empty() {
            let shown: Vec<&str> = entry.synonyms.iter().take(4).map(String::as_str).collect();
            out.push_str(&format!(": {}", shown.join(", ")));
        }
        out.push('\n');
    }
    out
}

/// The transducer's full system prompt for `corpus`.
pub fn transducer_system_prompt(base: &str, corpus: &VerbCorpus) -> String {
    format!("{}\n\n{}\n{}", base, verb_catalog(corpus), schema_prompt_suffix())
}

/// Diagnostic section prepended to the user prompt on a repair attempt.
pub fn gcd_retry_section(attempt: usize, errors: &[String]) -> String {
    let mut out = format!(
        "## Previous attempt {} was rejected\nThese mangle_updates failed validation:\n",
        attempt
    );
    for e in errors {
        out.push_str(&format!("- {}\n", e));
    }
    out.push_str("Emit only syntactically valid, range-restricted rules ending with '.', or an empty list.\n\n");
    out
}
