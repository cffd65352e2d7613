//! Piggyback envelope: the dual-payload reply every model turn must carry.
//!
//! Model output is unreliable. It may be wrapped in markdown fences,
//! surrounded by prose, contain several JSON objects, or use mixed-case
//! keys. [`parse_envelope`] tolerates all of these and either returns a
//! complete envelope or an error; it never returns a partial one.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PerceptionError, Result};
use crate::perception::intent::clamp_confidence;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IntentClassification {
    pub category: String,
    pub verb: String,
    pub target: String,
    pub constraint: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MemoryOperation {
    pub op: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelfCorrection {
    pub triggered: bool,
    pub hypothesis: String,
}

/// The machine half of the envelope. Never shown to the user.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ControlPacket {
    pub intent_classification: IntentClassification,
    #[serde(default)]
    pub mangle_updates: Vec<String>,
    #[serde(default)]
    pub memory_operations: Vec<MemoryOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_correction: Option<SelfCorrection>,
    /// Optional model-provided understanding fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub understanding: Option<Value>,
}

/// `control_packet` is declared first so it serializes first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PiggybackEnvelope {
    pub control_packet: ControlPacket,
    pub surface_response: String,
}

// ---------------------------------------------------------------------------
// Value conversion
// ---------------------------------------------------------------------------

/// Recursively lower-case every object key.
pub fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_lowercase(), lowercase_keys(v)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}

fn text_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Confidence as reported by the model, normalized into `[0, 1]`.
///
/// Values in `(1, 100]` are read as percentages.
pub fn normalize_confidence(raw: f64) -> f64 {
    if raw > 1.0 && raw <= 100.0 {
        clamp_confidence(raw / 100.0)
    } else {
        clamp_confidence(raw)
    }
}

fn confidence_of(value: Option<&Value>) -> f64 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().trim_end_matches('%').parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    normalize_confidence(raw)
}

impl IntentClassification {
    fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| PerceptionError::validation("intent_classification", "must be an object"))?;
        Ok(Self {
            category: text_of(obj.get("category")),
            verb: text_of(obj.get("verb")),
            target: text_of(obj.get("target")),
            constraint: text_of(obj.get("constraint")),
            confidence: confidence_of(obj.get("confidence")),
        })
    }
}

impl ControlPacket {
    fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| PerceptionError::validation("control_packet", "must be an object"))?;
        let classification = obj
            .get("intent_classification")
            .ok_or_else(|| PerceptionError::validation("control_packet.intent_classification", "missing"))?;

        let mangle_updates = match obj.get("mangle_updates") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
            _ => Vec::new(),
        };

        let memory_operations = match obj.get("memory_operations") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_object)
                .map(|op| MemoryOperation {
                    op: text_of(op.get("op")),
                    key: text_of(op.get("key")),
                    value: text_of(op.get("value")),
                })
                .filter(|op| !op.op.is_empty())
                .collect(),
            _ => Vec::new(),
        };

        let self_correction = obj.get("self_correction").and_then(Value::as_object).map(|sc| SelfCorrection {
            triggered: sc.get("triggered").and_then(Value::as_bool).unwrap_or(false),
            hypothesis: text_of(sc.get("hypothesis")),
        });

        Ok(Self {
            intent_classification: IntentClassification::from_value(classification)?,
            mangle_updates,
            memory_operations,
            self_correction,
            understanding: obj.get("understanding").filter(|v| v.is_object()).cloned(),
        })
    }
}

impl PiggybackEnvelope {
    /// Validate and convert a decoded JSON value. Keys are matched case-insensitively.
    pub fn from_value(value: Value) -> Result<Self> {
        let value = lowercase_keys(value);
        let obj = value
            .as_object()
            .ok_or_else(|| PerceptionError::validation("envelope", "must be a JSON object"))?;
        let surface_response = match obj.get("surface_response") {
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(PerceptionError::validation("surface_response", "must be a string")),
            None => return Err(PerceptionError::validation("surface_response", "missing")),
        };
        let control = obj
            .get("control_packet")
            .ok_or_else(|| PerceptionError::validation("control_packet", "missing"))?;
        Ok(Self {
            control_packet: ControlPacket::from_value(control)?,
            surface_response,
        })
    }

    pub fn classification(&self) -> &IntentClassification {
        &self.control_packet.intent_classification
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").unwrap());

/// Remove markdown code fences, keeping the content of the first fenced block.
pub fn strip_code_fences(text: &str) -> String {
    if let Some(caps) = CODE_FENCE.captures(text) {
        if let Some(inner) = caps.get(1) {
            return inner.as_str().trim().to_string();
        }
    }
    text.replace("```json", "").replace("```", "").trim().to_string()
}

/// Decode one JSON value starting at the first `{`, ignoring trailing bytes.
fn decode_first_object(text: &str) -> std::result::Result<Value, String> {
    let start = text.find('{').ok_or_else(|| "no JSON object found".to_string())?;
    let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) if value.is_object() => Ok(value),
        Some(Ok(_)) => Err("first value is not an object".to_string()),
        Some(Err(e)) => Err(e.to_string()),
        None => Err("no JSON object found".to_string()),
    }
}

/// Byte ranges of balanced top-level `{...}` spans, string-aware.
fn top_level_objects(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push((start, i + 1));
                }
            }
            _ => {}
        }
    }
    spans
}

/// The last valid top-level JSON object in `text`, or an empty string.
pub fn extract_json(text: &str) -> String {
    top_level_objects(text)
        .into_iter()
        .rev()
        .map(|(s, e)| &text[s..e])
        .find(|candidate| serde_json::from_str::<Value>(candidate).is_ok())
        .map(String::from)
        .unwrap_or_default()
}

/// Parse a Piggyback envelope from raw model output.
///
/// Tries, in order: the object at the first `{`; the same after stripping
/// code fences; the last top-level object. The first candidate that
/// validates wins.
pub fn parse_envelope(text: &str) -> Result<PiggybackEnvelope> {
    let mut last_err: Option<PerceptionError> = None;

    let mut attempt = |decoded: std::result::Result<Value, String>| -> Option<PiggybackEnvelope> {
        match decoded {
            Ok(value) => match PiggybackEnvelope::from_value(value) {
                Ok(env) => Some(env),
                Err(e) => {
                    last_err = Some(e);
                    None
                }
            },
            Err(msg) => {
                if last_err.is_none() {
                    last_err = Some(PerceptionError::Parse(msg));
                }
                None
            }
        }
    };

    if let Some(env) = attempt(decode_first_object(text)) {
        return Ok(env);
    }
    let stripped = strip_code_fences(text);
    if stripped != text {
        if let Some(env) = attempt(decode_first_object(&stripped)) {
            return Ok(env);
        }
    }
    let last = extract_json(text);
    if !last.is_empty() {
        if let Some(env) = attempt(serde_json::from_str::<Value>(&last).map_err(|e| e.to_string())) {
            return Ok(env);
        }
    }

    Err(last_err.unwrap_or_else(|| PerceptionError::Parse("no JSON object found".into())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENVELOPE: &str = r#"{"control_packet":{"intent_classification":{"category":"/query","verb":"/explain","target":"main.rs","constraint":"none","confidence":0.9},"mangle_updates":["fact(/a)."],"memory_operations":[{"op":"store","key":"k","value":"v"}]},"surface_response":"Here you go."}"#;

    #[test]
    fn test_plain_envelope() {
        let env = parse_envelope(ENVELOPE).unwrap();
        assert_eq!(env.surface_response, "Here you go.");
        assert_eq!(env.classification().verb, "/explain");
        assert_eq!(env.control_packet.mangle_updates, vec!["fact(/a)."]);
        assert_eq!(env.control_packet.memory_operations[0].key, "k");
    }

    #[test]
    fn test_fenced_and_prose_wrapped() {
        let fenced = format!("Sure!\n```json\n{}\n```\nDone.", ENVELOPE);
        assert_eq!(parse_envelope(&fenced).unwrap().classification().target, "main.rs");

        let prose = format!("Thinking about it {} trailing words }}", ENVELOPE);
        assert!(parse_envelope(&prose).is_ok());
    }

    #[test]
    fn test_falls_back_to_last_object() {
        let text = format!("{{\"note\": \"scratch {{ pad\"}} then {}", ENVELOPE);
        assert_eq!(parse_envelope(&text).unwrap().surface_response, "Here you go.");
    }

    #[test]
    fn test_mixed_case_keys_and_percent_confidence() {
        let text = r#"{"Control_Packet":{"Intent_Classification":{"Category":"/mutation","VERB":"/fix","Target":"a.go","Constraint":"","Confidence":85}},"Surface_Response":"ok"}"#;
        let env = parse_envelope(text).unwrap();
        assert_eq!(env.classification().verb, "/fix");
        assert!((env.classification().confidence - 0.85).abs() < 1e-9);
        assert!(env.control_packet.mangle_updates.is_empty());
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(normalize_confidence(-2.0), 0.0);
        assert_eq!(normalize_confidence(250.0), 1.0);
        assert_eq!(normalize_confidence(0.4), 0.4);
    }

    #[test]
    fn test_missing_fields_rejected() {
        let err = parse_envelope(r#"{"control_packet":{"intent_classification":{}}}"#).unwrap_err();
        assert!(matches!(err, PerceptionError::Validation { ref field, .. } if field == "surface_response"));
        let err = parse_envelope(r#"{"control_packet":{},"surface_response":"x"}"#).unwrap_err();
        assert!(matches!(err, PerceptionError::Validation { .. }));
        assert!(matches!(parse_envelope("no json here").unwrap_err(), PerceptionError::Parse(_)));
    }

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json(r#"{"a":1}"#), r#"{"a":1}"#);
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), r#"{"a":1}"#);
        assert_eq!(extract_json(r#"prefix {"a":"}"} suffix"#), r#"{"a":"}"}"#);
        assert_eq!(extract_json(r#"{"a":1} and {"b":{"c":2}}"#), r#"{"b":{"c":2}}"#);
        assert_eq!(extract_json("nothing"), "");
        assert_eq!(extract_json("{ broken"), "");
    }

    #[test]
    fn test_serializes_control_packet_first() {
        let env = parse_envelope(ENVELOPE).unwrap();
        let out = serde_json::to_string(&env).unwrap();
        assert!(out.find("control_packet").unwrap() < out.find("surface_response").unwrap());
    }
}
