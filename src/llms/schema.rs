//! Structured-output descriptors for the Piggyback envelope.
//!
//! The envelope schema is defined once in [`envelope_schema`]; every
//! provider dialect wraps the same object. `control_packet` is declared
//! before `surface_response` (key order is preserved by serde_json's
//! `preserve_order` feature) so constrained decoders emit it first.

use serde_json::{json, Map, Value};

/// Schema name sent with strict JSON-schema requests.
pub const SCHEMA_NAME: &str = "piggyback_envelope";

/// The three structured-output tiers providers fall into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaTier {
    /// OpenAI-compatible `response_format` with a strict JSON schema.
    StrictJsonSchema,
    /// `{"type": "json_object"}`; the shape is enforced through the prompt.
    JsonObject,
    /// Raw schema supplied as a sibling field (Gemini `responseJsonSchema`).
    RawSchema,
}

/// The canonical Piggyback envelope schema.
pub fn envelope_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "control_packet": {
                "type": "object",
                "properties": {
                    "intent_classification": {
                        "type": "object",
                        "properties": {
                            "category": {
                                "type": "string",
                                "enum": ["/query", "/mutation", "/instruction"]
                            },
                            "verb": { "type": "string" },
                            "target": { "type": "string" },
                            "constraint": { "type": "string" },
                            "confidence": { "type": "number" }
                        },
                        "required": ["category", "verb", "target", "constraint", "confidence"]
                    },
                    "mangle_updates": {
                        "type": "array",
                        "items": { "type": "string" }
                    },
                    "memory_operations": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "op": { "type": "string" },
                                "key": { "type": "string" },
                                "value": { "type": "string" }
                            },
                            "required": ["op", "key", "value"]
                        }
                    },
                    "self_correction": {
                        "type": "object",
                        "properties": {
                            "triggered": { "type": "boolean" },
                            "hypothesis": { "type": "string" }
                        },
                        "required": ["triggered", "hypothesis"]
                    }
                },
                "required": ["intent_classification", "mangle_updates", "memory_operations"]
            },
            "surface_response": { "type": "string" }
        },
        "required": ["control_packet", "surface_response"]
    })
}

/// Strict-mode variant: every object closed and every property required,
/// as OpenAI strict decoding demands.
pub fn strict_envelope_schema() -> Value {
    let mut schema = envelope_schema();
    close_objects(&mut schema);
    schema
}

fn close_objects(node: &mut Value) {
    let Some(obj) = node.as_object_mut() else {
        return;
    };
    if obj.get("type").and_then(Value::as_str) == Some("object") {
        if let Some(props) = obj.get("properties").and_then(Value::as_object) {
            let keys: Vec<Value> = props.keys().cloned().map(Value::String).collect();
            obj.insert("required".into(), Value::Array(keys));
        }
        obj.insert("additionalProperties".into(), Value::Bool(false));
    }
    if let Some(props) = obj.get_mut("properties").and_then(Value::as_object_mut) {
        for child in props.values_mut() {
            close_objects(child);
        }
    }
    if let Some(items) = obj.get_mut("items") {
        close_objects(items);
    }
}

/// The provider descriptor for `tier`.
///
/// For [`SchemaTier::RawSchema`] this is the bare schema; the Gemini client
/// places it under `generationConfig.responseJsonSchema`.
pub fn descriptor(tier: SchemaTier) -> Value {
    match tier {
        SchemaTier::StrictJsonSchema => json!({
            "type": "json_schema",
            "json_schema": {
                "name": SCHEMA_NAME,
                "strict": true,
                "schema": strict_envelope_schema()
            }
        }),
        SchemaTier::JsonObject => json!({ "type": "json_object" }),
        SchemaTier::RawSchema => envelope_schema(),
    }
}

/// Instruction appended to the system prompt for providers without native
/// schema enforcement.
pub fn schema_prompt_suffix() -> String {
    let schema = serde_json::to_string_pretty(&envelope_schema()).unwrap_or_default();
    format!(
        "\n\nRespond with a single JSON object matching this schema. \
         Emit \"control_packet\" before \"surface_response\". \
         Do not wrap the object in markdown.\n{}",
        schema
    )
}

/// Top-level property names of a schema, in declaration order.
pub fn property_names(schema: &Value) -> Vec<String> {
    schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|m: &Map<String, Value>| m.keys().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_of(tier: SchemaTier) -> Option<Value> {
        let d = descriptor(tier);
        match tier {
            SchemaTier::StrictJsonSchema => d.pointer("/json_schema/schema").cloned(),
            SchemaTier::JsonObject => None,
            SchemaTier::RawSchema => Some(d),
        }
    }

    #[test]
    fn test_control_packet_declared_first() {
        assert_eq!(
            property_names(&envelope_schema()),
            vec!["control_packet", "surface_response"]
        );
        assert_eq!(
            property_names(&strict_envelope_schema()),
            vec!["control_packet", "surface_response"]
        );
    }

    #[test]
    fn test_every_schema_variant_covers_envelope_fields() {
        for tier in [SchemaTier::StrictJsonSchema, SchemaTier::RawSchema] {
            let schema = schema_of(tier).unwrap();
            let cp = schema.pointer("/properties/control_packet/properties").unwrap();
            for field in ["intent_classification", "mangle_updates", "memory_operations", "self_correction"] {
                assert!(cp.get(field).is_some(), "{tier:?} missing {field}");
            }
            let ic = cp.pointer("/intent_classification/properties").unwrap();
            for field in ["category", "verb", "target", "constraint", "confidence"] {
                assert!(ic.get(field).is_some(), "{tier:?} missing {field}");
            }
            assert!(schema.pointer("/properties/surface_response").is_some());
        }
    }

    #[test]
    fn test_strict_schema_closes_all_objects() {
        let schema = strict_envelope_schema();
        assert_eq!(schema["additionalProperties"], false);
        let sc = schema.pointer("/properties/control_packet/properties/self_correction").unwrap();
        assert_eq!(sc["additionalProperties"], false);
        let item = schema
            .pointer("/properties/control_packet/properties/memory_operations/items")
            .unwrap();
        assert_eq!(item["additionalProperties"], false);
        let required = schema.pointer("/properties/control_packet/required").unwrap();
        assert_eq!(required.as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_json_object_tier() {
        assert_eq!(descriptor(SchemaTier::JsonObject), json!({"type": "json_object"}));
        assert_eq!(descriptor(SchemaTier::StrictJsonSchema)["json_schema"]["name"], SCHEMA_NAME);
    }

    #[test]
    fn test_prompt_suffix_mentions_order() {
        let suffix = schema_prompt_suffix();
        assert!(suffix.contains("control_packet"));
        assert!(suffix.contains("intent_classification"));
    }
}
