//! JSON schema builders for structured LLM outputs.
//!
//! Some providers reject structured-output schemas unless every object node
//! carries `additionalProperties: false`. [`enforce_no_additional_properties`]
//! rewrites a schema recursively so call sites never have to think about it,
//! and the small builders below cover the shapes the research pipeline asks
//! for.

use serde_json::{Map, Value, json};

/// Recursively sets `additionalProperties: false` on every object node of a
/// JSON schema, including `properties`, `$defs`/`definitions`, array `items`
/// and `prefixItems`, and `anyOf`/`oneOf`/`allOf` branches.
#[must_use]
pub fn enforce_no_additional_properties(schema: Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(enforce_on_object(map)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(enforce_no_additional_properties)
                .collect(),
        ),
        other => other,
    }
}

fn enforce_on_object(mut map: Map<String, Value>) -> Map<String, Value> {
    let is_object_schema = map.get("type").and_then(Value::as_str) == Some("object")
        || map.contains_key("properties");

    if is_object_schema {
        map.insert("additionalProperties".to_string(), Value::Bool(false));
    }

    for key in [
        "properties",
        "$defs",
        "definitions",
        "patternProperties",
    ] {
        if let Some(Value::Object(children)) = map.remove(key) {
            let rewritten: Map<String, Value> = children
                .into_iter()
                .map(|(name, child)| (name, enforce_no_additional_properties(child)))
                .collect();
            map.insert(key.to_string(), Value::Object(rewritten));
        }
    }

    for key in ["items", "additionalItems", "contains", "not"] {
        if let Some(child) = map.remove(key) {
            map.insert(key.to_string(), enforce_no_additional_properties(child));
        }
    }

    for key in ["prefixItems", "anyOf", "oneOf", "allOf"] {
        if let Some(Value::Array(children)) = map.remove(key) {
            let rewritten: Vec<Value> = children
                .into_iter()
                .map(enforce_no_additional_properties)
                .collect();
            map.insert(key.to_string(), Value::Array(rewritten));
        }
    }

    map
}

/// Schema for query expansion: `{queries: [string]}`.
#[must_use]
pub fn string_array_schema(field: &str, description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            field: {
                "type": "array",
                "items": {"type": "string"},
                "description": description,
            }
        },
        "required": [field],
    })
}

/// Schema for gap detection: `{gaps: [{query, rationale, confidence}]}`.
#[must_use]
pub fn gap_detection_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "gaps": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "rationale": {"type": "string"},
                        "confidence": {
                            "type": "number",
                            "minimum": 0.0,
                            "maximum": 1.0,
                        },
                    },
                    "required": ["query", "rationale", "confidence"],
                }
            }
        },
        "required": ["gaps"],
    })
}

/// Schema for gap unification: `{unified_query}`.
#[must_use]
pub fn gap_unification_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "unified_query": {"type": "string"},
        },
        "required": ["unified_query"],
    })
}

/// Schema for fact extraction: `{facts: [{statement, start_line, end_line,
/// category, confidence, entities}]}`.
#[must_use]
pub fn fact_extraction_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "facts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "statement": {"type": "string"},
                        "file_path": {"type": "string"},
                        "start_line": {"type": "integer"},
                        "end_line": {"type": "integer"},
                        "category": {"type": "string"},
                        "confidence": {
                            "type": "string",
                            "enum": ["definite", "likely", "inferred", "uncertain"],
                        },
                        "entities": {
                            "type": "array",
                            "items": {"type": "string"},
                        },
                    },
                    "required": [
                        "statement",
                        "file_path",
                        "start_line",
                        "end_line",
                        "category",
                        "confidence",
                        "entities",
                    ],
                }
            }
        },
        "required": ["facts"],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enforce_marks_root_object() {
        let schema = json!({"type": "object", "properties": {"a": {"type": "string"}}});
        let enforced = enforce_no_additional_properties(schema);
        assert_eq!(enforced["additionalProperties"], json!(false));
    }

    #[test]
    fn test_enforce_recurses_into_array_items() {
        let schema = json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": {"type": "object", "properties": {"x": {"type": "integer"}}}
                }
            }
        });
        let enforced = enforce_no_additional_properties(schema);
        assert_eq!(
            enforced["properties"]["items"]["items"]["additionalProperties"],
            json!(false)
        );
    }

    #[test]
    fn test_enforce_recurses_into_defs_and_anyof() {
        let schema = json!({
            "type": "object",
            "properties": {"v": {"anyOf": [
                {"type": "object", "properties": {"a": {"type": "string"}}},
                {"type": "string"},
            ]}},
            "$defs": {
                "Inner": {"type": "object", "properties": {"b": {"type": "integer"}}}
            }
        });
        let enforced = enforce_no_additional_properties(schema);
        assert_eq!(
            enforced["properties"]["v"]["anyOf"][0]["additionalProperties"],
            json!(false)
        );
        assert_eq!(
            enforced["$defs"]["Inner"]["additionalProperties"],
            json!(false)
        );
    }

    #[test]
    fn test_enforce_recurses_into_prefix_items() {
        let schema = json!({
            "type": "array",
            "prefixItems": [
                {"type": "object", "properties": {"a": {"type": "string"}}}
            ]
        });
        let enforced = enforce_no_additional_properties(schema);
        assert_eq!(
            enforced["prefixItems"][0]["additionalProperties"],
            json!(false)
        );
    }

    #[test]
    fn test_enforce_leaves_scalars_alone() {
        let schema = json!({"type": "string"});
        let enforced = enforce_no_additional_properties(schema.clone());
        assert_eq!(enforced, schema);
    }

    #[test]
    fn test_gap_detection_schema_shape() {
        let schema = enforce_no_additional_properties(gap_detection_schema());
        assert_eq!(schema["required"], json!(["gaps"]));
        let item = &schema["properties"]["gaps"]["items"];
        assert_eq!(item["additionalProperties"], json!(false));
        assert_eq!(item["properties"]["confidence"]["maximum"], json!(1.0));
    }

    #[test]
    fn test_string_array_schema_field_name() {
        let schema = string_array_schema("queries", "expanded search queries");
        assert!(schema["properties"]["queries"].is_object());
        assert_eq!(schema["required"], json!(["queries"]));
    }
}
