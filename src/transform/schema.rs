//! JSON Schema cleanup for Gemini function declarations.
//!
//! Gemini accepts an OpenAPI subset and rejects requests carrying keywords
//! outside it, so tool schemas are pruned before they are sent.

use serde_json::Value;

const UNSUPPORTED_KEYS: &[&str] = &[
    "additionalProperties",
    "$schema",
    "$id",
    "definitions",
    "$defs",
    "default",
    "examples",
    "title",
    "const",
];

/// String formats Gemini understands; any other `format` is dropped.
const SUPPORTED_STRING_FORMATS: &[&str] = &["enum", "date-time"];

/// Return a copy of `schema` with unsupported keywords removed at every level.
pub fn clean_schema(schema: &Value) -> Value {
    let mut cleaned = schema.clone();
    clean_in_place(&mut cleaned);
    cleaned
}

fn clean_in_place(value: &mut Value) {
    let Value::Object(map) = value else {
        return;
    };

    for key in UNSUPPORTED_KEYS {
        map.remove(*key);
    }

    let is_string = map.get("type").and_then(Value::as_str) == Some("string");
    let keep_format = map
        .get("format")
        .and_then(Value::as_str)
        .is_some_and(|f| is_string && SUPPORTED_STRING_FORMATS.contains(&f));
    if !keep_format {
        map.remove("format");
    }

    if let Some(Value::Object(properties)) = map.get_mut("properties") {
        for property in properties.values_mut() {
            clean_in_place(property);
        }
    }
    if let Some(items) = map.get_mut("items") {
        match items {
            Value::Array(list) => list.iter_mut().for_each(clean_in_place),
            other => clean_in_place(other),
        }
    }
    for key in ["anyOf", "oneOf", "allOf"] {
        if let Some(Value::Array(variants)) = map.get_mut(key) {
            variants.iter_mut().for_each(clean_in_place);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_removes_additional_properties_recursively() {
        let schema = json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "filter": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "tags": {
                            "type": "array",
                            "items": {"type": "object", "additionalProperties": true,
                                      "properties": {"name": {"type": "string"}}}
                        }
                    }
                },
                "choice": {"anyOf": [
                    {"type": "object", "additionalProperties": false},
                    {"type": "string"}
                ]}
            }
        });

        let cleaned = clean_schema(&schema);
        assert!(!cleaned.to_string().contains("additionalProperties"));
        assert_eq!(
            cleaned["properties"]["filter"]["properties"]["tags"]["items"]["properties"]["name"],
            json!({"type": "string"})
        );
    }

    #[test]
    fn test_strips_metadata_keywords() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "$id": "urn:tool",
            "title": "Args",
            "type": "object",
            "$defs": {"x": {"type": "string"}},
            "definitions": {"y": {"type": "string"}},
            "properties": {
                "mode": {"type": "string", "const": "fast", "default": "fast", "examples": ["fast"]}
            },
            "required": ["mode"]
        });
        let cleaned = clean_schema(&schema);
        assert_eq!(
            cleaned,
            json!({
                "type": "object",
                "properties": {"mode": {"type": "string"}},
                "required": ["mode"]
            })
        );
    }

    #[test]
    fn test_keeps_only_supported_string_formats() {
        let schema = json!({
            "type": "object",
            "properties": {
                "when": {"type": "string", "format": "date-time"},
                "site": {"type": "string", "format": "uri"},
                "count": {"type": "integer", "format": "int32"}
            }
        });
        let cleaned = clean_schema(&schema);
        assert_eq!(cleaned["properties"]["when"]["format"], "date-time");
        assert!(cleaned["properties"]["site"].get("format").is_none());
        assert!(cleaned["properties"]["count"].get("format").is_none());
    }

    #[test]
    fn test_non_objects_pass_through() {
        assert_eq!(clean_schema(&json!(true)), json!(true));
        assert_eq!(clean_schema(&Value::Null), Value::Null);
    }
}
