//! Tool-call argument normalization.
//!
//! Confused models sometimes answer with the parameter's JSON-schema fragment
//! instead of a value:
//!
//! ```json
//! {"query": {"type": "string", "description": "Paris weather"}}
//! ```
//!
//! Each argument is classified as an [`ArgumentValue`] at the boundary and
//! normalized before the tool runs: a schema echo becomes its description when
//! that description is real content, and is dropped when it is only the
//! generic placeholder text.

use serde_json::{Map, Value};

/// Keys allowed in an object for it to count as a schema echo.
const SCHEMA_KEYWORDS: [&str; 10] = [
    "type",
    "description",
    "title",
    "default",
    "enum",
    "examples",
    "format",
    "items",
    "properties",
    "required",
];

/// Descriptions that carry no user content (compared case-insensitively).
const GENERIC_PLACEHOLDERS: [&str; 8] = [
    "la requête de recherche",
    "the search query",
    "search query",
    "query",
    "value",
    "description",
    "string",
    "placeholder",
];

/// One argument as the model supplied it.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentValue {
    /// A real value.
    Literal(Value),
    /// A schema fragment echoed back instead of a value.
    SchemaEcho {
        schema_type: String,
        description: String,
    },
}

impl ArgumentValue {
    /// Classify a raw argument value.
    pub fn classify(value: Value) -> Self {
        if let Value::Object(ref map) = value {
            let schema_type = map.get("type").and_then(Value::as_str);
            let description = map.get("description").and_then(Value::as_str);
            let only_schema_keys = map.keys().all(|k| SCHEMA_KEYWORDS.contains(&k.as_str()));
            if let (Some(schema_type), Some(description), true) =
                (schema_type, description, only_schema_keys)
            {
                return ArgumentValue::SchemaEcho {
                    schema_type: schema_type.to_string(),
                    description: description.to_string(),
                };
            }
        }
        ArgumentValue::Literal(value)
    }

    /// The value to pass to the tool, or `None` to drop the argument.
    pub fn normalize(self) -> Option<Value> {
        match self {
            ArgumentValue::Literal(value) => Some(value),
            ArgumentValue::SchemaEcho { description, .. } if is_generic_placeholder(&description) => {
                None
            }
            ArgumentValue::SchemaEcho { description, .. } => Some(Value::String(description)),
        }
    }
}

/// Whether a schema description is boilerplate rather than content.
pub fn is_generic_placeholder(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    lower.is_empty() || GENERIC_PLACEHOLDERS.contains(&lower.as_str())
}

/// Normalize every argument of a tool call.
///
/// Arguments that are not a JSON object (a bare string, an array) cannot be
/// mapped to parameters and yield an empty map.
pub fn sanitize_arguments(tool_name: &str, arguments: Value) -> Map<String, Value> {
    let raw = match arguments {
        Value::Object(map) => map,
        Value::Null => return Map::new(),
        other => {
            tracing::warn!(tool = %tool_name, arguments = %other, "non-object tool arguments ignored");
            return Map::new();
        }
    };

    let mut sanitized = Map::with_capacity(raw.len());
    for (key, value) in raw {
        let classified = ArgumentValue::classify(value);
        let echoed = matches!(classified, ArgumentValue::SchemaEcho { .. });
        match classified.normalize() {
            Some(value) => {
                if echoed {
                    tracing::debug!(tool = %tool_name, argument = %key, "schema echo replaced by its description");
                }
                sanitized.insert(key, value);
            }
            None => {
                tracing::debug!(tool = %tool_name, argument = %key, "placeholder schema echo dropped");
            }
        }
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schema_echo_with_real_description_is_rewritten() {
        let args = json!({"query": {"type": "string", "description": "Paris weather"}});
        let out = sanitize_arguments("web_search", args);
        assert_eq!(Value::Object(out), json!({"query": "Paris weather"}));
    }

    #[test]
    fn test_schema_echo_with_placeholder_is_dropped() {
        let args = json!({"query": {"type": "string", "description": "La requête de recherche"}});
        let out = sanitize_arguments("web_search", args);
        assert!(out.is_empty());
    }

    #[test]
    fn test_placeholder_comparison_ignores_case() {
        assert!(is_generic_placeholder("  The Search Query "));
        assert!(is_generic_placeholder(""));
        assert!(!is_generic_placeholder("rust async runtimes"));
    }

    #[test]
    fn test_literals_pass_through() {
        let args = json!({"query": "x", "limit": 5, "filters": {"lang": "en"}});
        let out = sanitize_arguments("web_search", args.clone());
        assert_eq!(Value::Object(out), args);
    }

    #[test]
    fn test_object_with_extra_keys_is_literal() {
        // A real object argument that happens to carry type/description.
        let value = json!({"type": "bug", "description": "crash on start", "id": 7});
        assert_eq!(
            ArgumentValue::classify(value.clone()),
            ArgumentValue::Literal(value)
        );
    }

    #[test]
    fn test_schema_echo_with_title_is_detected() {
        let value = json!({"type": "string", "title": "City", "description": "Lyon"});
        assert_eq!(
            ArgumentValue::classify(value),
            ArgumentValue::SchemaEcho {
                schema_type: "string".into(),
                description: "Lyon".into(),
            }
        );
    }

    #[test]
    fn test_non_object_arguments_yield_empty_map() {
        assert!(sanitize_arguments("t", json!("just text")).is_empty());
        assert!(sanitize_arguments("t", Value::Null).is_empty());
    }
}
