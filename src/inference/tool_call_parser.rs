//! Tool call parsing: normalizes model output to `ToolCall` structs.
//!
//! Two channels carry tool invocations:
//!
//! 1. **Structured**: the endpoint returns `tool_calls` with a function name
//!    and JSON-encoded arguments. Arguments that fail to parse go through a
//!    small set of repairs before being rejected.
//!
//! 2. **Textual**: the model ignores the structured channel and prints the
//!    call as JSON in its content:
//!    ```text
//!    {"name": "web_search", "parameters": {"query": "rust async"}}
//!    ```
//!    Accepted only when `name` matches a tool the caller knows about.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::errors::InferenceError;
use super::types::ToolCall;

/// Keys a textual call may use for its arguments, first present wins.
const ARGUMENT_KEYS: [&str; 3] = ["arguments", "parameters", "input"];

fn new_call_id() -> String {
    format!("call_{}", Uuid::new_v4())
}

// ─── Structured Calls ────────────────────────────────────────────────────────

/// Parse a structured tool call from its name and JSON-encoded arguments.
///
/// Empty argument text is an empty object. Malformed JSON is repaired when
/// possible (see [`repair_malformed_tool_call_json`]).
pub fn parse_native_json_tool_call(
    id: Option<&str>,
    name: &str,
    arguments_json: &str,
) -> Result<ToolCall, InferenceError> {
    if name.trim().is_empty() {
        return Err(InferenceError::ToolCallParseError {
            raw_response: arguments_json.to_string(),
            reason: "empty tool name".into(),
        });
    }

    let arguments = if arguments_json.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        repair_malformed_tool_call_json(arguments_json).ok_or_else(|| {
            InferenceError::ToolCallParseError {
                raw_response: arguments_json.to_string(),
                reason: "invalid JSON arguments (repair failed)".into(),
            }
        })?
    };

    Ok(ToolCall {
        id: id.map(String::from).unwrap_or_else(new_call_id),
        name: name.trim().to_string(),
        arguments,
    })
}

// ─── Textual Calls ───────────────────────────────────────────────────────────

fn embedded_call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)\{.*"name".*\}"#).expect("embedded tool call pattern is valid")
    })
}

/// Detect a tool call printed as plain JSON text.
///
/// Algorithm:
/// 1. Parse the whole body (minus a surrounding markdown fence) as JSON.
/// 2. Otherwise extract the first `{...}` containing `"name"`.
/// 3. A list `[{...}, ...]` contributes its first element.
/// 4. Arguments come from `arguments`, `parameters` or `input`.
///
/// Returns `None` ("no call detected") when nothing parses or the name is
/// not in `known_tools`.
pub fn parse_textual_tool_call<S: AsRef<str>>(text: &str, known_tools: &[S]) -> Option<ToolCall> {
    let body = strip_code_fence(text.trim());
    if body.is_empty() {
        return None;
    }

    let object = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(first_object)
        .or_else(|| extract_embedded_object(body))?;

    let name = object.get("name").and_then(Value::as_str)?.trim();
    if !known_tools.iter().any(|known| known.as_ref() == name) {
        tracing::debug!(tool = %name, "textual tool call names an unknown tool; ignoring");
        return None;
    }

    Some(ToolCall {
        id: new_call_id(),
        name: name.to_string(),
        arguments: Value::Object(textual_arguments(&object)),
    })
}

/// Remove a surrounding ```` ``` ```` / ```` ```json ```` fence, if any.
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    // Drop the info string (e.g. "json") on the opening line.
    match rest.find('\n') {
        Some(newline) if !rest[..newline].contains('{') => rest[newline + 1..].trim(),
        _ => rest.trim(),
    }
}

/// An object, or the first element of a list when that element is an object.
fn first_object(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        Value::Array(items) => match items.into_iter().next() {
            Some(Value::Object(map)) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

/// Find the first JSON object embedded in prose that carries a `name` key.
///
/// The greedy pattern handles the common "text before, one object after"
/// case; when it spans several objects the balanced scan takes over.
fn extract_embedded_object(text: &str) -> Option<Map<String, Value>> {
    if let Some(m) = embedded_call_regex().find(text) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(m.as_str()) {
            if map.contains_key("name") {
                return Some(map);
            }
        }
    }

    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = find_matching_brace(text, start) {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text[start..=end]) {
                if map.contains_key("name") {
                    return Some(map);
                }
            }
        }
        search_from = start + 1;
    }
    None
}

/// Index of the `}` closing the `{` at `start`, ignoring braces in strings.
fn find_matching_brace(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Read arguments from the first present argument key.
///
/// A JSON-encoded string (OpenAI style) is decoded; anything that is not an
/// object becomes an empty map.
fn textual_arguments(object: &Map<String, Value>) -> Map<String, Value> {
    let Some(raw) = ARGUMENT_KEYS.iter().find_map(|key| object.get(*key)) else {
        return Map::new();
    };
    match raw {
        Value::Object(map) => map.clone(),
        Value::String(encoded) => match repair_malformed_tool_call_json(encoded) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        },
        _ => Map::new(),
    }
}

// ─── Malformed JSON Repair ──────────────────────────────────────────────────

/// Attempt to repair malformed JSON arguments from a model tool call.
///
/// Repairs are cumulative and tried in order:
/// 1. Doubled opening quote after a colon (`"k":""/path"`)
/// 2. Trailing commas before `}` / `]`
/// 3. Missing closing braces
/// 4. Raw control characters
///
/// Returns `None` if the input is irreparable.
pub fn repair_malformed_tool_call_json(raw: &str) -> Option<Value> {
    let parse = |s: &str| serde_json::from_str::<Value>(s).ok();

    if let Some(v) = parse(raw) {
        return Some(v);
    }

    let repairs: [fn(&str) -> String; 4] = [
        repair_double_quotes,
        repair_trailing_commas,
        repair_unbalanced_braces,
        repair_control_characters,
    ];

    let mut repaired = raw.to_string();
    for repair in repairs {
        repaired = repair(&repaired);
        if let Some(v) = parse(&repaired) {
            return Some(v);
        }
    }
    None
}

/// Collapse `:""x` to `:"x` unless it is a legitimate empty string.
fn repair_double_quotes(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < chars.len() {
        let doubled = chars[i] == ':'
            && chars.get(i + 1) == Some(&'"')
            && chars.get(i + 2) == Some(&'"')
            && !matches!(chars.get(i + 3), None | Some(',') | Some('}'));
        if doubled {
            out.push_str(":\"");
            i += 3;
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Remove commas that directly precede (modulo whitespace) `}` or `]`.
fn repair_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());

    for (i, &ch) in chars.iter().enumerate() {
        if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}

/// Append `}` for every unclosed `{` outside of strings.
fn repair_unbalanced_braces(input: &str) -> String {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for ch in input.chars() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
    }

    let mut out = input.to_string();
    for _ in 0..depth.max(0) {
        out.push('}');
    }
    out
}

/// Strip control characters other than `\n`, `\r`, `\t`.
fn repair_control_characters(input: &str) -> String {
    input
        .chars()
        .filter(|&c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
