//! Tolerant JSON extraction for model output.
//!
//! Planner and worker prompts demand strict JSON, but models occasionally
//! wrap the object in prose or a fenced code block. Parsing runs as a
//! three-stage pipeline: direct parse, extraction from fenced blocks, then
//! the first balanced `{…}` or `[…]` span. Field shapes are still validated
//! downstream through serde with defaulting; this module only locates the
//! JSON.

use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

/// Errors from relaxed JSON extraction.
#[derive(Debug, Error, Diagnostic)]
pub enum RelaxedJsonError {
    /// No parseable JSON value was found in the text.
    #[error("no JSON value found in model output ({length} chars scanned)")]
    #[diagnostic(
        code(taskweft::json::not_found),
        help("The model likely ignored the strict-JSON instruction; retry or fall back.")
    )]
    NotFound { length: usize },
}

/// Extracts the first JSON value from free-form model output.
///
/// # Examples
///
/// ```
/// use taskweft::utils::json_relaxed::extract_json;
///
/// let direct = extract_json(r#"{"ok": true}"#).unwrap();
/// assert_eq!(direct["ok"], true);
///
/// let fenced = extract_json("Here you go:\n```json\n{\"n\": 2}\n```").unwrap();
/// assert_eq!(fenced["n"], 2);
///
/// let embedded = extract_json("Sure! {\"a\": [1, 2]} hope that helps").unwrap();
/// assert_eq!(embedded["a"][1], 2);
/// ```
pub fn extract_json(text: &str) -> Result<Value, RelaxedJsonError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    if let Some(value) = from_fenced_block(trimmed) {
        return Ok(value);
    }
    if let Some(value) = from_balanced_span(trimmed) {
        return Ok(value);
    }
    Err(RelaxedJsonError::NotFound { length: text.len() })
}

/// Scans ``` fences and tries to parse each block body.
fn from_fenced_block(text: &str) -> Option<Value> {
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        // Skip an optional language tag on the fence line.
        let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_open[body_start..];
        let close = body.find("```")?;
        let candidate = body[..close].trim();
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            return Some(value);
        }
        rest = &body[close + 3..];
    }
    None
}

/// Finds the first balanced `{…}` or `[…]` span and parses it.
///
/// Tracks string/escape state so braces inside string literals do not
/// unbalance the scan.
fn from_balanced_span(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{' || b == b'[')?;
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    let span = &text[start..=start + offset];
                    return serde_json::from_str::<Value>(span).ok();
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn direct_parse_wins() {
        let value = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn fenced_block_with_language_tag() {
        let text = "Here is the plan:\n```json\n{\"tasks\": []}\n```\nDone.";
        let value = extract_json(text).unwrap();
        assert_eq!(value, json!({"tasks": []}));
    }

    #[test]
    fn fenced_block_without_language_tag() {
        let text = "```\n[1, 2, 3]\n```";
        assert_eq!(extract_json(text).unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn balanced_span_inside_prose() {
        let text = "Of course! The answer is {\"ok\": true, \"note\": \"a } in a string\"} as requested.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(value["note"], "a } in a string");
    }

    #[test]
    fn array_span() {
        let value = extract_json("the list: [\"x\", \"y\"] trailing").unwrap();
        assert_eq!(value, json!(["x", "y"]));
    }

    #[test]
    fn nested_objects_balance() {
        let value = extract_json("{\"a\": {\"b\": {\"c\": 1}}} junk }").unwrap();
        assert_eq!(value["a"]["b"]["c"], 1);
    }

    #[test]
    fn garbage_is_an_error() {
        let err = extract_json("no json here at all").unwrap_err();
        assert!(matches!(err, RelaxedJsonError::NotFound { .. }));
    }

    #[test]
    fn skips_unparseable_fence_then_finds_later_one() {
        let text = "```\nnot json\n```\nbut then ```json\n{\"k\": 9}\n```";
        assert_eq!(extract_json(text).unwrap(), json!({"k": 9}));
    }
}
