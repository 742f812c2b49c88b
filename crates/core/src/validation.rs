//! Structural checks and repairs applied to raw backend output.

use crate::types::{ErrorKind, NodeError};
use serde_json::Value;

/// Parse a raw backend body as JSON
pub fn parse_structured(body: &str) -> Result<Value, NodeError> {
    serde_json::from_str(body.trim())
        .map_err(|e| NodeError::new(ErrorKind::StructuralParse, format!("invalid JSON: {}", e)))
}

/// Attempt to turn almost-JSON into JSON.
///
/// Strips markdown code fences, cuts the outermost object or array out of
/// surrounding prose and drops trailing commas. Returns `None` if nothing
/// changed or the result still does not parse.
pub fn repair(body: &str) -> Option<String> {
    let unfenced = strip_fences(body.trim());
    let sliced = outermost_structure(unfenced)?;
    let repaired = remove_trailing_commas(sliced);

    if repaired == body.trim() {
        return None;
    }
    serde_json::from_str::<Value>(&repaired).ok()?;
    Some(repaired)
}

fn strip_fences(body: &str) -> &str {
    let Some(rest) = body.strip_prefix("```") else {
        return body;
    };
    // drop the language tag line
    let rest = rest.split_once('\n').map_or("", |(_, after)| after);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn outermost_structure(body: &str) -> Option<&str> {
    let start = body.find(['{', '['])?;
    let close = if body[start..].starts_with('{') { '}' } else { ']' };
    let end = body.rfind(close)?;
    (end > start).then(|| &body[start..=end])
}

fn remove_trailing_commas(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = body.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
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
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    out
}

/// Coerce a payload that failed validation into a shape that might pass.
///
/// Handles payloads delivered as a JSON-encoded string and payloads wrapped
/// in a single-key envelope such as `{"result": {...}}`.
pub fn coerce(payload: &Value) -> Option<Value> {
    match payload {
        Value::String(text) => parse_structured(text).ok().filter(|v| v != payload),
        Value::Object(map) if map.len() == 1 => {
            map.values().next().filter(|inner| inner.is_object()).cloned()
        }
        _ => None,
    }
}

/// Verify required fields are present and non-null.
///
/// Fields starting with `/` are JSON pointers, anything else is a top-level key.
pub fn check_required(payload: &Value, fields: &[String]) -> Result<(), NodeError> {
    let missing: Vec<&str> = fields
        .iter()
        .filter(|field| lookup(payload, field.as_str()).map_or(true, Value::is_null))
        .map(String::as_str)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(NodeError::new(
            ErrorKind::Validation,
            format!("missing required fields: {}", missing.join(", ")),
        ))
    }
}

pub fn lookup<'a>(payload: &'a Value, field: &str) -> Option<&'a Value> {
    if field.starts_with('/') {
        payload.pointer(field)
    } else {
        payload.get(field)
    }
}

/// Null, empty strings and empty collections carry no usable artifact
pub fn is_trivial(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_structured_rejects_prose() {
        let err = parse_structured("The parties are A and B.").unwrap_err();
        assert_eq!(err.kind, ErrorKind::StructuralParse);
        assert_eq!(parse_structured(" {\"a\": 1} ").unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_repair_fenced_output() {
        let body = "```json\n{\"parties\": [\"A\", \"B\",],}\n```";
        let repaired = repair(body).unwrap();
        assert_eq!(
            parse_structured(&repaired).unwrap(),
            json!({"parties": ["A", "B"]})
        );
    }

    #[test]
    fn test_repair_extracts_from_prose() {
        let body = "Here is the result: {\"term\": \"12 months\"} Hope this helps.";
        assert_eq!(repair(body).unwrap(), "{\"term\": \"12 months\"}");
    }

    #[test]
    fn test_repair_keeps_commas_inside_strings() {
        let body = "Result: {\"note\": \"a, }\", \"n\": 1,}";
        let repaired = repair(body).unwrap();
        assert_eq!(
            parse_structured(&repaired).unwrap(),
            json!({"note": "a, }", "n": 1})
        );
    }

    #[test]
    fn test_repair_gives_up_on_garbage() {
        assert!(repair("no structure at all").is_none());
        assert!(repair("{ not: json }").is_none());
    }

    #[test]
    fn test_coerce() {
        assert_eq!(
            coerce(&json!("{\"a\": 1}")).unwrap(),
            json!({"a": 1})
        );
        assert_eq!(
            coerce(&json!({"result": {"a": 1}})).unwrap(),
            json!({"a": 1})
        );
        assert!(coerce(&json!({"a": 1, "b": 2})).is_none());
        assert!(coerce(&json!(42)).is_none());
    }

    #[test]
    fn test_check_required_with_pointers() {
        let payload = json!({"parties": ["A"], "term": {"months": 12}, "notes": null});
        let fields = vec!["parties".to_string(), "/term/months".to_string()];
        assert!(check_required(&payload, &fields).is_ok());

        let err = check_required(&payload, &["notes".to_string(), "/term/days".to_string()])
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.contains("notes"));
        assert!(err.message.contains("/term/days"));
    }

    #[test]
    fn test_is_trivial() {
        assert!(is_trivial(&json!(null)));
        assert!(is_trivial(&json!("  ")));
        assert!(is_trivial(&json!([])));
        assert!(is_trivial(&json!({})));
        assert!(!is_trivial(&json!(0)));
        assert!(!is_trivial(&json!({"a": null})));
    }
}
