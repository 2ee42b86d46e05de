//! Structured-output extraction from backend replies.
//!
//! Even in strict JSON mode some models wrap the payload in a ```` ```json ````
//! fence or add a sentence before it, and OpenAI-style JSON mode only allows
//! objects, so an id list may come back as `{"order": [...]}`. Parsing tries,
//! in order: the whole reply, the first fenced block, then the outermost
//! `{…}` / `[…]` span.

use crate::cache::LayoutPayload;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static RE_FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\n?(.*?)```").unwrap());

/// Keys under which an object-wrapped id list is accepted.
const ORDER_KEYS: &[&str] = &["order", "ids", "reading_order", "component_ids", "result"];

/// Parse the first JSON value found in `raw`.
pub fn parse_json_value(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }
    if let Some(caps) = RE_FENCED.captures(trimmed) {
        if let Ok(v) = serde_json::from_str(caps[1].trim()) {
            return Some(v);
        }
    }
    // Either bracket kind may hold the payload; try the earlier one first.
    let mut spans: Vec<(usize, &str)> = [('{', '}'), ('[', ']')]
        .into_iter()
        .filter_map(|(open, close)| outermost_span(trimmed, open, close))
        .collect();
    spans.sort_by_key(|(start, _)| *start);
    spans
        .into_iter()
        .find_map(|(_, span)| serde_json::from_str(span).ok())
}

/// Start offset and span from the first `open` to the last `close`.
fn outermost_span(s: &str, open: char, close: char) -> Option<(usize, &str)> {
    let start = s.find(open)?;
    let end = s.rfind(close)?;
    (end > start).then(|| (start, &s[start..=end]))
}

/// Parse a layout segmentation reply.
///
/// A bare array is accepted as the component list with unknown language.
pub fn parse_layout(raw: &str) -> Result<LayoutPayload, String> {
    let value = parse_json_value(raw).ok_or_else(|| "reply contains no JSON".to_string())?;
    let value = match value {
        Value::Array(components) => serde_json::json!({ "components": components }),
        other => other,
    };
    serde_json::from_value(value).map_err(|e| format!("layout payload does not match schema: {e}"))
}

/// Parse a reassembly reply into a sequence of component ids.
pub fn parse_id_sequence(raw: &str) -> Result<Vec<String>, String> {
    let value = parse_json_value(raw).ok_or_else(|| "reply contains no JSON".to_string())?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            let key = ORDER_KEYS
                .iter()
                .find(|k| map.get(**k).is_some_and(Value::is_array))
                .map(|k| k.to_string())
                .or_else(|| {
                    let mut arrays = map.iter().filter(|(_, v)| v.is_array());
                    match (arrays.next(), arrays.next()) {
                        (Some((k, _)), None) => Some(k.clone()),
                        _ => None,
                    }
                })
                .ok_or_else(|| "object reply holds no id list".to_string())?;
            match map.remove(&key) {
                Some(Value::Array(items)) => items,
                _ => return Err("object reply holds no id list".to_string()),
            }
        }
        _ => return Err("reply is not an id list".to_string()),
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::String(s) => Ok(s.trim().to_string()),
            other => Err(format!("id list contains a non-string entry: {other}")),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_fenced_and_prefixed_json() {
        assert!(parse_json_value(r#"{"a": 1}"#).is_some());
        assert!(parse_json_value("```json\n{\"a\": 1}\n```").is_some());
        assert!(parse_json_value("Here is the order:\n[\"comp_01\"]\nDone.").is_some());
        assert!(parse_json_value("no json here").is_none());
    }

    #[test]
    fn layout_from_fenced_reply() {
        let raw = "```json\n{\"language\": \"japanese\", \"components\": [{\"type\": \"header\", \"box\": [0, 0, 10, 5]}]}\n```";
        let layout = parse_layout(raw).unwrap();
        assert_eq!(layout.language, "japanese");
        assert_eq!(layout.components.len(), 1);
        assert_eq!(layout.components[0].kind, "header");
    }

    #[test]
    fn layout_rejects_wrong_shape() {
        assert!(parse_layout(r#"{"language": "english"}"#).is_err());
        assert!(parse_layout("I could not analyse this page.").is_err());
    }

    #[test]
    fn id_sequence_from_array_or_wrapped_object() {
        assert_eq!(
            parse_id_sequence(r#"["comp_02", "comp_01"]"#).unwrap(),
            ["comp_02", "comp_01"]
        );
        assert_eq!(
            parse_id_sequence(r#"{"order": ["comp_01", "comp_03"]}"#).unwrap(),
            ["comp_01", "comp_03"]
        );
        assert_eq!(
            parse_id_sequence(r#"{"sequence": ["comp_03"]}"#).unwrap(),
            ["comp_03"]
        );
    }

    #[test]
    fn stray_braces_before_array_are_passed_over() {
        assert_eq!(
            parse_id_sequence(r#"Order {final}: ["comp_01"]"#).unwrap(),
            ["comp_01"]
        );
        assert_eq!(
            parse_id_sequence("[draft] then {\"order\": [\"comp_02\"]}").unwrap(),
            ["comp_02"]
        );
    }

    #[test]
    fn id_sequence_rejects_non_lists() {
        assert!(parse_id_sequence(r#"{"a": [1], "b": [2]}"#).is_err());
        assert!(parse_id_sequence(r#"[1, 2]"#).is_err());
        assert!(parse_id_sequence(r#""comp_01""#).is_err());
        assert!(parse_id_sequence("the order is comp_01 then comp_02").is_err());
    }
}
