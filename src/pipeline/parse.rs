//! Best-effort recovery of structured data from free-text model output.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no JSON object found in response")]
    NoJson,

    #[error("malformed JSON: {0}")]
    Malformed(String),

    #[error("schema violation: {0}")]
    Schema(String),
}

/// Items that conformed to the record schema, plus a count of those that did not.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedItems<T> {
    pub items: Vec<T>,
    pub rejected: usize,
}

/// Records that can be rejected after deserializing (empty names, empty code).
pub trait WellFormed {
    fn is_well_formed(&self) -> bool;
}

/// Candidate openings tried before giving up on a response.
const MAX_CANDIDATES: usize = 32;

/// Parse the JSON value at the start of `text`, ignoring whatever follows it.
fn leading_value(text: &str) -> Result<Value, serde_json::Error> {
    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    match stream.next() {
        Some(result) => result,
        None => serde_json::from_str(text),
    }
}

/// Objects, and arrays of objects, are the only shapes a response carries.
fn is_response_shape(value: &Value) -> bool {
    match value {
        Value::Object(_) => true,
        Value::Array(items) => !items.is_empty() && items.iter().all(Value::is_object),
        _ => false,
    }
}

/// Byte length of the bracketed span opening at the start of `text`.
///
/// String contents are skipped; an unclosed span runs to the end.
fn bracket_span(text: &str) -> usize {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i + 1;
                }
            }
            _ => {}
        }
    }
    text.len()
}

/// Drop commas that directly precede `}` or `]`, ignoring string contents.
pub fn remove_trailing_commas(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut pending_comma: Option<String> = None;

    for ch in json.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        if let Some(buffer) = pending_comma.as_mut() {
            if ch.is_whitespace() {
                buffer.push(ch);
                continue;
            }
            let buffer = pending_comma.take().unwrap_or_default();
            if ch == '}' || ch == ']' {
                out.push_str(&buffer[1..]);
            } else {
                out.push_str(&buffer);
            }
        }

        match ch {
            ',' => pending_comma = Some(String::from(",")),
            '"' => {
                in_string = true;
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    if let Some(buffer) = pending_comma {
        out.push_str(&buffer);
    }
    out
}

/// Locate, repair and parse the JSON value in a model response.
///
/// The whole response is tried first. Otherwise each `{` or `[` is tried in
/// order as the start of a value that may be followed by prose or a closing
/// fence; a candidate that fails is skipped together with its bracketed span,
/// so nested openings of a broken value are never mistaken for the answer.
pub fn parse_value(raw: &str) -> Result<Value, ParseError> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        .or_else(|_| serde_json::from_str(&remove_trailing_commas(trimmed)))
    {
        return Ok(value);
    }

    let mut first_error: Option<String> = None;
    let mut offset = 0;
    for _ in 0..MAX_CANDIDATES {
        let Some(found) = trimmed[offset..].find(['{', '[']) else {
            break;
        };
        let candidate = &trimmed[offset + found..];
        let parsed = leading_value(candidate)
            .or_else(|first| leading_value(&remove_trailing_commas(candidate)).map_err(|_| first));
        match parsed {
            Ok(value) if is_response_shape(&value) => return Ok(value),
            Ok(_) => debug!("Skipping non-record JSON at offset {}", offset + found),
            Err(e) => {
                debug!("Skipping unparseable JSON at offset {}: {}", offset + found, e);
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
        offset += found + bracket_span(candidate);
    }

    Err(first_error.map_or(ParseError::NoJson, ParseError::Malformed))
}

/// Parse a single-object response (Stage 1).
pub fn parse_object<T: DeserializeOwned>(raw: &str) -> Result<T, ParseError> {
    let value = parse_value(raw)?;
    if !value.is_object() {
        return Err(ParseError::Schema("expected a JSON object".to_string()));
    }
    serde_json::from_value(value).map_err(|e| ParseError::Schema(e.to_string()))
}

/// Parse an envelope `{ "<key>": [ ... ] }` item by item.
///
/// The first of `keys` present in the object wins; a bare top-level array is
/// accepted as well. Items that fail their schema are counted, not fatal.
pub fn parse_items<T>(raw: &str, keys: &[&str]) -> Result<ParsedItems<T>, ParseError>
where
    T: DeserializeOwned + WellFormed,
{
    let value = parse_value(raw)?;
    let array = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            let key = keys
                .iter()
                .find(|k| map.contains_key(**k))
                .ok_or_else(|| ParseError::Schema(format!("missing key, expected one of {:?}", keys)))?;
            match map.remove(*key) {
                Some(Value::Array(items)) => items,
                Some(Value::Null) => Vec::new(),
                Some(_) => return Err(ParseError::Schema(format!("'{}' is not an array", key))),
                None => Vec::new(),
            }
        }
        _ => return Err(ParseError::Schema("expected an object or array".to_string())),
    };

    let mut parsed = ParsedItems {
        items: Vec::with_capacity(array.len()),
        rejected: 0,
    };
    for item in array {
        match serde_json::from_value::<T>(item) {
            Ok(record) if record.is_well_formed() => parsed.items.push(record),
            Ok(_) => {
                debug!("Dropping record with empty required fields");
                parsed.rejected += 1;
            }
            Err(e) => {
                debug!("Dropping non-conforming record: {}", e);
                parsed.rejected += 1;
            }
        }
    }
    Ok(parsed)
}

/// Deserialize a field that models return as either a string or anything else.
pub fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        name: String,
    }

    impl WellFormed for Item {
        fn is_well_formed(&self) -> bool {
            !self.name.trim().is_empty()
        }
    }

    #[test]
    fn test_parse_value_from_json_fence() {
        let raw = "Here you go:\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(parse_value(raw).unwrap(), serde_json::json!({"a": 1}));
    }

    #[test]
    fn test_parse_value_from_plain_fence() {
        let raw = "```\n{\"a\": [1, 2]}\n```";
        assert_eq!(parse_value(raw).unwrap(), serde_json::json!({"a": [1, 2]}));
    }

    #[test]
    fn test_parse_value_from_preamble() {
        let raw = "Sure! {\"snippets\": []} Hope this helps.";
        assert_eq!(parse_value(raw).unwrap(), serde_json::json!({"snippets": []}));
    }

    #[test]
    fn test_parse_value_finds_nothing() {
        assert_eq!(parse_value("I cannot help with that."), Err(ParseError::NoJson));
    }

    #[test]
    fn test_bracketed_preamble_is_skipped() {
        let raw = "Here are the results [2 snippets]:\n{\"snippets\": [{\"name\": \"add\"}]}";
        let parsed: ParsedItems<Item> = parse_items(raw, &["snippets"]).unwrap();
        assert_eq!(parsed.items, vec![Item { name: "add".into() }]);

        let raw = "Found [1] unit:\n[{\"name\": \"z\"}]";
        let parsed: ParsedItems<Item> = parse_items(raw, &["items"]).unwrap();
        assert_eq!(parsed.items[0].name, "z");
    }

    #[test]
    fn test_fence_inside_string_value_does_not_end_block() {
        let raw = "```json\n{\"test_code_result\": [{\"name\": \"doc = '''```python\\nx = 1\\n```'''\"}]}\n```";
        let parsed: ParsedItems<Item> = parse_items(raw, &["test_code_result"]).unwrap();
        assert_eq!(parsed.items.len(), 1);
        assert!(parsed.items[0].name.contains("```python\nx = 1"));
    }

    #[test]
    fn test_braces_in_trailing_prose_are_ignored() {
        let raw = "{\"snippets\": [{\"name\": \"a\"}]}\nNote: use {curly} braces.";
        let parsed: ParsedItems<Item> = parse_items(raw, &["snippets"]).unwrap();
        assert_eq!(parsed.items, vec![Item { name: "a".into() }]);
    }

    #[test]
    fn test_broken_object_is_not_replaced_by_a_nested_one() {
        let err = parse_value("{\"snippets\": [{\"name\": \"a\"}, {\"name\": b}]}").unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
    }

    #[test]
    fn test_bracket_span_skips_strings() {
        assert_eq!(bracket_span("[2 snippets]: {}"), 12);
        assert_eq!(bracket_span("{\"a\": \"}\"} tail"), 10);
        assert_eq!(bracket_span("{\"open\": ["), 10);
    }

    #[test]
    fn test_remove_trailing_commas_outside_strings() {
        let repaired = remove_trailing_commas("{\"a\": [1, 2,], \"b\": \"x,]\",\n}");
        assert_eq!(repaired, "{\"a\": [1, 2], \"b\": \"x,]\"\n}");
        let value: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(value["b"], "x,]");
    }

    #[test]
    fn test_remove_trailing_commas_keeps_escaped_quotes() {
        let repaired = remove_trailing_commas(r#"{"q": "say \"hi\",}", }"#);
        let value: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(value["q"], "say \"hi\",}");
    }

    #[test]
    fn test_parse_value_repairs_trailing_comma() {
        let value = parse_value("{\"items\": [{\"name\": \"x\"},],}").unwrap();
        assert_eq!(value["items"][0]["name"], "x");
    }

    #[test]
    fn test_parse_value_reports_malformed() {
        let err = parse_value("{\"items\": [").unwrap_err();
        assert!(matches!(err, ParseError::NoJson | ParseError::Malformed(_)));
        let err = parse_value("{\"items\": [}").unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
    }

    #[test]
    fn test_parse_items_drops_only_nonconforming_records() {
        let raw = r#"{"items": [{"name": "a"}, {"nom": "b"}, {"name": ""}, {"name": "c"}]}"#;
        let parsed: ParsedItems<Item> = parse_items(raw, &["items"]).unwrap();
        assert_eq!(
            parsed.items,
            vec![Item { name: "a".into() }, Item { name: "c".into() }]
        );
        assert_eq!(parsed.rejected, 2);
    }

    #[test]
    fn test_parse_items_accepts_alias_and_bare_array() {
        let parsed: ParsedItems<Item> =
            parse_items(r#"{"unit_tests": [{"name": "a"}]}"#, &["test_code_result", "unit_tests"])
                .unwrap();
        assert_eq!(parsed.items.len(), 1);

        let parsed: ParsedItems<Item> = parse_items(r#"[{"name": "z"}]"#, &["items"]).unwrap();
        assert_eq!(parsed.items[0].name, "z");
    }

    #[test]
    fn test_parse_items_missing_key_is_schema_error() {
        let err = parse_items::<Item>(r#"{"other": []}"#, &["items"]).unwrap_err();
        assert!(matches!(err, ParseError::Schema(_)));
    }

    #[test]
    fn test_parse_object_rejects_array() {
        let err = parse_object::<Value>("[1, 2]").unwrap_err();
        assert!(matches!(err, ParseError::Schema(_)));
    }
}
