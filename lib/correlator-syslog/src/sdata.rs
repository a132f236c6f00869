//! The structured-data (SD) sub-parser: a two-state hand-rolled machine
//! rather than a general recursive-descent parser, matching the narrow shape
//! RFC 5424 structured data actually takes in practice.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

/// `SD-ID -> (key -> value)`, in element-declaration order for iteration
/// stability in tests and logs.
pub type StructuredData = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug)]
pub struct ParsedSdata {
    pub structured_data: StructuredData,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Expecting either the empty-SD marker (`- `), the start of an element
    /// (`[ID `), or, once at least one element has been seen, the detail
    /// text that follows the SD block.
    BetweenElements,
    /// Inside an open `[ID ...]` element, expecting `KEY="VALUE"` pairs or
    /// the closing `]`.
    InElement,
}

fn dash_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^-\s+(.+)$").expect("valid regex"))
}

fn element_start_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[(\w+) (.*)$").expect("valid regex"))
}

fn element_close_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\](.*)$").expect("valid regex"))
}

fn key_value_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^(.+?)="([^"]*)"\s*(.*)$"#).expect("valid regex"))
}

/// Parses the portion of the record following the header into a structured
/// data map plus the remaining free-text detail. Returns `Err(message)` on
/// malformed input; the message becomes part of the caller's
/// `"Cannot parse structured data: {message}"` surface.
pub fn parse(rest: &str) -> Result<ParsedSdata, String> {
    let mut structured_data = StructuredData::new();
    let mut state = State::BetweenElements;
    let mut current_id = String::new();
    let mut elements_seen = 0usize;
    let mut remaining = rest;

    loop {
        match state {
            State::BetweenElements => {
                if let Some(caps) = dash_marker_re().captures(remaining) {
                    return Ok(ParsedSdata {
                        structured_data,
                        detail: caps[1].to_string(),
                    });
                }
                if let Some(caps) = element_start_re().captures(remaining) {
                    current_id = caps[1].to_string();
                    structured_data.entry(current_id.clone()).or_default();
                    remaining = caps.get(2).unwrap().as_str();
                    state = State::InElement;
                    continue;
                }
                if elements_seen > 0 {
                    return Ok(ParsedSdata {
                        structured_data,
                        detail: remaining.trim_start().to_string(),
                    });
                }
                return Err(format!("SD-DATA parse failed at: {remaining:?}"));
            }
            State::InElement => {
                if let Some(caps) = element_close_re().captures(remaining) {
                    elements_seen += 1;
                    remaining = caps.get(1).unwrap().as_str();
                    state = State::BetweenElements;
                    continue;
                }
                if let Some(caps) = key_value_re().captures(remaining) {
                    let key = caps[1].trim().to_string();
                    let value = caps[2].to_string();
                    structured_data
                        .entry(current_id.clone())
                        .or_default()
                        .insert(key, value);
                    remaining = caps.get(3).unwrap().as_str();
                    continue;
                }
                return Err(format!(
                    "expected KEY=\"VALUE\" or ']' inside [{current_id}], found: {remaining:?}"
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_marker_yields_no_elements() {
        let parsed = parse("- the detail text").expect("parses");
        assert!(parsed.structured_data.is_empty());
        assert_eq!(parsed.detail, "the detail text");
    }

    #[test]
    fn single_element_with_two_pairs() {
        let parsed = parse(r#"[exampleSDID@1 iut="3" eventSource="Application"] detail"#)
            .expect("parses");
        assert_eq!(parsed.detail, "detail");
        let el = &parsed.structured_data["exampleSDID@1"];
        assert_eq!(el["iut"], "3");
        assert_eq!(el["eventSource"], "Application");
    }

    #[test]
    fn multiple_elements_accumulate() {
        let parsed = parse(r#"[a@1 k="1"][b@1 k="2"] tail"#).expect("parses");
        assert_eq!(parsed.structured_data.len(), 2);
        assert_eq!(parsed.structured_data["a@1"]["k"], "1");
        assert_eq!(parsed.structured_data["b@1"]["k"], "2");
        assert_eq!(parsed.detail, "tail");
    }

    #[test]
    fn malformed_element_is_an_error() {
        let err = parse("not valid sd").unwrap_err();
        assert!(err.contains("SD-DATA parse failed"));
    }

    #[test]
    fn unterminated_element_is_an_error() {
        let err = parse(r#"[a@1 k="1""#).unwrap_err();
        assert!(err.contains("expected KEY"));
    }
}
