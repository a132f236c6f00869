//! A tiny boolean expression evaluator over an event's `severity`, `system`,
//! `id`/`fq_id`, and payload fields — the safe substitute for rendering a
//! filter template to the literal string `"True"` (see design notes on
//! replacing the Mako-based filter templates).
//!
//! Grammar: `event.<field> (== | !=) <literal>`, combined with `&&`/`||`
//! (left to right, no parentheses, `&&` binds inside each `||` group). A
//! literal may be a quoted string, an `EventSeverity.Xxx` name, or a bare
//! token compared against the field's display form.

use correlator_event::Event;
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum FilterError {
    #[snafu(display("empty filter expression"))]
    Empty,
    #[snafu(display("comparison {expr:?} is missing an operator (== or !=)"))]
    MissingOperator { expr: String },
    #[snafu(display("left-hand side {lhs:?} must start with \"event.\""))]
    NotAnEventField { lhs: String },
}

pub fn evaluate(expr: &str, event: &Event) -> Result<bool, FilterError> {
    if expr.trim().is_empty() {
        return Err(FilterError::Empty);
    }
    for disjunct in expr.split("||") {
        let mut all_true = true;
        for conjunct in disjunct.split("&&") {
            if !evaluate_comparison(conjunct.trim(), event)? {
                all_true = false;
                break;
            }
        }
        if all_true {
            return Ok(true);
        }
    }
    Ok(false)
}

fn evaluate_comparison(expr: &str, event: &Event) -> Result<bool, FilterError> {
    let (negate, lhs, rhs) = if let Some((lhs, rhs)) = expr.split_once("!=") {
        (true, lhs, rhs)
    } else if let Some((lhs, rhs)) = expr.split_once("==") {
        (false, lhs, rhs)
    } else {
        return MissingOperatorSnafu {
            expr: expr.to_string(),
        }
        .fail();
    };

    let field = lhs.trim();
    let field = field.strip_prefix("event.").ok_or_else(|| {
        NotAnEventFieldSnafu {
            lhs: field.to_string(),
        }
        .build()
    })?;

    let actual = field_value(field, event);
    let expected = parse_literal(rhs.trim());
    Ok((actual == expected) != negate)
}

fn field_value(field: &str, event: &Event) -> String {
    match field {
        "severity" => event.severity.as_str().to_string(),
        "system" => event.system.clone(),
        "id" => event.id.to_string(),
        "fq_id" => event.fq_id(),
        other => event
            .payload
            .get(other)
            .map(|v| v.as_display())
            .unwrap_or_default(),
    }
}

fn parse_literal(raw: &str) -> String {
    let raw = raw
        .strip_prefix("EventSeverity.")
        .unwrap_or(raw)
        .trim();
    if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
        || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
    {
        raw[1..raw.len() - 1].to_string()
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use correlator_event::{EventKind, EventSeverity, RawFieldValue};
    use indexmap::IndexMap;

    static DEMO_KIND: EventKind = EventKind {
        name: "demo.widget",
        schema: &[("user", "the user")],
        summary_template: "",
        templates: &[],
        severity_override: None,
    };

    fn event(user: &str, severity: EventSeverity) -> Event {
        let mut payload = IndexMap::new();
        payload.insert("user".to_string(), RawFieldValue::from(user));
        Event::new(
            &DEMO_KIND,
            NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap(),
            payload,
            None,
            severity,
        )
        .unwrap()
    }

    #[test]
    fn severity_equality_matches_enum_style_literal() {
        let evt = event("alice", EventSeverity::Error);
        assert!(evaluate("event.severity == EventSeverity.Error", &evt).unwrap());
        assert!(!evaluate("event.severity == EventSeverity.Warning", &evt).unwrap());
    }

    #[test]
    fn payload_field_comparison_with_quoted_literal() {
        let evt = event("alice", EventSeverity::Informational);
        assert!(evaluate(r#"event.user == "alice""#, &evt).unwrap());
        assert!(evaluate(r#"event.user != "bob""#, &evt).unwrap());
    }

    #[test]
    fn conjunction_requires_every_clause() {
        let evt = event("alice", EventSeverity::Error);
        assert!(evaluate(
            r#"event.user == "alice" && event.severity == EventSeverity.Error"#,
            &evt
        )
        .unwrap());
        assert!(!evaluate(
            r#"event.user == "bob" && event.severity == EventSeverity.Error"#,
            &evt
        )
        .unwrap());
    }

    #[test]
    fn disjunction_matches_if_either_clause_holds() {
        let evt = event("alice", EventSeverity::Informational);
        assert!(evaluate(
            r#"event.user == "bob" || event.user == "alice""#,
            &evt
        )
        .unwrap());
    }

    #[test]
    fn missing_operator_is_an_error() {
        let evt = event("alice", EventSeverity::Informational);
        assert!(evaluate("event.user alice", &evt).is_err());
    }
}
