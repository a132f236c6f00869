//! Typed events (C4): schema-validated payloads, memoised template
//! rendering, and severity. Re-expresses the original deep class hierarchy
//! (`Event` <- `DataEvent` <- concrete) as one value type carrying a
//! reference to a shared, statically-registered [`EventKind`] descriptor.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use snafu::Snafu;
use uuid::Uuid;

mod render;
mod wire;

pub use render::substitute;
pub use wire::EventWireError;

/// Fields every schema implicitly reserves: they are injected by the runtime
/// rather than supplied by the caller.
const RESERVED_FIELDS: [&str; 2] = ["timestamp", "summary"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSeverity {
    Informational,
    Warning,
    Error,
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSeverity::Informational => "Informational",
            EventSeverity::Warning => "Warning",
            EventSeverity::Error => "Error",
        }
    }
}

impl fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw values a module may place in a payload before normalisation.
#[derive(Debug, Clone)]
pub enum RawFieldValue {
    Str(String),
    Int(i64),
    Float(f64),
    Timestamp(NaiveDateTime),
    Null,
    /// Anything else. Always rejected by [`normalize`] — present so the
    /// "any other type is a construction error" rule is actually reachable
    /// and testable rather than enforced only by the type checker.
    Unsupported,
}

impl From<&str> for RawFieldValue {
    fn from(v: &str) -> Self {
        RawFieldValue::Str(v.to_string())
    }
}
impl From<String> for RawFieldValue {
    fn from(v: String) -> Self {
        RawFieldValue::Str(v)
    }
}
impl From<i64> for RawFieldValue {
    fn from(v: i64) -> Self {
        RawFieldValue::Int(v)
    }
}
impl From<f64> for RawFieldValue {
    fn from(v: f64) -> Self {
        RawFieldValue::Float(v)
    }
}
impl From<NaiveDateTime> for RawFieldValue {
    fn from(v: NaiveDateTime) -> Self {
        RawFieldValue::Timestamp(v)
    }
}

/// A normalised payload value: the only shapes left once construction has
/// run strings, integers, floats, datetimes and nulls through [`normalize`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl FieldValue {
    pub fn as_display(&self) -> String {
        match self {
            FieldValue::Str(s) => s.clone(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::Float(f) => f.to_string(),
        }
    }
}

fn normalize(field: &str, raw: RawFieldValue) -> Result<FieldValue, EventError> {
    match raw {
        RawFieldValue::Str(s) => Ok(FieldValue::Str(s)),
        RawFieldValue::Int(i) => Ok(FieldValue::Int(i)),
        RawFieldValue::Float(f) => Ok(FieldValue::Float(f)),
        RawFieldValue::Timestamp(ts) => {
            Ok(FieldValue::Str(ts.format("%Y-%m-%d %H:%M:%S").to_string()))
        }
        RawFieldValue::Null => Ok(FieldValue::Str("None".to_string())),
        RawFieldValue::Unsupported => InvalidFieldTypeSnafu {
            field: field.to_string(),
        }
        .fail(),
    }
}

#[derive(Debug, Snafu)]
pub enum EventError {
    #[snafu(display("extra field(s): {fields:?}"))]
    ExtraFields { fields: Vec<String> },
    #[snafu(display("missing field(s): {fields:?}"))]
    MissingFields { fields: Vec<String> },
    #[snafu(display("invalid field(s): {fields:?}"))]
    InvalidFields { fields: Vec<String> },
    #[snafu(display("field {field:?} has an unsupported value type"))]
    InvalidFieldType { field: String },
    #[snafu(display("unknown event kind {name:?}"))]
    UnknownKind { name: String },
    #[snafu(context(false))]
    Wire { source: EventWireError },
}

/// One named `${field}` template, optionally paired with a second template
/// used for tabular rendering (the e-mail handler's "datatable").
#[derive(Debug, Clone, Copy)]
pub struct TemplateSet {
    pub summary: &'static str,
    pub datatable: Option<&'static str>,
}

/// The shared, compile-time descriptor for one class of event. Stands in for
/// what used to be a Python subclass: schema, default template, severity
/// override, and per-content-type template variants all live here once and
/// are referenced, never copied, by every instance.
pub struct EventKind {
    pub name: &'static str,
    pub schema: &'static [(&'static str, &'static str)],
    pub summary_template: &'static str,
    pub templates: &'static [(&'static str, TemplateSet)],
    pub severity_override: Option<EventSeverity>,
}

impl EventKind {
    pub fn field_names(&self) -> Vec<&'static str> {
        self.schema.iter().map(|(name, _)| *name).collect()
    }

    fn template_for(&self, content_type: Option<&str>) -> Option<TemplateSet> {
        let content_type = content_type?;
        self.templates
            .iter()
            .find(|(ct, _)| *ct == content_type)
            .map(|(_, t)| *t)
    }

    pub fn has_template(&self, content_type: &str) -> bool {
        self.templates.iter().any(|(ct, _)| *ct == content_type)
    }

    /// Schemas must not shadow the runtime-injected `timestamp`/`summary`
    /// fields. Checked once, eagerly, by whoever registers the kind.
    pub fn validate_schema(&self) -> Result<(), EventError> {
        let bad: Vec<String> = self
            .schema
            .iter()
            .filter(|(name, _)| RESERVED_FIELDS.contains(name))
            .map(|(name, _)| name.to_string())
            .collect();
        if bad.is_empty() {
            Ok(())
        } else {
            InvalidFieldsSnafu { fields: bad }.fail()
        }
    }
}

/// Registers an [`EventKind`] in the process-wide static registry so wire
/// payloads (which carry only the kind name) can be rehydrated.
pub struct EventKindRegistration(pub &'static EventKind);
inventory::collect!(EventKindRegistration);

pub fn lookup_kind(name: &str) -> Option<&'static EventKind> {
    for reg in inventory::iter::<EventKindRegistration> {
        if reg.0.name == name {
            return Some(reg.0);
        }
    }
    None
}

/// An immutable event value. Cheap to clone: the kind descriptor is a
/// `'static` reference and the payload is typically a handful of fields.
#[derive(Clone)]
pub struct Event {
    pub id: Uuid,
    pub kind: &'static EventKind,
    pub system: String,
    pub severity: EventSeverity,
    pub timestamp: NaiveDateTime,
    pub payload: IndexMap<String, FieldValue>,
    summary_override: Option<String>,
    render_cache: RefCell<HashMap<String, String>>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("fq_id", &self.fq_id())
            .field("severity", &self.severity)
            .field("payload", &self.payload)
            .finish()
    }
}

impl Event {
    /// Builds an event of the given kind, validating the payload against its
    /// schema and normalising every value.
    pub fn new(
        kind: &'static EventKind,
        now: NaiveDateTime,
        payload: IndexMap<String, RawFieldValue>,
        summary_override: Option<String>,
        severity: EventSeverity,
    ) -> Result<Event, EventError> {
        kind.validate_schema()?;

        let expected: std::collections::BTreeSet<&str> =
            kind.schema.iter().map(|(n, _)| *n).collect();
        let given: std::collections::BTreeSet<&str> =
            payload.keys().map(String::as_str).collect();

        let extra: Vec<String> = given.difference(&expected).map(|s| s.to_string()).collect();
        if !extra.is_empty() {
            return ExtraFieldsSnafu { fields: extra }.fail();
        }
        let missing: Vec<String> = expected
            .difference(&given)
            .map(|s| s.to_string())
            .collect();
        if !missing.is_empty() {
            return MissingFieldsSnafu { fields: missing }.fail();
        }

        let mut normalized = IndexMap::with_capacity(payload.len());
        for (name, _) in kind.schema {
            let raw = payload
                .get(*name)
                .cloned()
                .expect("field presence already checked above");
            normalized.insert(name.to_string(), normalize(name, raw)?);
        }

        let severity = kind.severity_override.unwrap_or(severity);

        Ok(Event {
            id: Uuid::new_v4(),
            kind,
            system: "system".to_string(),
            severity,
            timestamp: now,
            payload: normalized,
            summary_override,
            render_cache: RefCell::new(HashMap::new()),
        })
    }

    pub fn fq_id(&self) -> String {
        format!("{}-{}", self.system, self.kind.name)
    }

    fn render_context(&self) -> IndexMap<String, String> {
        let mut ctx: IndexMap<String, String> = self
            .payload
            .iter()
            .map(|(k, v)| (k.clone(), v.as_display()))
            .collect();
        ctx.insert(
            "timestamp".to_string(),
            self.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
        );
        ctx
    }

    fn default_repr(&self) -> String {
        let fields = self
            .payload
            .iter()
            .map(|(k, v)| format!("{k}={}", v.as_display()))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}: {fields}", self.kind.name)
    }

    /// Renders the summary for `content_type` (or the kind's default
    /// template when `None`), memoising the result.
    pub fn render_summary(&self, content_type: Option<&str>) -> String {
        let cache_key = content_type.unwrap_or("").to_string();
        if let Some(cached) = self.render_cache.borrow().get(&cache_key) {
            return cached.clone();
        }
        if let Some(summary) = &self.summary_override {
            self.render_cache
                .borrow_mut()
                .insert(cache_key, summary.clone());
            return summary.clone();
        }

        let template = self
            .kind
            .template_for(content_type)
            .map(|t| t.summary)
            .unwrap_or(self.kind.summary_template);

        let rendered = if template.is_empty() {
            self.default_repr()
        } else {
            render::substitute(template, &self.render_context())
        };
        self.render_cache
            .borrow_mut()
            .insert(cache_key, rendered.clone());
        rendered
    }

    /// Renders the tabular "datatable" view used by handlers that need more
    /// than a one-line summary (currently only the e-mail handler).
    pub fn render_datatable(&self, content_type: &str) -> String {
        match self.kind.template_for(Some(content_type)).and_then(|t| t.datatable) {
            Some(template) => render::substitute(template, &self.render_context()),
            None => self
                .payload
                .iter()
                .map(|(k, v)| format!("{k}: {}", v.as_display()))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, EventWireError> {
        wire::encode(self)
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Event, EventError> {
        Ok(wire::decode(bytes)?)
    }
}
