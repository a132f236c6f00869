//! Explicit, versioned wire encoding for [`Event`](crate::Event), replacing
//! the language-native pickle the original implementation relied on. Events
//! never cross the event stream as in-memory objects; they cross as this DTO.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use uuid::Uuid;

use crate::{Event, EventSeverity, FieldValue};

const WIRE_VERSION: u8 = 1;

#[derive(Debug, Snafu)]
pub enum EventWireError {
    #[snafu(display("event wire envelope has unsupported version {version}"))]
    UnsupportedVersion { version: u8 },
    #[snafu(display("event wire payload is not valid JSON: {source}"))]
    Decode { source: serde_json::Error },
    #[snafu(display("event wire payload references unknown kind {name:?}"))]
    UnknownKind { name: String },
    #[snafu(context(false))]
    Encode { source: serde_json::Error },
}

#[derive(Debug, Serialize, Deserialize)]
enum FieldValueDto {
    Str(String),
    Int(i64),
    Float(f64),
}

impl From<&FieldValue> for FieldValueDto {
    fn from(v: &FieldValue) -> Self {
        match v {
            FieldValue::Str(s) => FieldValueDto::Str(s.clone()),
            FieldValue::Int(i) => FieldValueDto::Int(*i),
            FieldValue::Float(f) => FieldValueDto::Float(*f),
        }
    }
}

impl From<FieldValueDto> for FieldValue {
    fn from(v: FieldValueDto) -> Self {
        match v {
            FieldValueDto::Str(s) => FieldValue::Str(s),
            FieldValueDto::Int(i) => FieldValue::Int(i),
            FieldValueDto::Float(f) => FieldValue::Float(f),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum SeverityDto {
    Informational,
    Warning,
    Error,
}

impl From<EventSeverity> for SeverityDto {
    fn from(v: EventSeverity) -> Self {
        match v {
            EventSeverity::Informational => SeverityDto::Informational,
            EventSeverity::Warning => SeverityDto::Warning,
            EventSeverity::Error => SeverityDto::Error,
        }
    }
}

impl From<SeverityDto> for EventSeverity {
    fn from(v: SeverityDto) -> Self {
        match v {
            SeverityDto::Informational => EventSeverity::Informational,
            SeverityDto::Warning => EventSeverity::Warning,
            SeverityDto::Error => EventSeverity::Error,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EventDto {
    version: u8,
    id: Uuid,
    kind: String,
    system: String,
    severity: SeverityDto,
    timestamp: chrono::NaiveDateTime,
    payload: Vec<(String, FieldValueDto)>,
}

pub fn encode(event: &Event) -> Result<Vec<u8>, EventWireError> {
    let dto = EventDto {
        version: WIRE_VERSION,
        id: event.id,
        kind: event.kind.name.to_string(),
        system: event.system.clone(),
        severity: event.severity.into(),
        timestamp: event.timestamp,
        payload: event
            .payload
            .iter()
            .map(|(k, v)| (k.clone(), v.into()))
            .collect(),
    };
    Ok(serde_json::to_vec(&dto)?)
}

pub fn decode(bytes: &[u8]) -> Result<Event, EventWireError> {
    let dto: EventDto = serde_json::from_slice(bytes).context(DecodeSnafu)?;
    if dto.version != WIRE_VERSION {
        return UnsupportedVersionSnafu {
            version: dto.version,
        }
        .fail();
    }
    let kind = crate::lookup_kind(&dto.kind).ok_or_else(|| {
        UnknownKindSnafu {
            name: dto.kind.clone(),
        }
        .build()
    })?;

    let payload: IndexMap<String, FieldValue> = dto
        .payload
        .into_iter()
        .map(|(k, v)| (k, v.into()))
        .collect();

    Ok(Event {
        id: dto.id,
        kind,
        system: dto.system,
        severity: dto.severity.into(),
        timestamp: dto.timestamp,
        payload,
        summary_override: None,
        render_cache: std::cell::RefCell::new(std::collections::HashMap::new()),
    })
}
