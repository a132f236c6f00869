//! Reference ingest and event stream transports (§6): the real stream-broker
//! wire protocol and gRPC transport are out of scope (§1). [`JsonlStream`] is
//! an append-only, newline-delimited JSON file implementing all four stream
//! contracts, offset-addressed by 1-based line number, matching the
//! engine's and reactor's own offset numbering.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use correlator_event::Event;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum TransportError {
    #[snafu(display("failed to read {path}: {source}"))]
    Read { path: String, source: std::io::Error },
    #[snafu(display("failed to write {path}: {source}"))]
    Write { path: String, source: std::io::Error },
    #[snafu(display("frame at {path} line {line} is not valid: {source}"))]
    Decode {
        path: String,
        line: usize,
        source: serde_json::Error,
    },
    #[snafu(context(false))]
    Encode { source: serde_json::Error },
    #[snafu(context(false))]
    EventWire {
        source: correlator_event::EventWireError,
    },
    #[snafu(context(false))]
    Event {
        source: correlator_event::EventError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordType {
    Heartbeat = 0,
    SyslogData = 1,
}

/// The ingest wire envelope (§6): what crosses source -> engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub tenant_id: String,
    pub source_id: String,
    pub record_type: RecordType,
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

pub trait IngestTransport: Send {
    fn publish(&mut self, envelope: &WireEnvelope) -> Result<u64, TransportError>;
}

pub trait IngestSource: Send {
    /// Every envelope with offset strictly greater than `after`.
    fn poll(&mut self, after: Option<u64>) -> Result<Vec<(u64, WireEnvelope)>, TransportError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventFrame {
    tenant_id: String,
    event: Vec<u8>,
}

pub trait EventTransport: Send {
    fn publish(&mut self, tenant_id: &str, event: &Event) -> Result<u64, TransportError>;
}

pub trait EventSource: Send {
    fn poll(&mut self, after: Option<u64>) -> Result<Vec<(u64, String, Event)>, TransportError>;
}

/// One append-only JSONL file. The same struct plays ingest-transport,
/// ingest-source, event-transport, or event-source depending which trait a
/// caller reaches for, since all four contracts reduce to "append a frame" /
/// "read frames past an offset" over one file.
pub struct JsonlStream {
    path: PathBuf,
}

impl JsonlStream {
    pub fn new(path: PathBuf) -> Self {
        JsonlStream { path }
    }

    fn append<T: Serialize>(&self, value: &T) -> Result<u64, TransportError> {
        let line = serde_json::to_string(value)?;
        let display = self.path.display().to_string();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context(WriteSnafu {
                path: display.clone(),
            })?;
        writeln!(file, "{line}").context(WriteSnafu { path: display })?;
        self.current_offset()
    }

    /// The offset of the last frame written, or 0 if the file is empty or
    /// absent — the baseline a fresh ("from end") subscriber starts from.
    pub fn current_offset(&self) -> Result<u64, TransportError> {
        if !self.path.exists() {
            return Ok(0);
        }
        let file = File::open(&self.path).context(ReadSnafu {
            path: self.path.display().to_string(),
        })?;
        Ok(BufReader::new(file).lines().count() as u64)
    }

    fn read_from(&self, after: Option<u64>) -> Result<Vec<(u64, String)>, TransportError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).context(ReadSnafu {
            path: self.path.display().to_string(),
        })?;
        let start = after.unwrap_or(0);
        let mut out = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let offset = (idx + 1) as u64;
            if offset <= start {
                continue;
            }
            let line = line.context(ReadSnafu {
                path: self.path.display().to_string(),
            })?;
            out.push((offset, line));
        }
        Ok(out)
    }
}

impl IngestTransport for JsonlStream {
    fn publish(&mut self, envelope: &WireEnvelope) -> Result<u64, TransportError> {
        self.append(envelope)
    }
}

impl IngestSource for JsonlStream {
    fn poll(&mut self, after: Option<u64>) -> Result<Vec<(u64, WireEnvelope)>, TransportError> {
        self.read_from(after)?
            .into_iter()
            .map(|(offset, line)| {
                let envelope: WireEnvelope =
                    serde_json::from_str(&line).context(DecodeSnafu {
                        path: self.path.display().to_string(),
                        line: offset as usize,
                    })?;
                Ok((offset, envelope))
            })
            .collect()
    }
}

impl EventTransport for JsonlStream {
    fn publish(&mut self, tenant_id: &str, event: &Event) -> Result<u64, TransportError> {
        let frame = EventFrame {
            tenant_id: tenant_id.to_string(),
            event: event.to_wire()?,
        };
        self.append(&frame)
    }
}

impl EventSource for JsonlStream {
    fn poll(&mut self, after: Option<u64>) -> Result<Vec<(u64, String, Event)>, TransportError> {
        self.read_from(after)?
            .into_iter()
            .map(|(offset, line)| {
                let frame: EventFrame = serde_json::from_str(&line).context(DecodeSnafu {
                    path: self.path.display().to_string(),
                    line: offset as usize,
                })?;
                let event = Event::from_wire(&frame.event)?;
                Ok((offset, frame.tenant_id, event))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use correlator_event::{EventKind, EventSeverity};
    use indexmap::IndexMap;
    use tempfile::tempdir;

    static DEMO_KIND: EventKind = EventKind {
        name: "demo.widget",
        schema: &[],
        summary_template: "a widget",
        templates: &[],
        severity_override: None,
    };

    #[test]
    fn ingest_round_trips_and_offsets_are_one_based() {
        let dir = tempdir().unwrap();
        let mut stream = JsonlStream::new(dir.path().join("ingest.jsonl"));
        let envelope = WireEnvelope {
            tenant_id: "acme".to_string(),
            source_id: "src1".to_string(),
            record_type: RecordType::SyslogData,
            timestamp_ms: 1,
            payload: b"hello".to_vec(),
        };
        assert_eq!(IngestTransport::publish(&mut stream, &envelope).unwrap(), 1);
        assert_eq!(IngestTransport::publish(&mut stream, &envelope).unwrap(), 2);

        let all = IngestSource::poll(&mut stream, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, 1);

        let tail = IngestSource::poll(&mut stream, Some(1)).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].0, 2);
    }

    #[test]
    fn event_stream_round_trips_tenant_and_payload() {
        let dir = tempdir().unwrap();
        let mut stream = JsonlStream::new(dir.path().join("events.jsonl"));
        let event = Event::new(
            &DEMO_KIND,
            NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap(),
            IndexMap::new(),
            None,
            EventSeverity::Informational,
        )
        .unwrap();
        EventTransport::publish(&mut stream, "acme", &event).unwrap();

        let read = EventSource::poll(&mut stream, None).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].1, "acme");
        assert_eq!(read[0].2.kind.name, "demo.widget");
    }

    #[test]
    fn poll_on_a_missing_file_is_empty_not_an_error() {
        let dir = tempdir().unwrap();
        let mut stream = JsonlStream::new(dir.path().join("absent.jsonl"));
        assert!(IngestSource::poll(&mut stream, None).unwrap().is_empty());
        assert_eq!(stream.current_offset().unwrap(), 0);
    }
}
