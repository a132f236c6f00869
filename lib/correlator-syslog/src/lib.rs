//! RFC 5424 framing and record parsing (C2).
//!
//! The wire format this crate understands is deliberately narrower than full
//! RFC 5424: a fixed header shape, followed by a structured-data block parsed
//! by a small hand-rolled state machine, followed by free-form detail text.
//! Records are framed by a trailer byte sequence (commonly `\n`) discovered
//! once per connection/stream and then fixed for its lifetime.

use std::sync::OnceLock;

use bytes::Bytes;
use chrono::NaiveDateTime;
use regex::Regex;

mod sdata;
mod trailer;

pub use sdata::{ParsedSdata, StructuredData};
pub use trailer::{discover_trailer, DiscoveryFn, DEFAULT_TRAILER};

fn header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^<(?P<priority>\d+?)>(?P<version>\d) (?P<timestamp>.+?) (?P<hostname>.+?) (?P<appname>.+?) (?P<proc_id>.+?) (?P<msg_id>.+?) (?P<rest>.+)$",
        )
        .expect("valid syslog header regex")
    })
}

/// Byte sequence `EF BB BF` (UTF-8 BOM), tolerated and stripped anywhere it
/// occurs inside a record before UTF-8 decoding.
const BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

fn strip_bom(record: &[u8]) -> Vec<u8> {
    if !record.windows(BOM.len()).any(|w| w == BOM) {
        return record.to_vec();
    }
    let mut out = Vec::with_capacity(record.len());
    let mut i = 0;
    while i < record.len() {
        if record[i..].starts_with(&BOM) {
            i += BOM.len();
        } else {
            out.push(record[i]);
            i += 1;
        }
    }
    out
}

/// A best-effort parse of a raw block, used only for trailer discovery. It
/// never fails: fields default to `None` and `structured_data` defaults to
/// empty if the block doesn't parse far enough.
#[derive(Debug, Clone, Default)]
pub struct RawRecord {
    pub priority: Option<String>,
    pub version: Option<String>,
    pub hostname: Option<String>,
    pub appname: Option<String>,
    pub proc_id: Option<String>,
    pub msg_id: Option<String>,
    pub structured_data: StructuredData,
}

/// Parses as much of `block` as possible for trailer discovery purposes.
/// Mirrors `SyslogRecord.sdata_from_raw` in the original implementation, but
/// keeps the rest of the header fields too since the discovery callable may
/// want them.
pub fn parse_raw(block: &[u8]) -> RawRecord {
    let stripped = strip_bom(block);
    let Ok(decoded) = std::str::from_utf8(&stripped) else {
        return RawRecord::default();
    };
    let Some(caps) = header_regex().captures(decoded) else {
        return RawRecord::default();
    };
    let structured_data = sdata::parse(&caps["rest"])
        .map(|parsed| parsed.structured_data)
        .unwrap_or_default();
    RawRecord {
        priority: Some(caps["priority"].to_string()),
        version: Some(caps["version"].to_string()),
        hostname: Some(caps["hostname"].to_string()),
        appname: Some(caps["appname"].to_string()),
        proc_id: Some(caps["proc_id"].to_string()),
        msg_id: Some(caps["msg_id"].to_string()),
        structured_data,
    }
}

/// An immutable, parsed RFC-5424-shaped record (§3 `SyslogRecord`).
#[derive(Debug, Clone)]
pub struct SyslogRecord {
    pub raw: Bytes,
    pub timestamp: Option<NaiveDateTime>,
    pub priority: Option<String>,
    pub hostname: Option<String>,
    pub appname: Option<String>,
    pub proc_id: Option<String>,
    pub msg_id: Option<String>,
    pub detail: Option<String>,
    pub structured_data: StructuredData,
    pub parse_error: Option<String>,
}

impl SyslogRecord {
    fn failed(raw: Bytes, message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::debug!(error = %message, bytes = raw.len(), "syslog record failed to parse");
        SyslogRecord {
            raw,
            timestamp: None,
            priority: None,
            hostname: None,
            appname: None,
            proc_id: None,
            msg_id: None,
            detail: None,
            structured_data: StructuredData::default(),
            parse_error: Some(message),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.parse_error.is_none()
    }
}

/// Parses a single framed record (everything between two trailers, with the
/// trailer itself already stripped).
pub fn parse(record: &[u8]) -> SyslogRecord {
    let raw = Bytes::copy_from_slice(record);
    let stripped = strip_bom(record);
    let Ok(decoded) = std::str::from_utf8(&stripped) else {
        return SyslogRecord::failed(raw, "1st stage parse failure");
    };

    let Some(caps) = header_regex().captures(decoded) else {
        return SyslogRecord::failed(raw, "1st stage parse failure");
    };

    let timestamp_str = caps["timestamp"].to_string();
    let Some(timestamp) = parse_timestamp(&timestamp_str) else {
        return SyslogRecord::failed(raw, "Cannot parse timestamp");
    };

    let parsed_sdata = match sdata::parse(&caps["rest"]) {
        Ok(parsed) => parsed,
        Err(e) => {
            return SyslogRecord::failed(raw, format!("Cannot parse structured data: {e}"));
        }
    };

    SyslogRecord {
        raw,
        timestamp: Some(timestamp),
        priority: Some(caps["priority"].to_string()),
        hostname: Some(caps["hostname"].to_string()),
        appname: Some(caps["appname"].to_string()),
        proc_id: Some(caps["proc_id"].to_string()),
        msg_id: Some(caps["msg_id"].to_string()),
        detail: Some(parsed_sdata.detail),
        structured_data: parsed_sdata.structured_data,
        parse_error: None,
    }
}

/// Parses an ISO-8601 timestamp with timezone, normalises it to UTC, and
/// drops the timezone: downstream modules and templates treat timestamps as
/// comparable naive scalars without further tz arithmetic.
fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.naive_utc())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rest: &str) -> Vec<u8> {
        format!("<34>1 2023-10-11T22:14:15.003Z myhost app 1234 ID47 {rest}").into_bytes()
    }

    #[test]
    fn parses_valid_record_without_sd() {
        let record = parse(&sample("- Connection from 10.0.0.1"));
        assert!(record.is_ok());
        assert_eq!(record.detail.as_deref(), Some("Connection from 10.0.0.1"));
        assert!(record.structured_data.is_empty());
    }

    #[test]
    fn raw_round_trips_byte_for_byte() {
        let bytes = sample(r#"[ex@1 key="value"] detail text"#);
        let record = parse(&bytes);
        assert!(record.is_ok());
        assert_eq!(record.raw.as_ref(), bytes.as_slice());
    }

    #[test]
    fn parses_structured_data() {
        let record = parse(&sample(r#"[ex@1 iut="3" eventSource="App"] the detail"#));
        assert!(record.is_ok(), "{:?}", record.parse_error);
        assert_eq!(record.detail.as_deref(), Some("the detail"));
        let el = record.structured_data.get("ex@1").expect("element present");
        assert_eq!(el.get("iut").map(String::as_str), Some("3"));
        assert_eq!(el.get("eventSource").map(String::as_str), Some("App"));
    }

    #[test]
    fn bom_between_header_and_detail_is_stripped() {
        let mut bytes = b"<34>1 2023-10-11T22:14:15.003Z h a p m \xef\xbb\xbf".to_vec();
        bytes.extend_from_slice(b"- detail");
        let record = parse(&bytes);
        assert!(record.is_ok(), "{:?}", record.parse_error);
        assert_eq!(record.detail.as_deref(), Some("detail"));
        assert!(record.structured_data.is_empty());
    }

    #[test]
    fn invalid_timestamp_is_reported() {
        let bytes = b"<34>1 not-a-date h a p m - detail".to_vec();
        let record = parse(&bytes);
        assert_eq!(record.parse_error.as_deref(), Some("Cannot parse timestamp"));
    }

    #[test]
    fn malformed_header_is_first_stage_failure() {
        let record = parse(b"not a syslog record at all");
        assert_eq!(record.parse_error.as_deref(), Some("1st stage parse failure"));
    }
}
