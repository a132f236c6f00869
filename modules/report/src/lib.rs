//! The simplest possible module: it never filters anything out. Every
//! record it sees is both summarised as a notice event and folded into a
//! running min/max-timestamp, record-count, byte-count report, emitted on
//! request via [`Module::statistics`].

use chrono::NaiveDateTime;
use correlator_config::ConfigStore;
use correlator_event::{Event, EventKind, EventKindRegistration, EventSeverity, RawFieldValue};
use correlator_module::{dispatch_event, EventSink, Module, ModuleError, ModuleRegistration};
use correlator_syslog::SyslogRecord;
use serde::{Deserialize, Serialize};

const MODULE_ID: &str = "Report";

static REPORT_NOTICE_KIND: EventKind = EventKind {
    name: "report_notice",
    schema: &[("line", "a one-line rendering of the source record")],
    summary_template: "${line}",
    templates: &[],
    severity_override: None,
};
inventory::submit! { EventKindRegistration(&REPORT_NOTICE_KIND) }

static REPORT_STATS_KIND: EventKind = EventKind {
    name: "module-stats",
    schema: &[
        ("start", "timestamp of the earliest record seen"),
        ("end", "timestamp of the latest record seen"),
        ("duration", "span between start and end"),
        ("messages", "records processed since the last reset"),
        ("size", "total bytes processed since the last reset"),
    ],
    summary_template: "Syslog record reporting started at ${start} and ended at ${end} for a duration \
        of ${duration}. ${messages} total messages (${size} bytes) were processed.",
    templates: &[],
    severity_override: None,
};
inventory::submit! { EventKindRegistration(&REPORT_STATS_KIND) }

inventory::submit! {
    ModuleRegistration {
        id: MODULE_ID,
        constructor: |module_name| Box::new(Report::new(module_name)),
    }
}

#[derive(Default, Serialize, Deserialize)]
struct Store {
    num_records: u64,
    size_records: u64,
    start: Option<NaiveDateTime>,
    end: Option<NaiveDateTime>,
}

pub struct Report {
    module_name: String,
    store: Store,
}

impl Report {
    pub fn new(module_name: String) -> Self {
        Report {
            module_name,
            store: Store::default(),
        }
    }

    fn summary_line(record: &SyslogRecord) -> String {
        format!(
            "{} {} {}",
            record.timestamp.map(|t| t.to_string()).unwrap_or_default(),
            record.appname.as_deref().unwrap_or("-"),
            record.detail.as_deref().unwrap_or("")
        )
    }
}

impl Module for Report {
    fn module_name(&self) -> &str {
        &self.module_name
    }

    fn description(&self) -> &str {
        "Report-only"
    }

    fn initialize(&mut self, _config: &ConfigStore) -> Result<(), ModuleError> {
        Ok(())
    }

    fn handle_record(&mut self, record: &SyslogRecord, sink: &mut dyn EventSink) {
        if let Some(ts) = record.timestamp {
            let starts_earlier = match self.store.start {
                Some(start) => ts < start,
                None => true,
            };
            if starts_earlier {
                self.store.start = Some(ts);
            }
            let ends_later = match self.store.end {
                Some(end) => ts > end,
                None => true,
            };
            if ends_later {
                self.store.end = Some(ts);
            }
        }

        let mut payload = indexmap::IndexMap::new();
        payload.insert("line".to_string(), RawFieldValue::from(Self::summary_line(record)));
        let evt = Event::new(
            &REPORT_NOTICE_KIND,
            record.timestamp.unwrap_or_default(),
            payload,
            None,
            EventSeverity::Informational,
        )
        .expect("report_notice payload matches its own schema");
        dispatch_event(&self.module_name, evt, sink);

        self.store.num_records += 1;
        self.store.size_records += record.raw.len() as u64;
    }

    fn statistics(&mut self, reset: bool, sink: &mut dyn EventSink) {
        let mut payload = indexmap::IndexMap::new();
        payload.insert("start".to_string(), display_or_none(self.store.start));
        payload.insert("end".to_string(), display_or_none(self.store.end));
        let duration = match (self.store.start, self.store.end) {
            (Some(start), Some(end)) => end.signed_duration_since(start).to_string(),
            _ => "0".to_string(),
        };
        payload.insert("duration".to_string(), RawFieldValue::from(duration));
        payload.insert(
            "messages".to_string(),
            RawFieldValue::from(self.store.num_records as i64),
        );
        payload.insert("size".to_string(), RawFieldValue::from(self.store.size_records as i64));

        let evt = Event::new(
            &REPORT_STATS_KIND,
            self.store.end.unwrap_or_default(),
            payload,
            None,
            EventSeverity::Informational,
        )
        .expect("module-stats payload matches its own schema");
        dispatch_event(&self.module_name, evt, sink);

        if reset {
            self.store = Store::default();
        }
    }

    fn save_store(&self) -> Vec<u8> {
        serde_json::to_vec(&self.store).unwrap_or_default()
    }

    fn load_store(&mut self, bytes: &[u8]) -> Result<(), ModuleError> {
        self.store = serde_json::from_slice(bytes).map_err(|e| ModuleError::StoreDecode {
            message: e.to_string(),
        })?;
        Ok(())
    }

    fn fresh_store(&mut self) {
        self.store = Store::default();
    }
}

fn display_or_none(ts: Option<NaiveDateTime>) -> RawFieldValue {
    match ts {
        Some(t) => RawFieldValue::from(t),
        None => RawFieldValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use correlator_module::EventQueue;

    fn record(ts: &str, detail: &str) -> SyslogRecord {
        SyslogRecord {
            raw: Bytes::from(detail.as_bytes().to_vec()),
            timestamp: Some(NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S").unwrap()),
            priority: None,
            hostname: Some("host1".to_string()),
            appname: Some("sshd".to_string()),
            proc_id: Some("1".to_string()),
            msg_id: None,
            detail: Some(detail.to_string()),
            structured_data: Default::default(),
            parse_error: None,
        }
    }

    #[test]
    fn every_record_emits_a_notice_and_updates_the_running_window() {
        let mut module = Report::new("report".to_string());
        let mut sink = EventQueue::new();

        module.handle_record(&record("2024-01-01 00:00:00", "first"), &mut sink);
        module.handle_record(&record("2024-01-01 00:05:00", "second"), &mut sink);

        let events = sink.drain();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind.name == "report_notice"));
        assert_eq!(module.store.num_records, 2);
        assert_eq!(
            module.store.start,
            Some(NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap())
        );
        assert_eq!(
            module.store.end,
            Some(NaiveDateTime::parse_from_str("2024-01-01 00:05:00", "%Y-%m-%d %H:%M:%S").unwrap())
        );
    }

    #[test]
    fn statistics_resets_the_window_when_asked() {
        let mut module = Report::new("report".to_string());
        let mut sink = EventQueue::new();
        module.handle_record(&record("2024-01-01 00:00:00", "first"), &mut sink);
        sink.drain();

        module.statistics(true, &mut sink);
        let events = sink.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind.name, "module-stats");
        assert_eq!(module.store.num_records, 0);
        assert!(module.store.start.is_none());
    }

    #[test]
    fn checkpoint_round_trips_through_json() {
        let mut module = Report::new("report".to_string());
        let mut sink = EventQueue::new();
        module.handle_record(&record("2024-01-01 00:00:00", "first"), &mut sink);

        let bytes = module.save_store();
        let mut restored = Report::new("report".to_string());
        restored.load_store(&bytes).unwrap();
        assert_eq!(restored.store.num_records, 1);
        assert_eq!(restored.store.start, module.store.start);
    }
}
