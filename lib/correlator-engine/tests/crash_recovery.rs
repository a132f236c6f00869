//! Crash-before-checkpoint recovery: a crash between emitting an event and
//! persisting the checkpoint for that envelope must, on restart, re-deliver
//! the envelope and re-emit the event rather than lose either.

use chrono::NaiveDateTime;
use correlator_config::ConfigStore;
use correlator_engine::{Engine, Snapshot, Tenant};
use correlator_event::{Event, EventKind, EventKindRegistration, EventSeverity, RawFieldValue};
use correlator_module::{EventSink, Module, ModuleError};
use correlator_syslog::SyslogRecord;
use indexmap::IndexMap;
use tempfile::tempdir;

static FIFTH_SAMPLE_KIND: EventKind = EventKind {
    name: "test.fifth_sample",
    schema: &[("offset", "the envelope offset this was emitted for")],
    summary_template: "sampled offset ${offset}",
    templates: &[],
    severity_override: None,
};
inventory::submit! { EventKindRegistration(&FIFTH_SAMPLE_KIND) }

/// Emits exactly one event, for the sixth record it sees (envelope 105 of a
/// 100..=109 run), then stays silent. Mirrors the shape of a module that
/// reacts to a specific record rather than every one.
struct SampleOnSixthRecord {
    seen: i64,
}

impl Module for SampleOnSixthRecord {
    fn module_name(&self) -> &str {
        "sampler"
    }

    fn initialize(&mut self, _config: &ConfigStore) -> Result<(), ModuleError> {
        Ok(())
    }

    fn handle_record(&mut self, record: &SyslogRecord, sink: &mut dyn EventSink) {
        self.seen += 1;
        if self.seen == 6 {
            let mut payload = IndexMap::new();
            payload.insert(
                "offset".to_string(),
                RawFieldValue::from(record.raw.len() as i64),
            );
            let event = Event::new(
                &FIFTH_SAMPLE_KIND,
                NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap(),
                payload,
                None,
                EventSeverity::Informational,
            )
            .unwrap();
            correlator_module::dispatch_event("sampler", event, sink);
        }
    }

    fn statistics(&mut self, _reset: bool, _sink: &mut dyn EventSink) {}

    fn save_store(&self) -> Vec<u8> {
        serde_json::to_vec(&self.seen).unwrap()
    }

    fn load_store(&mut self, bytes: &[u8]) -> Result<(), ModuleError> {
        self.seen = serde_json::from_slice(bytes).map_err(|e| ModuleError::StoreDecode {
            message: e.to_string(),
        })?;
        Ok(())
    }

    fn fresh_store(&mut self) {
        self.seen = 0;
    }
}

fn build_engine() -> Engine {
    Engine::new(
        vec![Tenant {
            tenant_id: "acme".to_string(),
            modules: vec![Box::new(SampleOnSixthRecord { seen: 0 })],
        }],
        100,
        15,
    )
}

fn record_for(offset: u64) -> SyslogRecord {
    correlator_syslog::parse(format!("<34>1 2024-01-01T00:00:00Z host app {offset} - - hello").as_bytes())
}

#[test]
fn crash_before_checkpoint_replays_and_reemits_the_event() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("engine.snapshot");
    let config = ConfigStore::new();
    let now = NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap();

    let mut engine = build_engine();
    engine.restore_and_initialize(&Snapshot::empty(), &config).unwrap();

    let mut total_events_before_crash = 0;
    // Envelopes 100..=104: no events, but each is checkpointed (the first
    // envelope always checkpoints; after that nothing new happens until 105).
    for offset in 100..105 {
        let outcome = engine
            .process_envelope(offset, "acme", &record_for(offset), now)
            .unwrap();
        total_events_before_crash += outcome.events.len();
        if outcome.should_checkpoint {
            engine.checkpoint(&path).unwrap();
        }
    }
    assert_eq!(total_events_before_crash, 0);

    // Envelope 105 emits the sampled event. Simulate a crash: the event is
    // "published" (counted) but the checkpoint write never lands.
    let outcome = engine.process_envelope(105, "acme", &record_for(105), now).unwrap();
    assert_eq!(outcome.events.len(), 1);
    assert!(outcome.should_checkpoint);
    let mut emitted_before_crash = outcome.events.len();
    // No engine.checkpoint(&path) call here: this is the crash.

    // Restart from the last good checkpoint (taken after envelope 104).
    let loaded = Snapshot::load(&path).unwrap();
    assert_eq!(loaded.source_stream_offset, 104);

    let mut restarted = build_engine();
    restarted.restore_and_initialize(&loaded, &config).unwrap();
    assert_eq!(restarted.resume_source_offset(), Some(105));

    let mut emitted_after_restart = 0;
    for offset in 105..=109 {
        let outcome = restarted
            .process_envelope(offset, "acme", &record_for(offset), now)
            .unwrap();
        emitted_after_restart += outcome.events.len();
        if outcome.should_checkpoint {
            restarted.checkpoint(&path).unwrap();
        }
    }

    // 105's event is re-emitted (duplicate, permitted) on top of whatever
    // was counted before the crash.
    assert_eq!(emitted_after_restart, 1);
    emitted_before_crash += emitted_after_restart;
    assert_eq!(emitted_before_crash, 2);

    assert_eq!(restarted.source_stream_offset(), 109);
    let final_snapshot = Snapshot::load(&path).unwrap();
    assert_eq!(final_snapshot.source_stream_offset, 109);
}
