//! The correlation engine (C6): per-tenant module fan-out over an ingest
//! stream, checkpointed alongside the stores it drives so that a crash
//! anywhere before a checkpoint simply replays — at-least-once on events,
//! never a skipped envelope.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDateTime;
use correlator_config::ConfigStore;
use correlator_event::{Event, EventKind, EventKindRegistration, EventSeverity, RawFieldValue};
use correlator_module::{EventQueue, EventSink, MinuteClock, Module, ModuleError, TimerKind};
use correlator_syslog::SyslogRecord;
use indexmap::IndexMap;
use snafu::{OptionExt, ResultExt, Snafu};

mod snapshot;

pub use snapshot::{Snapshot, SnapshotError};

#[derive(Debug, Snafu)]
pub enum EngineError {
    #[snafu(display("unknown tenant {tenant_id:?}"))]
    UnknownTenant { tenant_id: String },
    #[snafu(display("module {module:?} failed to initialize: {source}"))]
    ModuleInit { module: String, source: ModuleError },
    #[snafu(display("module {module:?} store failed to restore: {source}"))]
    StoreRestore { module: String, source: ModuleError },
    #[snafu(context(false))]
    Snapshot { source: SnapshotError },
}

/// Engine-level event raised whenever C2 fails to parse a record. Never
/// mutates module state — the record is skipped, not retried.
pub static SIMPLE_ERROR_KIND: EventKind = EventKind {
    name: "engine.simple_error",
    schema: &[
        ("message", "the parser's error message"),
        ("raw_length", "length in bytes of the unparsed record"),
    ],
    summary_template: "parse error: ${message}",
    templates: &[],
    severity_override: Some(EventSeverity::Error),
};
inventory::submit! { EventKindRegistration(&SIMPLE_ERROR_KIND) }

fn simple_error_event(record: &SyslogRecord, now: NaiveDateTime) -> Event {
    let mut payload = IndexMap::new();
    payload.insert(
        "message".to_string(),
        RawFieldValue::from(
            record
                .parse_error
                .clone()
                .unwrap_or_else(|| "unknown parse error".to_string()),
        ),
    );
    payload.insert(
        "raw_length".to_string(),
        RawFieldValue::from(record.raw.len() as i64),
    );
    let mut evt = Event::new(&SIMPLE_ERROR_KIND, now, payload, None, EventSeverity::Error)
        .expect("engine.simple_error payload always matches its own schema");
    evt.system = "engine".to_string();
    evt
}

/// One tenant's ordered module pipeline.
pub struct Tenant {
    pub tenant_id: String,
    pub modules: Vec<Box<dyn Module>>,
}

/// What the caller must do after [`Engine::process_envelope`] returns:
/// publish `events` (in order) to the event stream, then call
/// [`Engine::checkpoint`] if `should_checkpoint` is set. The two steps are
/// kept separate because publishing is fallible I/O the engine itself
/// doesn't perform (§1 scope).
#[derive(Debug)]
pub struct StepOutcome {
    pub events: Vec<Event>,
    pub should_checkpoint: bool,
}

/// What [`Engine::tick`] returns: the same publish-then-checkpoint contract
/// as [`StepOutcome`], except events are tagged by tenant since one tick can
/// span every tenant the engine owns.
pub struct TickOutcome {
    pub events: Vec<(String, Event)>,
    pub should_checkpoint: bool,
}

pub struct Engine {
    tenants: BTreeMap<String, Vec<Box<dyn Module>>>,
    save_store_interval: u64,
    checkpoint_interval_minutes: u64,
    source_stream_offset: u64,
    event_stream_offset: u64,
    envelopes_since_checkpoint: u64,
    minutes_since_checkpoint: u64,
    has_processed_any: bool,
    clock: MinuteClock,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field(
                "tenants",
                &self
                    .tenants
                    .iter()
                    .map(|(id, modules)| (id.clone(), modules.len()))
                    .collect::<Vec<_>>(),
            )
            .field("save_store_interval", &self.save_store_interval)
            .field("checkpoint_interval_minutes", &self.checkpoint_interval_minutes)
            .field("source_stream_offset", &self.source_stream_offset)
            .field("event_stream_offset", &self.event_stream_offset)
            .field("envelopes_since_checkpoint", &self.envelopes_since_checkpoint)
            .field("minutes_since_checkpoint", &self.minutes_since_checkpoint)
            .field("has_processed_any", &self.has_processed_any)
            .field("clock", &self.clock)
            .finish()
    }
}

impl Engine {
    /// `save_store_interval` is in envelopes (§4.6 point 4);
    /// `checkpoint_interval_minutes` is the distinct, minutes-based interval
    /// the timer tick forces a checkpoint on (§4.5 point 3). The two are
    /// kept as separate knobs because they count different things.
    pub fn new(tenants: Vec<Tenant>, save_store_interval: u64, checkpoint_interval_minutes: u64) -> Self {
        Engine {
            tenants: tenants
                .into_iter()
                .map(|t| (t.tenant_id, t.modules))
                .collect(),
            save_store_interval: save_store_interval.max(1),
            checkpoint_interval_minutes: checkpoint_interval_minutes.max(1),
            source_stream_offset: 0,
            event_stream_offset: 0,
            envelopes_since_checkpoint: 0,
            minutes_since_checkpoint: 0,
            has_processed_any: false,
            clock: MinuteClock::new(),
        }
    }

    pub fn source_stream_offset(&self) -> u64 {
        self.source_stream_offset
    }

    pub fn event_stream_offset(&self) -> u64 {
        self.event_stream_offset
    }

    /// The offset to resume ingest-stream consumption from: `source + 1`
    /// once anything has been checkpointed, or `None` ("from end") on a
    /// totally fresh start.
    pub fn resume_source_offset(&self) -> Option<u64> {
        if self.has_processed_any || self.source_stream_offset > 0 {
            Some(self.source_stream_offset + 1)
        } else {
            None
        }
    }

    /// Restores per-module state from a loaded snapshot (or leaves modules
    /// on their fresh stores if absent), then runs `initialize()` and
    /// `post_init_store()` on every module in registration order, per tenant.
    pub fn restore_and_initialize(
        &mut self,
        snapshot: &Snapshot,
        config: &ConfigStore,
    ) -> Result<(), EngineError> {
        self.source_stream_offset = snapshot.source_stream_offset;
        self.event_stream_offset = snapshot.event_stream_offset;
        self.has_processed_any = snapshot.source_stream_offset > 0;

        for (tenant_id, modules) in self.tenants.iter_mut() {
            for module in modules.iter_mut() {
                let fq_name = format!("{tenant_id}.{}", module.module_name());
                match snapshot.stores.get(&fq_name) {
                    Some(bytes) => {
                        module
                            .load_store(bytes)
                            .context(StoreRestoreSnafu { module: fq_name.clone() })?;
                    }
                    None => module.fresh_store(),
                }
                module
                    .initialize(config)
                    .context(ModuleInitSnafu { module: fq_name })?;
                module.post_init_store();
            }
        }
        Ok(())
    }

    /// Runs one envelope through its tenant's module pipeline. A record with
    /// a parse error bypasses every module and is instead reported as a
    /// single `engine.simple_error` event.
    pub fn process_envelope(
        &mut self,
        offset: u64,
        tenant_id: &str,
        record: &SyslogRecord,
        now: NaiveDateTime,
    ) -> Result<StepOutcome, EngineError> {
        let events = if let Some(_err) = &record.parse_error {
            vec![simple_error_event(record, now)]
        } else {
            let modules = self
                .tenants
                .get_mut(tenant_id)
                .context(UnknownTenantSnafu {
                    tenant_id: tenant_id.to_string(),
                })?;
            let mut queue = EventQueue::new();
            for module in modules.iter_mut() {
                module.handle_record(record, &mut queue);
            }
            queue.drain()
        };

        self.source_stream_offset = offset;
        self.envelopes_since_checkpoint += 1;

        let should_checkpoint = !events.is_empty()
            || !self.has_processed_any
            || self.envelopes_since_checkpoint % self.save_store_interval == 0;

        if should_checkpoint {
            self.envelopes_since_checkpoint = 0;
        }
        self.has_processed_any = true;

        Ok(StepOutcome {
            events,
            should_checkpoint,
        })
    }

    /// Drives the module runtime's minute-boundary clock (§4.5). A no-op if
    /// `now` falls in the same wall-clock minute as the last successful
    /// tick. On a new minute, every tenant's modules run `timer_tick` in
    /// registration order over the due kinds; the hour handler is also when
    /// `statistics(reset=false)` is taken, mirroring a periodic stats sample
    /// rather than the one-shot end-of-run sample the module was originally
    /// written for. Forces a checkpoint every `checkpoint_interval_minutes`
    /// ticks, independent of the envelope-count-based interval. Unlike
    /// [`Engine::process_envelope`], a tick can touch every tenant at once,
    /// so each event carries the tenant it came from.
    pub fn tick(&mut self, now: NaiveDateTime) -> TickOutcome {
        let Some(kinds) = self.clock.tick(now) else {
            return TickOutcome {
                events: Vec::new(),
                should_checkpoint: false,
            };
        };

        let mut events = Vec::new();
        for (tenant_id, modules) in self.tenants.iter_mut() {
            let mut queue = EventQueue::new();
            for module in modules.iter_mut() {
                module.timer_tick(&kinds, now, &mut queue);
                if kinds.contains(&TimerKind::Hour) {
                    module.statistics(false, &mut queue);
                }
            }
            events.extend(queue.drain().into_iter().map(|e| (tenant_id.clone(), e)));
        }

        self.minutes_since_checkpoint += 1;
        let should_checkpoint = !events.is_empty()
            || self.minutes_since_checkpoint % self.checkpoint_interval_minutes == 0;
        if should_checkpoint {
            self.minutes_since_checkpoint = 0;
        }

        TickOutcome {
            events,
            should_checkpoint,
        }
    }

    /// Records the event-stream offset the caller published `events` up to.
    /// Must be called (when `events` was non-empty) before [`Engine::checkpoint`]
    /// so the two always advance together.
    pub fn record_event_stream_offset(&mut self, offset: u64) {
        self.event_stream_offset = offset;
    }

    /// Writes the full checkpoint: every module's store plus both offsets,
    /// as a single whole-file snapshot write.
    pub fn checkpoint(&self, path: &Path) -> Result<(), EngineError> {
        let mut stores = BTreeMap::new();
        for (tenant_id, modules) in &self.tenants {
            for module in modules {
                let fq_name = format!("{tenant_id}.{}", module.module_name());
                stores.insert(fq_name, module.save_store());
            }
        }
        let snapshot = Snapshot {
            source_stream_offset: self.source_stream_offset,
            event_stream_offset: self.event_stream_offset,
            stores,
        };
        snapshot.save(path)?;
        Ok(())
    }

    pub fn tenant_ids(&self) -> impl Iterator<Item = &str> {
        self.tenants.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use correlator_config::ConfigStore;
    use correlator_module::{CountOverTime, TimerKind};
    use tempfile::tempdir;

    /// A trivial module used only to exercise engine plumbing: it counts
    /// records and never fails.
    struct CounterModule {
        name: String,
        count: i64,
    }

    impl Module for CounterModule {
        fn module_name(&self) -> &str {
            &self.name
        }

        fn initialize(&mut self, _config: &ConfigStore) -> Result<(), ModuleError> {
            Ok(())
        }

        fn handle_record(&mut self, _record: &SyslogRecord, sink: &mut dyn EventSink) {
            self.count += 1;
            if self.count % 2 == 0 {
                correlator_module::dispatch_event(
                    &self.name,
                    test_event(self.count),
                    sink,
                );
            }
        }

        fn statistics(&mut self, _reset: bool, _sink: &mut dyn EventSink) {}

        fn save_store(&self) -> Vec<u8> {
            serde_json::to_vec(&self.count).unwrap()
        }

        fn load_store(&mut self, bytes: &[u8]) -> Result<(), ModuleError> {
            self.count = serde_json::from_slice(bytes).map_err(|e| ModuleError::StoreDecode {
                message: e.to_string(),
            })?;
            Ok(())
        }

        fn fresh_store(&mut self) {
            self.count = 0;
        }
    }

    static COUNTER_KIND: EventKind = EventKind {
        name: "counter.tick",
        schema: &[("count", "running count")],
        summary_template: "count=${count}",
        templates: &[],
        severity_override: None,
    };

    fn test_event(count: i64) -> Event {
        let mut payload = IndexMap::new();
        payload.insert("count".to_string(), RawFieldValue::from(count));
        Event::new(
            &COUNTER_KIND,
            NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap(),
            payload,
            None,
            EventSeverity::Informational,
        )
        .unwrap()
    }

    fn sample_record() -> SyslogRecord {
        correlator_syslog::parse(b"<34>1 2024-01-01T00:00:00Z host app 1 - - hello")
    }

    fn fresh_engine() -> Engine {
        Engine::new(
            vec![Tenant {
                tenant_id: "acme".to_string(),
                modules: vec![Box::new(CounterModule {
                    name: "counter".to_string(),
                    count: 0,
                })],
            }],
            5,
            15,
        )
    }

    #[test]
    fn first_envelope_always_checkpoints() {
        let mut engine = fresh_engine();
        let now = NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let outcome = engine
            .process_envelope(1, "acme", &sample_record(), now)
            .unwrap();
        assert!(outcome.should_checkpoint);
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn checkpointing_follows_event_emission() {
        let mut engine = fresh_engine();
        let now = NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        engine.process_envelope(1, "acme", &sample_record(), now).unwrap();
        let outcome = engine
            .process_envelope(2, "acme", &sample_record(), now)
            .unwrap();
        assert!(outcome.should_checkpoint);
        assert_eq!(outcome.events.len(), 1);
    }

    #[test]
    fn unknown_tenant_is_reported() {
        let mut engine = fresh_engine();
        let now = NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let err = engine
            .process_envelope(1, "globex", &sample_record(), now)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownTenant { .. }));
    }

    #[test]
    fn parse_error_bypasses_modules_and_emits_simple_error() {
        let mut engine = fresh_engine();
        let bad = correlator_syslog::parse(b"not a syslog record");
        let now = NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let outcome = engine.process_envelope(1, "acme", &bad, now).unwrap();
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].kind.name, "engine.simple_error");
    }

    #[test]
    fn checkpoint_round_trip_restores_module_state_and_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.snapshot");
        let config = ConfigStore::new();
        let now = NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap();

        let mut engine = fresh_engine();
        engine.restore_and_initialize(&Snapshot::empty(), &config).unwrap();
        // offset 1: first envelope, always checkpoints. offset 2: counter
        // goes even and a module event is emitted, which also checkpoints.
        for offset in 1..=2 {
            let outcome = engine
                .process_envelope(offset, "acme", &sample_record(), now)
                .unwrap();
            assert!(outcome.should_checkpoint);
            engine.checkpoint(&path).unwrap();
        }
        assert_eq!(engine.source_stream_offset(), 2);

        let loaded = Snapshot::load(&path).unwrap();
        let mut restarted = fresh_engine();
        restarted.restore_and_initialize(&loaded, &config).unwrap();
        assert_eq!(restarted.source_stream_offset(), 2);
        assert_eq!(restarted.resume_source_offset(), Some(3));
    }

    #[test]
    fn fresh_engine_resumes_from_end_when_nothing_checkpointed() {
        let engine = fresh_engine();
        assert_eq!(engine.resume_source_offset(), None);
    }

    #[test]
    fn count_over_time_and_timer_kind_are_reexported_for_modules() {
        let mut cot = CountOverTime::new(60);
        let now = NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(cot.record("x", now), 1);
        assert!(TimerKind::Minute.is_due(now));
    }

    static TICK_KIND: EventKind = EventKind {
        name: "ticking.sample",
        schema: &[],
        summary_template: "tick",
        templates: &[],
        severity_override: None,
    };

    /// Counts every `timer_tick` call and every `statistics` call it
    /// receives, and emits one event from each so the engine's dispatch can
    /// be observed through its output rather than through module internals.
    struct TickingModule {
        ticks: u32,
        stats: u32,
    }

    impl Module for TickingModule {
        fn module_name(&self) -> &str {
            "ticking"
        }

        fn initialize(&mut self, _config: &ConfigStore) -> Result<(), ModuleError> {
            Ok(())
        }

        fn handle_record(&mut self, _record: &SyslogRecord, _sink: &mut dyn EventSink) {}

        fn statistics(&mut self, _reset: bool, sink: &mut dyn EventSink) {
            self.stats += 1;
            correlator_module::dispatch_event(
                "ticking",
                Event::new(
                    &TICK_KIND,
                    NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap(),
                    IndexMap::new(),
                    None,
                    EventSeverity::Informational,
                )
                .unwrap(),
                sink,
            );
        }

        fn timer_tick(&mut self, _kinds: &[TimerKind], _now: NaiveDateTime, sink: &mut dyn EventSink) {
            self.ticks += 1;
            correlator_module::dispatch_event(
                "ticking",
                Event::new(
                    &TICK_KIND,
                    NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap(),
                    IndexMap::new(),
                    None,
                    EventSeverity::Informational,
                )
                .unwrap(),
                sink,
            );
        }

        fn save_store(&self) -> Vec<u8> {
            Vec::new()
        }

        fn load_store(&mut self, _bytes: &[u8]) -> Result<(), ModuleError> {
            Ok(())
        }

        fn fresh_store(&mut self) {}
    }

    fn ticking_engine(checkpoint_interval_minutes: u64) -> Engine {
        Engine::new(
            vec![Tenant {
                tenant_id: "acme".to_string(),
                modules: vec![Box::new(TickingModule { ticks: 0, stats: 0 })],
            }],
            100,
            checkpoint_interval_minutes,
        )
    }

    #[test]
    fn tick_dispatches_timer_handler_every_new_minute_and_statistics_on_the_hour() {
        let mut engine = ticking_engine(15);
        let on_the_hour = NaiveDateTime::parse_from_str("2024-01-01 11:00:00", "%Y-%m-%d %H:%M:%S").unwrap();

        let outcome = engine.tick(on_the_hour);
        // one event from timer_tick, one from statistics (hour boundary).
        assert_eq!(outcome.events.len(), 2);

        let off_the_hour = NaiveDateTime::parse_from_str("2024-01-01 11:07:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let outcome = engine.tick(off_the_hour);
        assert_eq!(outcome.events.len(), 1);
    }

    #[test]
    fn tick_is_a_no_op_within_the_same_minute() {
        let mut engine = ticking_engine(15);
        let now = NaiveDateTime::parse_from_str("2024-01-01 11:03:30", "%Y-%m-%d %H:%M:%S").unwrap();
        let first = engine.tick(now);
        assert!(!first.events.is_empty());

        let still_that_minute = NaiveDateTime::parse_from_str("2024-01-01 11:03:59", "%Y-%m-%d %H:%M:%S").unwrap();
        let second = engine.tick(still_that_minute);
        assert!(second.events.is_empty());
        assert!(!second.should_checkpoint);
    }

    /// Unlike [`TickingModule`], emits nothing from either handler, so a
    /// test can observe the minutes-based forced checkpoint in isolation
    /// from the "events always force a checkpoint" rule.
    struct SilentModule;

    impl Module for SilentModule {
        fn module_name(&self) -> &str {
            "silent"
        }

        fn initialize(&mut self, _config: &ConfigStore) -> Result<(), ModuleError> {
            Ok(())
        }

        fn handle_record(&mut self, _record: &SyslogRecord, _sink: &mut dyn EventSink) {}
        fn statistics(&mut self, _reset: bool, _sink: &mut dyn EventSink) {}
        fn save_store(&self) -> Vec<u8> {
            Vec::new()
        }
        fn load_store(&mut self, _bytes: &[u8]) -> Result<(), ModuleError> {
            Ok(())
        }
        fn fresh_store(&mut self) {}
    }

    #[test]
    fn tick_forces_a_checkpoint_every_checkpoint_interval_minutes() {
        let mut engine = Engine::new(
            vec![Tenant {
                tenant_id: "acme".to_string(),
                modules: vec![Box::new(SilentModule)],
            }],
            100,
            3,
        );
        let start = NaiveDateTime::parse_from_str("2024-01-01 11:01:00", "%Y-%m-%d %H:%M:%S").unwrap();

        let first = engine.tick(start);
        assert!(first.events.is_empty());
        assert!(!first.should_checkpoint);
        let second = engine.tick(start + chrono::Duration::minutes(1));
        assert!(!second.should_checkpoint);
        let third = engine.tick(start + chrono::Duration::minutes(2));
        assert!(third.should_checkpoint);
    }
}
