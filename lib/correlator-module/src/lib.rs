//! The module programming model (C5): lifecycle, per-module store, scheduled
//! timers, and event dispatch. Modules reference only an [`EventSink`] to
//! emit events and never the engine itself, and the engine references only
//! the [`Module`] trait object to feed records in — the two interfaces this
//! crate exports are the entire interface between the engine and its
//! modules, by construction rather than by convention.

use chrono::{NaiveDateTime, Timelike};
use correlator_config::ConfigStore;
use correlator_event::Event;
use correlator_syslog::SyslogRecord;
use snafu::Snafu;

mod count_over_time;
mod timer;

pub use count_over_time::CountOverTime;
pub use timer::{due_kinds, MinuteClock, TimerKind};

#[derive(Debug, Snafu)]
pub enum ModuleError {
    #[snafu(display("configuration error: {source}"))]
    Config {
        source: correlator_config::ConfigError,
    },
    #[snafu(display("missing required credential(s): {ids:?}"))]
    CredentialsRequired { ids: Vec<String> },
    #[snafu(display("{message}"))]
    SimpleException { message: String },
    #[snafu(display("store failed to decode: {message}"))]
    StoreDecode { message: String },
}

/// The only channel a module has to the outside world: hand it finished
/// events, one at a time, in dispatch order.
pub trait EventSink {
    fn dispatch(&mut self, event: Event);
}

/// An in-memory [`EventSink`] used by the engine to buffer the events a
/// single `handle_record` call produced before they're flushed to the event
/// stream, and by tests that just want to inspect what a module emitted.
#[derive(Default)]
pub struct EventQueue(Vec<Event>);

impl EventSink for EventQueue {
    fn dispatch(&mut self, event: Event) {
        self.0.push(event);
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Sets `event.system` to the dispatching module's name before handing it to
/// the sink — the one piece of bookkeeping every module would otherwise have
/// to repeat by hand.
pub fn dispatch_event(module_name: &str, mut event: Event, sink: &mut dyn EventSink) {
    event.system = module_name.to_string();
    sink.dispatch(event);
}

/// A pluggable correlator. Object-safe by design — `Box<dyn Module>` is how
/// the engine holds a tenant's module list, each built from its own
/// concrete store type but exposed through this single interface. Store
/// state crosses the boundary only as bytes: see [`Module::save_store`] /
/// [`Module::load_store`].
pub trait Module: Send {
    fn module_name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Called once after configuration is bound. May fail with a
    /// [`ModuleError::Config`] or [`ModuleError::CredentialsRequired`].
    fn initialize(&mut self, config: &ConfigStore) -> Result<(), ModuleError>;

    /// Called once after the store has been bound, fresh or restored.
    fn post_init_store(&mut self) {}

    /// The only entry point during normal operation.
    fn handle_record(&mut self, record: &SyslogRecord, sink: &mut dyn EventSink);

    /// Emits a `*Stats` event; when `reset` is set, zeroes the module's
    /// running counters afterward.
    fn statistics(&mut self, reset: bool, sink: &mut dyn EventSink);

    /// Invoked once per elapsed wall-clock minute with the set of coarser
    /// boundaries (`5m`/`10m`/.../`hour`) also due this tick. Modules that
    /// want a specific hour-and-minute handler (e.g. midnight) check
    /// `now.hour()`/`now.minute()` themselves.
    fn timer_tick(&mut self, _kinds: &[TimerKind], _now: NaiveDateTime, _sink: &mut dyn EventSink) {
    }

    /// Encodes the module's store for checkpointing.
    fn save_store(&self) -> Vec<u8>;

    /// Restores the module's store from a previous checkpoint.
    fn load_store(&mut self, bytes: &[u8]) -> Result<(), ModuleError>;

    /// Resets to a fresh store (no prior checkpoint existed for this
    /// module).
    fn fresh_store(&mut self);
}

/// Compile-time replacement for the original's reflective `(module_path,
/// class_name)` lookup: every module crate submits one of these, and the
/// application config loader resolves `module: [path, class]` entries
/// against this registry by id instead of importing anything dynamically.
pub struct ModuleRegistration {
    pub id: &'static str,
    pub constructor: fn(module_name: String) -> Box<dyn Module>,
}
inventory::collect!(ModuleRegistration);

pub fn lookup_module_constructor(id: &str) -> Option<fn(String) -> Box<dyn Module>> {
    for reg in inventory::iter::<ModuleRegistration> {
        if reg.id == id {
            return Some(reg.constructor);
        }
    }
    None
}

/// Truncates `now` to the start of its minute, the unit the timer machinery
/// reasons in.
pub fn truncate_to_minute(now: NaiveDateTime) -> NaiveDateTime {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use correlator_event::{EventKind, EventSeverity};
    use indexmap::IndexMap;

    static DEMO_KIND: EventKind = EventKind {
        name: "demo.tick",
        schema: &[],
        summary_template: "",
        templates: &[],
        severity_override: None,
    };

    #[test]
    fn dispatch_event_stamps_module_name() {
        let evt = Event::new(
            &DEMO_KIND,
            NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap(),
            IndexMap::new(),
            None,
            EventSeverity::Informational,
        )
        .unwrap();
        let mut queue = EventQueue::new();
        dispatch_event("sshd", evt, &mut queue);
        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].system, "sshd");
    }
}
