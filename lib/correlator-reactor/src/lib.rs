//! The reactor (C7): fans events out to per-tenant handler lists, using the
//! filter evaluator to decide which handlers see which events, and tracks
//! delivery offsets so a restart never redelivers an event it already
//! stored an offset past.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use correlator_config::ConfigStore;
use correlator_event::Event;
use snafu::{OptionExt, ResultExt, Snafu};

mod filter;
mod offsets;

pub use filter::{evaluate as evaluate_filter, FilterError};
pub use offsets::{InMemoryOffsetStore, JsonFileOffsetStore, OffsetStore};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum HandlerError {
    #[snafu(display("missing required credential(s): {ids:?}"))]
    CredentialsRequired { ids: Vec<String> },
    #[snafu(display("{message}"))]
    SimpleException { message: String },
}

/// The keyring external collaborator (§1 scope): resolves a credential id
/// owned by `owner` (typically a handler name) to its secret value.
pub trait SecretProvider: Send + Sync {
    fn get(&self, owner: &str, id: &str) -> Option<String>;
}

/// A provider with no secrets, for handlers and tests that need none.
pub struct NoSecrets;
impl SecretProvider for NoSecrets {
    fn get(&self, _owner: &str, _id: &str) -> Option<String> {
        None
    }
}

/// The terminal consumer of an event: log line, CSV row, e-mail, SMS, ...
pub trait Handler: Send {
    fn handler_name(&self) -> &str;

    /// Called once at startup, after `credentials_req()` has been checked,
    /// with the bound configuration store (handlers read their own options
    /// under `handler.<handler_name>.*`, mirroring [`correlator_module::Module::initialize`])
    /// and the resolved secret provider (`secrets.get(self.handler_name(), id)`).
    fn initialize(&mut self, config: &ConfigStore, secrets: &dyn SecretProvider) -> Result<(), HandlerError> {
        let _ = (config, secrets);
        Ok(())
    }

    fn process_event(&mut self, event: &Event) -> Result<(), HandlerError>;

    /// Credential ids this handler needs before it can run. Checked the same
    /// way module initialization is (§4.5): if any are missing, startup logs
    /// each `owner.id` and exits rather than running degraded.
    fn credentials_req(&self) -> Vec<String> {
        Vec::new()
    }
}

/// One configured handler slot: the handler itself, its compiled filter
/// expression (empty means "no filter"), and what to do when there is none.
pub struct HandlerSlot {
    pub handler: Box<dyn Handler>,
    pub filter_expr: Option<String>,
    pub default_action: bool,
}

#[derive(Debug, Snafu)]
pub enum ReactorError {
    #[snafu(display("unknown tenant {tenant_id:?}"))]
    UnknownTenant { tenant_id: String },
    #[snafu(display("handler {handler:?} failed: {source}"))]
    Handler {
        handler: String,
        source: HandlerError,
    },
}

/// Compile-time replacement for the original's reflective `(python_module,
/// class_name)` handler lookup, mirroring [`correlator_module::ModuleRegistration`].
pub struct HandlerRegistration {
    pub id: &'static str,
    pub constructor: fn(handler_name: String) -> Box<dyn Handler>,
}
inventory::collect!(HandlerRegistration);

pub fn lookup_handler_constructor(id: &str) -> Option<fn(String) -> Box<dyn Handler>> {
    for reg in inventory::iter::<HandlerRegistration> {
        if reg.id == id {
            return Some(reg.constructor);
        }
    }
    None
}

pub struct Reactor {
    tenants: BTreeMap<String, Vec<HandlerSlot>>,
}

impl Reactor {
    pub fn new(tenants: BTreeMap<String, Vec<HandlerSlot>>) -> Self {
        Reactor { tenants }
    }

    /// Dispatches one event to every handler in `tenant_id`'s list whose
    /// filter selects it (or that has no filter and a true
    /// `default_action`), in registration order. Any rendering error is
    /// logged and treated as "does not select".
    pub fn dispatch(&mut self, tenant_id: &str, event: &Event) -> Result<Vec<String>, ReactorError> {
        let handlers = self
            .tenants
            .get_mut(tenant_id)
            .context(UnknownTenantSnafu {
                tenant_id: tenant_id.to_string(),
            })?;

        let mut invoked = Vec::new();
        for slot in handlers.iter_mut() {
            let selected = match &slot.filter_expr {
                Some(expr) => match filter::evaluate(expr, event) {
                    Ok(matched) => matched,
                    Err(error) => {
                        tracing::warn!(
                            handler = slot.handler.handler_name(),
                            %error,
                            "filter evaluation failed; skipping handler"
                        );
                        false
                    }
                },
                None => slot.default_action,
            };

            if !selected {
                continue;
            }

            slot.handler
                .process_event(event)
                .context(HandlerSnafu {
                    handler: slot.handler.handler_name().to_string(),
                })?;
            invoked.push(slot.handler.handler_name().to_string());
        }
        Ok(invoked)
    }

    pub fn tenant_ids(&self) -> impl Iterator<Item = &str> {
        self.tenants.keys().map(String::as_str)
    }
}

/// Where a reactor identified by `subscriber_name` should resume: the
/// stored offset plus one, or `None` ("from end") for a reactor that has
/// never stored an offset — fresh reactors do not replay history.
pub fn resume_offset(offsets: &dyn OffsetStore, subscriber_name: &str) -> Option<u64> {
    offsets.load(subscriber_name).map(|o| o + 1)
}

/// Whether `offset` falls within an inclusive `--rerun A[-B]` range.
pub fn in_rerun_range(offset: u64, range: (u64, u64)) -> bool {
    offset >= range.0 && offset <= range.1
}

pub fn default_offset_path(base_dir: &Path, subscriber_name: &str) -> PathBuf {
    base_dir.join(format!("{subscriber_name}.offset.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use correlator_event::{EventKind, EventSeverity, RawFieldValue};
    use indexmap::IndexMap;
    use std::sync::Mutex;

    static DEMO_KIND: EventKind = EventKind {
        name: "demo.widget",
        schema: &[],
        summary_template: "",
        templates: &[],
        severity_override: None,
    };

    fn event(severity: EventSeverity) -> Event {
        Event::new(
            &DEMO_KIND,
            NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap(),
            IndexMap::new(),
            None,
            severity,
        )
        .unwrap()
    }

    struct RecordingHandler {
        name: String,
        received: std::sync::Arc<Mutex<Vec<EventSeverity>>>,
    }

    impl Handler for RecordingHandler {
        fn handler_name(&self) -> &str {
            &self.name
        }

        fn process_event(&mut self, event: &Event) -> Result<(), HandlerError> {
            self.received.lock().unwrap().push(event.severity);
            Ok(())
        }
    }

    #[test]
    fn filter_routing_sends_error_only_to_filtered_handler() {
        let a_log = std::sync::Arc::new(Mutex::new(Vec::new()));
        let b_log = std::sync::Arc::new(Mutex::new(Vec::new()));

        let mut tenants = BTreeMap::new();
        tenants.insert(
            "acme".to_string(),
            vec![
                HandlerSlot {
                    handler: Box::new(RecordingHandler {
                        name: "a".to_string(),
                        received: a_log.clone(),
                    }),
                    filter_expr: Some("event.severity == EventSeverity.Error".to_string()),
                    default_action: false,
                },
                HandlerSlot {
                    handler: Box::new(RecordingHandler {
                        name: "b".to_string(),
                        received: b_log.clone(),
                    }),
                    filter_expr: None,
                    default_action: false,
                },
            ],
        );
        let mut reactor = Reactor::new(tenants);

        reactor
            .dispatch("acme", &event(EventSeverity::Informational))
            .unwrap();
        reactor.dispatch("acme", &event(EventSeverity::Error)).unwrap();

        assert_eq!(a_log.lock().unwrap().as_slice(), &[EventSeverity::Error]);
        assert!(b_log.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_tenant_is_reported() {
        let mut reactor = Reactor::new(BTreeMap::new());
        let err = reactor.dispatch("nope", &event(EventSeverity::Informational)).unwrap_err();
        assert!(matches!(err, ReactorError::UnknownTenant { .. }));
    }

    #[test]
    fn resume_offset_is_none_for_a_reactor_that_never_stored() {
        let store = InMemoryOffsetStore::default();
        assert_eq!(resume_offset(&store, "sub"), None);
    }

    #[test]
    fn resume_offset_follows_last_stored_plus_one() {
        let mut store = InMemoryOffsetStore::default();
        store.store("sub", 41);
        assert_eq!(resume_offset(&store, "sub"), Some(42));
    }
}
