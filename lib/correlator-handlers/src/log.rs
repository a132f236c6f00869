//! The simplest handler: one log line per event, at the event's own
//! severity, carrying its fully-qualified id and rendered summary.

use correlator_event::{Event, EventSeverity};
use correlator_reactor::{Handler, HandlerError, HandlerRegistration};

inventory::submit! {
    HandlerRegistration {
        id: "log",
        constructor: |name| Box::new(LogHandler::new(name)),
    }
}

pub struct LogHandler {
    name: String,
}

impl LogHandler {
    pub fn new(name: impl Into<String>) -> Self {
        LogHandler { name: name.into() }
    }
}

impl Handler for LogHandler {
    fn handler_name(&self) -> &str {
        &self.name
    }

    fn process_event(&mut self, event: &Event) -> Result<(), HandlerError> {
        let summary = event.render_summary(None);
        let fq_id = event.fq_id();
        match event.severity {
            EventSeverity::Error => tracing::error!(fq_id = %fq_id, "{summary}"),
            EventSeverity::Warning => tracing::warn!(fq_id = %fq_id, "{summary}"),
            EventSeverity::Informational => tracing::info!(fq_id = %fq_id, "{summary}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use correlator_event::EventKind;
    use indexmap::IndexMap;

    static DEMO_KIND: EventKind = EventKind {
        name: "demo.widget",
        schema: &[],
        summary_template: "a thing happened",
        templates: &[],
        severity_override: None,
    };

    #[test]
    fn logs_without_error() {
        let event = Event::new(
            &DEMO_KIND,
            NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap(),
            IndexMap::new(),
            None,
            EventSeverity::Warning,
        )
        .unwrap();
        let mut handler = LogHandler::new("log");
        assert!(handler.process_event(&event).is_ok());
    }
}
