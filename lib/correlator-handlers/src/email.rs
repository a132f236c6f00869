//! Renders an event's summary (and, when the kind defines one, a richer
//! datatable body) and hands it to an SMTP collaborator. The actual
//! transport is out of scope here; [`Mailer`] is the seam.

use correlator_config::ConfigStore;
use correlator_event::Event;
use correlator_reactor::{Handler, HandlerError, HandlerRegistration, SecretProvider};

inventory::submit! {
    HandlerRegistration {
        id: "email",
        constructor: |name| {
            Box::new(EmailHandler::new(
                name,
                EmailConfig {
                    template_name: "default".to_string(),
                    to: Vec::new(),
                    from: String::new(),
                },
                Box::new(LoggingMailer),
            ))
        },
    }
}

/// The registry default: logs what would have been sent rather than
/// actually delivering it. A deployment that wants real delivery
/// constructs [`EmailHandler`] directly with its own [`Mailer`].
pub struct LoggingMailer;

impl Mailer for LoggingMailer {
    fn send(
        &mut self,
        to: &[String],
        from: &str,
        subject: &str,
        text: &str,
        html: Option<&str>,
    ) -> Result<(), HandlerError> {
        tracing::info!(?to, from, subject, text, html, "e-mail handler (no transport configured)");
        Ok(())
    }
}

/// The SMTP external collaborator. A real implementation wraps an SMTP
/// client; tests use an in-memory recorder.
pub trait Mailer: Send {
    fn send(
        &mut self,
        to: &[String],
        from: &str,
        subject: &str,
        text: &str,
        html: Option<&str>,
    ) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Content-type prefix used to look up this kind's `-subject`, `-text`,
    /// and optional `-html` template variants.
    pub template_name: String,
    pub to: Vec<String>,
    pub from: String,
}

pub struct EmailHandler {
    name: String,
    config: EmailConfig,
    mailer: Box<dyn Mailer>,
}

impl EmailHandler {
    pub fn new(name: impl Into<String>, config: EmailConfig, mailer: Box<dyn Mailer>) -> Self {
        EmailHandler {
            name: name.into(),
            config,
            mailer,
        }
    }
}

impl Handler for EmailHandler {
    fn handler_name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, config: &ConfigStore, _secrets: &dyn SecretProvider) -> Result<(), HandlerError> {
        let prefix = format!("handler.{}", self.name);
        if let Some(name) = config.get(&format!("{prefix}.template_name")).ok().and_then(|v| v.as_str().map(str::to_string)) {
            self.config.template_name = name;
        }
        if let Some(from) = config.get(&format!("{prefix}.from")).ok().and_then(|v| v.as_str().map(str::to_string)) {
            self.config.from = from;
        }
        if let Some(to) = config.get(&format!("{prefix}.to")).ok().and_then(|v| v.as_str().map(str::to_string)) {
            self.config.to = to.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        Ok(())
    }

    fn process_event(&mut self, event: &Event) -> Result<(), HandlerError> {
        let subject_ct = format!("{}-subject", self.config.template_name);
        let text_ct = format!("{}-text", self.config.template_name);
        let html_ct = format!("{}-html", self.config.template_name);

        let subject = if event.kind.has_template(&subject_ct) {
            event.render_summary(Some(&subject_ct))
        } else {
            event.render_summary(None)
        };
        let text = if event.kind.has_template(&text_ct) {
            event.render_summary(Some(&text_ct))
        } else {
            event.render_summary(None)
        };
        let html = event
            .kind
            .has_template(&html_ct)
            .then(|| event.render_datatable(&html_ct));

        self.mailer
            .send(&self.config.to, &self.config.from, &subject, &text, html.as_deref())
    }
}
