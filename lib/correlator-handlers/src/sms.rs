//! Short, one-line alerts via an SMS gateway. Requires an `account_sid`
//! credential resolved at startup, like the original's Twilio client.

use correlator_config::ConfigStore;
use correlator_event::Event;
use correlator_reactor::{CredentialsRequiredSnafu, Handler, HandlerError, HandlerRegistration, SecretProvider};
use snafu::OptionExt;

inventory::submit! {
    HandlerRegistration {
        id: "sms",
        constructor: |name| Box::new(SmsHandler::new(name, String::new(), Box::new(LoggingSmsSender))),
    }
}

/// The SMS gateway external collaborator.
pub trait SmsSender: Send {
    fn send(&mut self, to: &str, body: &str) -> Result<(), HandlerError>;
}

/// The registry default: logs what would have been sent rather than
/// actually delivering it. A deployment that wants real delivery
/// constructs [`SmsHandler`] directly with its own [`SmsSender`].
pub struct LoggingSmsSender;

impl SmsSender for LoggingSmsSender {
    fn send(&mut self, to: &str, body: &str) -> Result<(), HandlerError> {
        tracing::info!(to, body, "sms handler (no transport configured)");
        Ok(())
    }
}

pub struct SmsHandler {
    name: String,
    to: String,
    account_sid: Option<String>,
    sender: Box<dyn SmsSender>,
}

impl SmsHandler {
    pub fn new(name: impl Into<String>, to: impl Into<String>, sender: Box<dyn SmsSender>) -> Self {
        SmsHandler {
            name: name.into(),
            to: to.into(),
            account_sid: None,
            sender,
        }
    }
}

impl Handler for SmsHandler {
    fn handler_name(&self) -> &str {
        &self.name
    }

    fn credentials_req(&self) -> Vec<String> {
        vec!["account_sid".to_string()]
    }

    fn initialize(&mut self, config: &ConfigStore, secrets: &dyn SecretProvider) -> Result<(), HandlerError> {
        if let Some(to) = config
            .get(&format!("handler.{}.to", self.name))
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
        {
            self.to = to;
        }
        self.account_sid = secrets.get(self.handler_name(), "account_sid");
        self.account_sid
            .as_ref()
            .context(CredentialsRequiredSnafu {
                ids: vec!["account_sid".to_string()],
            })?;
        Ok(())
    }

    fn process_event(&mut self, event: &Event) -> Result<(), HandlerError> {
        let body = format!(
            "{} [{} @ {}]",
            event.render_summary(None),
            event.fq_id(),
            event.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
        self.sender.send(&self.to, &body)
    }
}
