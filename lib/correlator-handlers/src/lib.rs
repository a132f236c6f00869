//! Reference handlers (C8): the terminal consumers a reactor can route
//! events to. Each one implements [`correlator_reactor::Handler`]; none of
//! them know about tenants, filters, or offsets, which stay the reactor's
//! concern.

mod csv;
mod email;
mod log;
mod sms;

pub use csv::{CsvConfig, CsvHandler};
pub use email::{EmailConfig, EmailHandler, Mailer};
pub use log::LogHandler;
pub use sms::{SmsHandler, SmsSender};
