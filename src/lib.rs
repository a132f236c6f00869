//! Shared support for the four process entry points (source, engine,
//! reactor, event tool): the application topology loader (C9), the
//! reference ingest/event stream transports, secret resolution, and
//! tracing bootstrap. Each binary is otherwise a thin CLI wrapper around
//! the library crates under `lib/`.

pub mod app_config;
pub mod secrets;
pub mod telemetry;
pub mod transport;

pub use app_config::{AppConfigError, Topology};
