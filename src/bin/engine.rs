//! Correlation engine process (C6): polls an ingest stream, runs each
//! envelope through its tenant's module pipeline, publishes the resulting
//! events, and checkpoints on the engine's own schedule.
//!
//! A module that panics out of `handle_record` is treated as the fatal
//! condition the original reserves for a module raising out of
//! `process_record`: state may now be inconsistent, so the process logs and
//! exits rather than continuing. `Module::handle_record` is synchronous and
//! infallible by signature (it returns nothing, not a `Result`), so
//! `catch_unwind` is the only way to observe that failure in Rust.

use std::path::PathBuf;

use clap::Parser;
use correlator::app_config::{self, AppConfigError};
use correlator::telemetry;
use correlator::transport::{EventTransport, IngestSource, JsonlStream, RecordType};
use correlator_engine::{Engine, EngineError, Snapshot};
use correlator_event::Event;

#[derive(Parser, Debug)]
#[command(name = "correlator-engine")]
struct Cli {
    #[arg(long)]
    id: String,
    #[arg(long)]
    config_file: PathBuf,
    /// Discard the prior checkpoint and every module store, starting fresh.
    #[arg(long)]
    reset: bool,
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    telemetry::init(cli.debug);

    if let Err(code) = run(cli).await {
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<(), i32> {
    let config_path = app_config::resolve_config_path(cli.config_file);
    let topology = app_config::load_topology(&config_path).map_err(report_config_error)?;
    let mut store = app_config::build_config_store(&topology).map_err(report_config_error)?;
    let (mut engine, _save_interval) =
        app_config::build_engine(&topology, &cli.id, &mut store).map_err(report_config_error)?;

    let snapshot_path = app_config::engine_snapshot_path(&store, &cli.id);
    if cli.reset && snapshot_path.exists() {
        tracing::info!(path = %snapshot_path.display(), "resetting engine snapshot");
        std::fs::remove_file(&snapshot_path).map_err(|err| {
            tracing::error!(%err, "failed to remove snapshot for --reset");
            exitcode::IOERR
        })?;
    }

    let snapshot = if cli.reset {
        Snapshot::empty()
    } else {
        Snapshot::load(&snapshot_path).map_err(|err| {
            tracing::error!(%err, "failed to load snapshot");
            exitcode::IOERR
        })?
    };
    engine
        .restore_and_initialize(&snapshot, &store)
        .map_err(report_engine_error)?;

    // This reference topology keeps a 1:1 source-to-engine naming
    // convention, so the engine id doubles as the ingest stream's source id.
    let ingest_path = app_config::ingest_stream_path(&store, &cli.id);
    let event_path = app_config::event_stream_path(&store, &cli.id);

    let mut ingest = JsonlStream::new(ingest_path);
    let mut events = JsonlStream::new(event_path);

    let mut after = engine.resume_source_offset();
    loop {
        // Timer ticks run once per loop pass regardless of whether any
        // envelope is waiting, so a quiet source still gets its hourly
        // sweeps and minutes-based forced checkpoints (§4.5).
        let now = chrono::Utc::now().naive_utc();
        let tick = engine.tick(now);
        let tick_events: Vec<(&str, &Event)> =
            tick.events.iter().map(|(t, e)| (t.as_str(), e)).collect();
        publish_and_checkpoint(
            &mut engine,
            &mut events,
            &snapshot_path,
            tick_events,
            tick.should_checkpoint,
        )?;

        let batch = ingest.poll(after).map_err(|err| {
            tracing::error!(%err, "failed to poll ingest stream");
            exitcode::IOERR
        })?;
        if batch.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            continue;
        }

        for (offset, envelope) in batch {
            after = Some(offset);
            if envelope.record_type == RecordType::Heartbeat {
                continue;
            }
            let record = correlator_syslog::parse(&envelope.payload);
            let now = chrono::Utc::now().naive_utc();

            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                engine.process_envelope(offset, &envelope.tenant_id, &record, now)
            }));

            let outcome = match outcome {
                Ok(result) => result.map_err(report_engine_error)?,
                Err(panic) => {
                    let message = panic_message(&panic);
                    tracing::error!(tenant = %envelope.tenant_id, offset, %message, "module panicked handling a record; stopping");
                    return Err(exitcode::SOFTWARE);
                }
            };

            let envelope_events: Vec<(&str, &Event)> = outcome
                .events
                .iter()
                .map(|e| (envelope.tenant_id.as_str(), e))
                .collect();
            publish_and_checkpoint(
                &mut engine,
                &mut events,
                &snapshot_path,
                envelope_events,
                outcome.should_checkpoint,
            )?;
        }
    }
}

/// Publishes every `(tenant, event)` pair in order, advances the engine's
/// event-stream offset to match, then checkpoints if asked to. Events and
/// the checkpoint they gate always travel together — see
/// [`correlator_engine::Engine::process_envelope`]'s doc comment.
fn publish_and_checkpoint(
    engine: &mut Engine,
    events: &mut JsonlStream,
    snapshot_path: &std::path::Path,
    tagged_events: Vec<(&str, &Event)>,
    should_checkpoint: bool,
) -> Result<(), i32> {
    let mut last_event_offset = engine.event_stream_offset();
    for (tenant_id, event) in &tagged_events {
        last_event_offset = events.publish(*tenant_id, *event).map_err(|err| {
            tracing::error!(%err, "failed to publish event");
            exitcode::IOERR
        })?;
    }
    if !tagged_events.is_empty() {
        engine.record_event_stream_offset(last_event_offset);
    }

    if should_checkpoint {
        engine.checkpoint(snapshot_path).map_err(|err| {
            tracing::error!(%err, "failed to write checkpoint");
            exitcode::IOERR
        })?;
    }
    Ok(())
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn report_config_error(err: AppConfigError) -> i32 {
    tracing::error!(%err, "configuration error");
    exitcode::CONFIG
}

fn report_engine_error(err: EngineError) -> i32 {
    tracing::error!(%err, "engine error");
    exitcode::SOFTWARE
}
