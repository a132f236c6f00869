//! Reactor process (C7): consumes an engine's event stream and fans each
//! event out to its tenant's handlers. Normal mode stores its delivered
//! offset after every dispatch so a restart resumes exactly where it left
//! off; `--rerun A[-B]` replays a bounded range instead, and never touches
//! the stored offset.

use std::path::PathBuf;

use clap::Parser;
use correlator::app_config::{self, AppConfigError};
use correlator::secrets::{CryptfileSecretProvider, EnvSecretProvider};
use correlator::telemetry;
use correlator::transport::{EventSource, JsonlStream};
use correlator_reactor::{resume_offset, in_rerun_range, JsonFileOffsetStore, OffsetStore, Reactor, SecretProvider};

#[derive(Parser, Debug)]
#[command(name = "correlator-reactor")]
struct Cli {
    #[arg(long)]
    id: String,
    #[arg(long)]
    config_file: PathBuf,
    /// Replay a bounded offset range (`A` or `A-B`) instead of running live.
    #[arg(long)]
    rerun: Option<String>,
    /// `path=value`, repeatable, applied after the topology file.
    #[arg(long = "option")]
    options: Vec<String>,
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
    let rerun_range = match &cli.rerun {
        Some(spec) => Some(parse_rerun_range(spec).map_err(|err| {
            tracing::error!(%err, "invalid --rerun range");
            exitcode::USAGE
        })?),
        None => None,
    };

    let config_path = app_config::resolve_config_path(cli.config_file);
    let topology = app_config::load_topology(&config_path).map_err(report_config_error)?;
    let mut store = app_config::build_config_store(&topology).map_err(report_config_error)?;

    for option in &cli.options {
        let (key, value) = option.split_once('=').ok_or(exitcode::USAGE).map_err(|code| {
            tracing::error!(option = %option, "--option must be key=value");
            code
        })?;
        app_config::apply_cmdline_override(&mut store, key, value).map_err(report_config_error)?;
    }

    let secrets: Box<dyn SecretProvider> =
        match std::env::var_os(CryptfileSecretProvider::PASSWORD_ENV) {
            Some(_) => {
                let path = PathBuf::from(app_config::get_str_or(
                    &store,
                    "system.keyring_cryptfile_path",
                    "keyring.json",
                ));
                Box::new(CryptfileSecretProvider::load(&path).map_err(|err| {
                    tracing::error!(%err, "failed to unlock cryptfile keyring");
                    exitcode::CONFIG
                })?)
            }
            None => Box::new(EnvSecretProvider),
        };

    let (mut reactor, engine_id) =
        app_config::build_reactor(&topology, &cli.id, &mut store, secrets.as_ref())
            .map_err(report_config_error)?;

    let event_path = app_config::event_stream_path(&store, &engine_id);
    let mut events = JsonlStream::new(event_path);

    let run_dir = PathBuf::from(app_config::get_str_or(&store, "system.run_dir", "."));
    let mut offsets = JsonFileOffsetStore::new(run_dir);

    match rerun_range {
        Some(range) => run_rerun(&mut reactor, &mut events, &cli.id, range),
        None => run_live(&mut reactor, &mut events, &mut offsets, &cli.id).await,
    }
}

fn run_rerun(
    reactor: &mut Reactor,
    events: &mut JsonlStream,
    reactor_id: &str,
    range: (u64, u64),
) -> Result<(), i32> {
    let batch = events.poll(range.0.checked_sub(1)).map_err(|err| {
        tracing::error!(%err, "failed to poll event stream for rerun");
        exitcode::IOERR
    })?;
    for (offset, tenant_id, event) in batch {
        if !in_rerun_range(offset, range) {
            break;
        }
        dispatch_one(reactor, reactor_id, &tenant_id, offset, &event)?;
    }
    Ok(())
}

async fn run_live(
    reactor: &mut Reactor,
    events: &mut JsonlStream,
    offsets: &mut JsonFileOffsetStore,
    reactor_id: &str,
) -> Result<(), i32> {
    let mut after = resume_offset(&*offsets, reactor_id);
    loop {
        let batch = events.poll(after).map_err(|err| {
            tracing::error!(%err, "failed to poll event stream");
            exitcode::IOERR
        })?;
        if batch.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            continue;
        }
        for (offset, tenant_id, event) in batch {
            dispatch_one(reactor, reactor_id, &tenant_id, offset, &event)?;
            offsets.store(reactor_id, offset);
            after = Some(offset);
        }
    }
}

fn dispatch_one(
    reactor: &mut Reactor,
    reactor_id: &str,
    tenant_id: &str,
    offset: u64,
    event: &correlator_event::Event,
) -> Result<(), i32> {
    reactor.dispatch(tenant_id, event).map_err(|err| {
        tracing::error!(reactor = reactor_id, offset, %err, "reactor failed to dispatch event");
        exitcode::SOFTWARE
    })?;
    Ok(())
}

fn parse_rerun_range(spec: &str) -> Result<(u64, u64), String> {
    match spec.split_once('-') {
        Some((start, end)) => {
            let start: u64 = start.parse().map_err(|_| format!("bad start in {spec:?}"))?;
            let end: u64 = end.parse().map_err(|_| format!("bad end in {spec:?}"))?;
            Ok((start, end))
        }
        None => {
            let point: u64 = spec.parse().map_err(|_| format!("bad offset in {spec:?}"))?;
            Ok((point, point))
        }
    }
}

fn report_config_error(err: AppConfigError) -> i32 {
    tracing::error!(%err, "configuration error");
    exitcode::CONFIG
}
