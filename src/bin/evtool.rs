//! Event inspector (diagnostic companion to a reactor): a read-only view
//! over the same event stream file the named reactor id subscribes to.
//! `--list`, `--inspect`, and `--watch` are mutually exclusive; the CLI
//! surface carries no `--config_file`, so the topology is always located via
//! `CORRELATOR_CFG`.

use std::path::PathBuf;

use clap::Parser;
use correlator::app_config;
use correlator::telemetry;
use correlator::transport::{EventSource, JsonlStream};
use correlator_event::Event;

#[derive(Parser, Debug)]
#[command(name = "correlator-evtool")]
struct Cli {
    #[arg(long)]
    id: String,
    /// An offset or inclusive range, e.g. `10` or `10-20`.
    #[arg(long)]
    list: Option<String>,
    #[arg(long)]
    inspect: Option<u64>,
    #[arg(long)]
    watch: bool,
    #[arg(long, default_value_t = 20)]
    page: u64,
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
    let mode_count = cli.list.is_some() as u8 + cli.inspect.is_some() as u8 + cli.watch as u8;
    if mode_count != 1 {
        tracing::error!("exactly one of --list, --inspect, or --watch is required");
        return Err(exitcode::USAGE);
    }

    let config_path = std::env::var_os("CORRELATOR_CFG")
        .map(PathBuf::from)
        .ok_or_else(|| {
            tracing::error!("evtool requires CORRELATOR_CFG to locate the topology file");
            exitcode::CONFIG
        })?;
    let topology = app_config::load_topology(&config_path).map_err(|err| {
        tracing::error!(%err, "configuration error");
        exitcode::CONFIG
    })?;
    let store = app_config::build_config_store(&topology).map_err(|err| {
        tracing::error!(%err, "configuration error");
        exitcode::CONFIG
    })?;
    let reactor_section = topology.reactors.get(&cli.id).ok_or_else(|| {
        tracing::error!(id = %cli.id, "unknown reactor id");
        exitcode::CONFIG
    })?;

    let event_path = app_config::event_stream_path(&store, &reactor_section.engine_id);
    let mut events = JsonlStream::new(event_path);

    if let Some(range) = &cli.list {
        let (start, end) = parse_range(range).map_err(|err| {
            tracing::error!(%err, "invalid --list range");
            exitcode::USAGE
        })?;
        return list_range(&mut events, start, end, cli.page);
    }

    if let Some(offset) = cli.inspect {
        return inspect_offset(&mut events, offset);
    }

    watch(&mut events).await
}

fn list_range(events: &mut JsonlStream, start: u64, end: u64, page: u64) -> Result<(), i32> {
    let batch = events.poll(start.checked_sub(1)).map_err(|err| {
        tracing::error!(%err, "failed to read event stream");
        exitcode::IOERR
    })?;

    let mut shown = 0u64;
    for (offset, tenant_id, event) in batch {
        if offset > end {
            break;
        }
        print_summary_line(offset, &tenant_id, &event);
        shown += 1;
        if page > 0 && shown % page == 0 {
            println!("--- page {} ---", shown / page);
        }
    }
    Ok(())
}

fn inspect_offset(events: &mut JsonlStream, offset: u64) -> Result<(), i32> {
    let batch = events.poll(offset.checked_sub(1)).map_err(|err| {
        tracing::error!(%err, "failed to read event stream");
        exitcode::IOERR
    })?;
    let Some((found_offset, tenant_id, event)) = batch.into_iter().find(|(o, _, _)| *o == offset)
    else {
        tracing::error!(offset, "no event at that offset");
        return Err(exitcode::DATAERR);
    };

    println!("offset:    {found_offset}");
    println!("tenant:    {tenant_id}");
    println!("id:        {}", event.id);
    println!("fq_id:     {}", event.fq_id());
    println!("kind:      {}", event.kind.name);
    println!("system:    {}", event.system);
    println!("severity:  {:?}", event.severity);
    println!("timestamp: {}", event.timestamp);
    println!("summary:   {}", event.render_summary(None));
    println!("payload:");
    for (key, value) in &event.payload {
        println!("  {key} = {value:?}");
    }
    Ok(())
}

async fn watch(events: &mut JsonlStream) -> Result<(), i32> {
    let mut after = events.current_offset().ok();
    loop {
        let batch = events.poll(after).map_err(|err| {
            tracing::error!(%err, "failed to read event stream");
            exitcode::IOERR
        })?;
        for (offset, tenant_id, event) in batch {
            print_summary_line(offset, &tenant_id, &event);
            after = Some(offset);
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
}

fn print_summary_line(offset: u64, tenant_id: &str, event: &Event) {
    println!(
        "{offset:>8}  {tenant_id:<16} {:<8?} {:<24} {}",
        event.severity,
        event.kind.name,
        event.render_summary(None)
    );
}

fn parse_range(spec: &str) -> Result<(u64, u64), String> {
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
