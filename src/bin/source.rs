//! Source connector process (C3): a single-connection TCP server that
//! reframes a byte stream by a discovered or configured trailer and forwards
//! each frame to the ingest stream as a `SYSLOG_DATA` envelope, emitting a
//! `HEARTBEAT` on every idle accept or read timeout. Grounded on
//! `original_source/Correlator/syslog.py`'s `listen_single`/`_handle_records`.
//!
//! Parsing (C2) and the resulting `SimpleError` event for an unparseable
//! block are not performed here: the original fuses source and engine into
//! one process, but splitting them into separate binaries (per the external
//! interfaces) means exactly one of the two should own `correlator_syslog::parse`,
//! and the engine already does (see `correlator-engine::SIMPLE_ERROR_KIND`).
//! Owning it there keeps each record parsed exactly once.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use clap::Parser;
use correlator::app_config::{self, AppConfigError};
use correlator::telemetry;
use correlator::transport::{IngestTransport, JsonlStream, RecordType, WireEnvelope};
use correlator_syslog::{discover_trailer, DiscoveryFn};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

#[derive(Parser, Debug)]
#[command(name = "correlator-source")]
struct Cli {
    #[arg(long)]
    id: String,
    #[arg(long)]
    config_file: std::path::PathBuf,
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
    let section = app_config::find_source(&topology, &cli.id).map_err(report_config_error)?;
    app_config::apply_config_map(&mut store, "sources", Some(&cli.id), &section.config)
        .map_err(report_config_error)?;

    let prefix = format!("sources.{}", cli.id);
    let listen_address =
        app_config::get_str_or(&store, &format!("{prefix}.listen_address"), "0.0.0.0");
    let listen_port = app_config::get_i64_or(&store, &format!("{prefix}.listen_port"), 514) as u16;
    let buffer_size = app_config::get_i64_or(&store, &format!("{prefix}.buffer_size"), 4096) as usize;
    let default_trailer = app_config::get_str_or(&store, &format!("{prefix}.default_trailer"), "\n");
    let timeout_seconds = app_config::get_i64_or(&store, &format!("{prefix}.timeout_seconds"), 60);
    let tenant_id = app_config::get_str_or(&store, &format!("{prefix}.tenant"), &cli.id);

    let ingest_path = app_config::ingest_stream_path(&store, &cli.id);
    let mut ingest = JsonlStream::new(ingest_path);
    let accept_timeout = Duration::from_secs(timeout_seconds.max(1) as u64);

    let listener = TcpListener::bind((listen_address.as_str(), listen_port))
        .await
        .map_err(|err| {
            tracing::error!(%err, address = %listen_address, port = listen_port, "failed to bind source listener");
            exitcode::IOERR
        })?;
    tracing::info!(id = %cli.id, address = %listen_address, port = listen_port, "source listening");

    loop {
        match timeout(accept_timeout, listener.accept()).await {
            Ok(Ok((socket, peer))) => {
                tracing::info!(%peer, "source accepted connection");
                if let Err(err) = serve_connection(
                    socket,
                    &mut ingest,
                    &cli.id,
                    &tenant_id,
                    buffer_size,
                    &default_trailer,
                    accept_timeout,
                )
                .await
                {
                    tracing::warn!(%err, "connection ended with an error");
                }
            }
            Ok(Err(err)) => {
                tracing::warn!(%err, "accept failed");
            }
            Err(_elapsed) => {
                emit_heartbeat(&mut ingest, &cli.id, &tenant_id);
            }
        }
    }
}

async fn serve_connection(
    mut socket: TcpStream,
    ingest: &mut JsonlStream,
    source_id: &str,
    tenant_id: &str,
    buffer_size: usize,
    default_trailer: &str,
    read_timeout: Duration,
) -> Result<(), std::io::Error> {
    let mut carry = BytesMut::new();
    let mut trailer: Option<Bytes> = None;
    let default_trailer_bytes = default_trailer.as_bytes().to_vec();
    let discovery: Box<DiscoveryFn> = Box::new(move |_raw: &correlator_syslog::RawRecord| {
        Some(Bytes::from(default_trailer_bytes.clone()))
    });

    let mut buf = vec![0u8; buffer_size];
    loop {
        match timeout(read_timeout, socket.read(&mut buf)).await {
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) => {
                carry.extend_from_slice(&buf[..n]);
                if trailer.is_none() && !carry.is_empty() {
                    trailer = Some(discover_trailer(&carry, Some(&*discovery)));
                }
                if let Some(trailer) = &trailer {
                    drain_frames(&mut carry, trailer, ingest, source_id, tenant_id);
                }
            }
            Ok(Err(err)) => return Err(err),
            Err(_elapsed) => {
                emit_heartbeat(ingest, source_id, tenant_id);
            }
        }
    }
}

fn drain_frames(
    carry: &mut BytesMut,
    trailer: &Bytes,
    ingest: &mut JsonlStream,
    source_id: &str,
    tenant_id: &str,
) {
    loop {
        let Some(pos) = find_subslice(carry, trailer) else {
            return;
        };
        let frame = carry.split_to(pos).freeze();
        let _ = carry.split_to(trailer.len());
        if frame.is_empty() {
            continue;
        }
        let envelope = WireEnvelope {
            tenant_id: tenant_id.to_string(),
            source_id: source_id.to_string(),
            record_type: RecordType::SyslogData,
            timestamp_ms: now_ms(),
            payload: frame.to_vec(),
        };
        if let Err(err) = ingest.publish(&envelope) {
            tracing::error!(%err, "failed to publish ingest envelope");
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn emit_heartbeat(ingest: &mut JsonlStream, source_id: &str, tenant_id: &str) {
    let envelope = WireEnvelope {
        tenant_id: tenant_id.to_string(),
        source_id: source_id.to_string(),
        record_type: RecordType::Heartbeat,
        timestamp_ms: now_ms(),
        payload: Vec::new(),
    };
    if let Err(err) = ingest.publish(&envelope) {
        tracing::error!(%err, "failed to publish heartbeat");
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn report_config_error(err: AppConfigError) -> i32 {
    tracing::error!(%err, "configuration error");
    exitcode::CONFIG
}
