//! Tracing bootstrap shared by the four binaries.

/// Initializes the global subscriber. `RUST_LOG`, when set, wins; otherwise
/// `-d` selects `debug`, and its absence selects `info`.
pub fn init(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
