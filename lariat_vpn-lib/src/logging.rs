use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_FILTER: &str = "info";

/// Initializes the global `tracing` subscriber.
///
/// Verbosity is controlled through `RUST_LOG`; if that is unset or
/// invalid the filter defaults to `"info"`. Output goes to stderr with
/// ANSI colors enabled only when attached to a terminal.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn setup() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
