//! Tracing setup for the forklift CLI.
//!
//! Logs are the product surface of this tool: operators follow a run through
//! them. Output goes to stderr so the exit code and any future stdout output
//! stay machine-readable.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level is `info`, or `debug` when
/// the `--debug` flag was given. Output: stderr, compact format.
pub fn init(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
