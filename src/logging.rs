//! Diagnostic tracing for the engine, store and executors.
//!
//! Tracing goes to stderr and is separate from the terminal progress in
//! [`crate::ui`] and from the evidence and audit documents.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn`, or `gatework=debug` when `verbose`.
/// Output: stderr, compact format.
pub fn init(verbose: bool) {
    let default = if verbose { "warn,gatework=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
