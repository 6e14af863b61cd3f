//! Logging setup.

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_logging() {
    init_logging_with("info");
}

/// Like [`init_logging`] with a custom filter for when `RUST_LOG` is unset.
///
/// Does nothing if a subscriber is already installed.
pub fn init_logging_with(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // A host or an earlier call may have installed one already
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
