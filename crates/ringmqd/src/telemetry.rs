//! Logging setup for the ringmq command-line tool.

use tracing_subscriber::EnvFilter;

/// Initialize the `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `level` (the config's `[log] level`)
/// is used. Console output only. Call once, before any event is emitted.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
