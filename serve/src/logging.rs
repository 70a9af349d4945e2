//! Logging initialization: `tracing` to stdout, level from `RUST_LOG`.
//!
//! Default filter is `info` when `RUST_LOG` is unset or invalid.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Safe to call more than once per process;
/// later calls are no-ops (e.g. a test that also starts a server).
pub(crate) fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .try_init();
}
