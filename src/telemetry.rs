//! Tracing subscriber setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Install a stderr tracing subscriber filtered by `SYNCSTORE_LOG` (falling
/// back to `RUST_LOG`). Safe to call more than once; later calls are no-ops
/// when a global subscriber is already set.
pub fn init() {
    let filter = EnvFilter::try_from_env("SYNCSTORE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
