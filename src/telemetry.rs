//! Tracing setup for test binaries

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber, honouring `RUST_LOG` and defaulting to
/// `info`.
///
/// Safe to call from every test; only the first call installs anything.
/// Returns `false` when a subscriber was already set.
pub fn init_tracing() -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init()
        .is_ok()
}

/// Like [`init_tracing`] but emitting JSON lines, for CI log collectors
pub fn init_json_tracing() -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .is_ok()
}
