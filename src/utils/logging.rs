use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when `RUST_LOG` is unset. Audit events are kept at info so
/// session changes show up without turning on debug output.
pub const DEFAULT_FILTER: &str = "info,audit=info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Panics if one is already set.
pub fn init() {
    // target is shown so "audit" lines stand apart from the rest
    let fmt_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(filter())
        .with(fmt_layer)
        .init();
}

/// Like [`init`], but returns an error when a subscriber is already installed.
pub fn try_init() -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_target(true))
        .try_init()
}
