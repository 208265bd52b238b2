//! Logging bootstrap.
//!
//! Library crates log through the `log` facade; this installs a `tracing`
//! subscriber that receives both `tracing` events and bridged `log` records.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber.
///
/// The filter is read from `RUST_LOG` and falls back to `default_filter`
/// (for example `"info"` or `"steel_chunk=debug"`).
///
/// # Errors
/// Returns an error if a global subscriber or logger has already been installed.
pub fn init(default_filter: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
}
