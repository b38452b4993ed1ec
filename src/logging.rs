//! Logging initialisation for the guestprep binary.
//!
//! Filter comes from `GUESTPREP_LOG`, then `RUST_LOG`, then `info` (or
//! `debug` with `--verbose`). Output goes to stderr so `--json` output on
//! stdout stays clean.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_ENV: &str = "GUESTPREP_LOG";

/// Initialise the global tracing subscriber. Call once from `main`.
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time(),
        )
        .init();
}
