//! Diagnostics for the engine, on stderr.
//!
//! Tracing is for people debugging the engine. It is not persisted and never
//! written to stdout, which carries the JSON results the driver parses. The
//! auto-fix journal under `.conductor/journal/autofix/` is the product record
//! and is written whatever the filter says.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset, by number of `-v` flags.
fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "conductor=info,warn",
        _ => "conductor=debug,info",
    }
}

/// Install the stderr subscriber. `RUST_LOG` wins over `verbosity` when set.
///
/// ```bash
/// RUST_LOG=conductor::autofix=debug conductor autofix
/// conductor -vv status
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));

    // Keeps the first subscriber if one is already installed.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
