//! Logging setup for the binaries.
//!
//! Diagnostics go to stderr through `tracing`; stdout is reserved for job
//! logs and reports.

use std::io;

use tracing_subscriber::EnvFilter;

/// Environment variable holding a `tracing` filter directive.
pub const LOG_ENV: &str = "STEMRIG_LOG";

/// Builds the filter: `STEMRIG_LOG` when set, otherwise `info` or `debug`.
#[must_use]
pub fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    })
}

/// Installs the global subscriber. A second call is a no-op.
pub fn init(verbose: bool) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
