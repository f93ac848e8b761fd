//! Development-time tracing.
//!
//! Tracing is diagnostics only: output goes to stderr and is controlled by
//! `RUST_LOG`. Run artifacts under `.pipeline/runs/` are written regardless of
//! the log level.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber. Defaults to `warn` when `RUST_LOG` is
/// unset.
///
/// ```bash
/// RUST_LOG=pipeline=debug pipeline run --task "add health route"
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
