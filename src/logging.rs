//! Tracing subscriber setup for binaries and tests.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs an env-filtered subscriber (`RUST_LOG` style). Safe to call
/// more than once; later calls are no-ops.
pub fn init() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .try_init();
}
