//! Tracing subscriber setup for the binaries
//!
//! Library code only emits through `tracing`; installing a subscriber is
//! the binaries' job, so tests can substitute a capturing sink.

use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber with an env-driven filter, defaulting the
/// crate to info.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
