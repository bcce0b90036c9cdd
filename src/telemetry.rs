//! Tracing bootstrap
//!
//! The engine logs through `tracing` everywhere; this is the one-call
//! subscriber setup for binaries and tests that embed it.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a fmt subscriber honoring `RUST_LOG`, defaulting to `info`.
///
/// Safe to call more than once; repeat installs are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
