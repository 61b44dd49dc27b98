//! Minimal `tracing` wiring for demos and tests: a single
//! `init()` that installs an env-filtered formatting subscriber exactly
//! once per process, so examples and test binaries can call it
//! unconditionally without double-init panics.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a `tracing_subscriber::fmt` subscriber, reading
/// `RUST_LOG` (default `info`). Safe to call more than once; only the
/// first call takes effect.
pub fn init() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
    });
}
