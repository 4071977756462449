//! Tracing subscriber setup.

/// Initializes logging at `level` unless `RUST_LOG` overrides it. Safe to
/// call more than once; later calls are ignored.
pub fn init(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
