//! Tracing subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize structured logging. Respects `RUST_LOG`; defaults to `info`
/// for this crate. Safe to call more than once (subsequent calls are
/// no-ops).
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,text2sql=info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
