//! Tracing setup for the service binary

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber; `ENGRAM_LOG` (falling back to
/// `RUST_LOG`) controls the filter, defaulting to `info`
pub fn init_tracing() {
    let filter = std::env::var("ENGRAM_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());

    let _ = fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .try_init();
}
