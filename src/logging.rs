//! Tracing initialization for the binaries.
//!
//! Structured logging via `tracing` with environment-based filtering
//! (`RUST_LOG`). Worker threads are named, so enabling thread names makes a
//! pipeline trace readable at a glance.

use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Initialize the global subscriber.
///
/// Idempotent: a second call (tests, embedding applications that already set
/// a subscriber) is a no-op rather than an error.
pub fn init(default_level: &str) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = fmt::layer()
        .compact()
        .with_thread_names(true)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .or_else(|e| {
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {e}"))
            }
        })
}
