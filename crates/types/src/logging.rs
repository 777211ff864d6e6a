//! Helper functions for logging

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// A `Once` instance to ensure that logging is only initialized once.
static LOGGING_INITIALIZED: Once = Once::new();

/// Install the global `tracing` subscriber, filtered by `RUST_LOG`.
///
/// Set `RUST_LOG_FORMAT=json` for one JSON object per line. Calling this more than once is a
/// no-op, so every test may call it.
pub fn setup_logging() {
    LOGGING_INITIALIZED.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true);
        // a subscriber may already be installed by the embedding application
        if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
            let _ = builder.json().try_init();
        } else {
            let _ = builder.try_init();
        }
    });
}
