//! Tracing subscriber initialization.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a global `EnvFilter` + fmt subscriber. Idempotent; safe to call
/// from tests and embedders alike. Filtering is driven by `ANP_LOG` (falling
/// back to `RUST_LOG`), defaulting to `warn`.
pub fn init() {
    INIT.call_once(|| {
        let filter = std::env::var("ANP_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| "warn".to_string());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_writer(std::io::stderr)
            .try_init();
    });
}
