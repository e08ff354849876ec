//! Tracing setup for embedding processes.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the process-wide tracing subscriber. Respects `RUST_LOG`;
/// defaults to `info`. Later calls are no-ops, so library consumers and
/// test harnesses can both call it freely.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}
