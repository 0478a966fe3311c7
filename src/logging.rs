use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: OnceLock<()> = OnceLock::new();

/// Set up terminal logging with UTC RFC 3339 timestamps.
///
/// `RUST_LOG` wins over `default_filter`. Calling this more than once is a
/// no-op, so bins and tests can both call it freely.
pub fn init_logging(default_filter: &str) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
        let stdout_layer = fmt::layer()
            .with_timer(fmt::time::ChronoUtc::rfc_3339())
            .with_target(false);

        // Another subscriber may already be installed by the host process
        let _ = tracing_subscriber::registry().with(filter).with(stdout_layer).try_init();
    });
}
