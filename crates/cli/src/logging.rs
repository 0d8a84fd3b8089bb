//! Tracing initialisation for the `intake` binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "intake=info,intake_engine=info,tower_http=info";

/// Install a stderr subscriber. `RUST_LOG` overrides the default filter.
pub(crate) fn init_logging(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    };

    if let Err(e) = tracing_subscriber::registry().with(layer).try_init() {
        eprintln!("Warning: logging already initialised: {}", e);
    }
}
