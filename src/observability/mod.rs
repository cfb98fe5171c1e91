//! # Observability
//!
//! Process-wide `tracing` subscriber. Logs go to stderr so a worker's
//! stdout stays free for its handler.

use std::sync::Once;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// Filter from `RUST_LOG`, falling back to `level`
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &LoggingConfig) {
    let filter = env_filter(&config.level);
    let json = config.json;

    INIT.call_once(|| {
        let registry = tracing_subscriber::registry().with(filter);
        let result = if json {
            registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
        } else {
            registry
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()
        };
        if let Err(e) = result {
            eprintln!("Logging already initialized: {}", e);
        }
    });
}
