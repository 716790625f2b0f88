//! Logging initialization for the xread binaries.
//!
//! `RUST_LOG` takes precedence over the configured level.

use crate::config::LoggingConfig;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. Call once, before any thread starts.
pub fn init(config: &LoggingConfig) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    if config.timestamps {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_thread_names(config.thread_names))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_thread_names(config.thread_names)
                    .without_time(),
            )
            .init();
    }
}
