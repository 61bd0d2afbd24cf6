//! Structured logging initialisation.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

static LOGGER_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Calling this more than
/// once is a no-op, and an already installed subscriber (e.g. from a test
/// harness) is left in place. Returns true if this call installed ours.
pub fn init_logging(config: &LoggingConfig) -> bool {
    *LOGGER_INITIALIZED.get_or_init(|| {
        let filter = build_filter(config);

        let installed = if config.json {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_target(config.with_target))
                .try_init()
                .is_ok()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(config.with_target))
                .try_init()
                .is_ok()
        };

        if installed {
            tracing::debug!(level = %config.level, json = config.json, "Logging initialised");
        }
        installed
    })
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
