//! Tracing subscriber setup.
//!
//! One `EnvFilter` plus either a pretty or a JSON `fmt` layer. `RUST_LOG`
//! overrides the configured level.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{CoreError, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn filter_or(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Pretty output at `info` unless `RUST_LOG` says otherwise.
///
/// Does nothing if a subscriber is already installed.
///
/// ```no_run
/// qlafs_core::logging::init();
/// tracing::info!("Node starting");
/// ```
pub fn init() {
    let _ = init_from_config(&LoggingConfig::default());
}

/// JSON lines for log shippers
pub fn init_json() {
    let _ = init_from_config(&LoggingConfig {
        format: LogFormat::Json,
        ..LoggingConfig::default()
    });
}

/// Initialize logging from the `[logging]` config section.
///
/// `RUST_LOG` still takes precedence over `config.level`. Returns an error
/// instead of panicking when a global subscriber is already installed.
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    let filter = filter_or(&config.level);
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    installed.map_err(|e| CoreError::Config(format!("logging already initialized: {}", e)))
}
