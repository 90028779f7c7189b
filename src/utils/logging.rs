//! Structured logging setup
//!
//! Installs a global `tracing-subscriber` fmt subscriber. The level comes from
//! [`LoggingConfig`] unless the `TICKWIRE_LOG` environment variable carries
//! filter directives (e.g. `TICKWIRE_LOG=tickwire::service=debug`).

use tracing::debug;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Environment variable overriding the configured filter
pub const LOG_ENV: &str = "TICKWIRE_LOG";

/// Build the filter for `config`, honoring [`LOG_ENV`]
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.log_level).into())
        .with_env_var(LOG_ENV)
        .from_env_lossy()
}

/// Install the global subscriber.
///
/// Returns `false` if a global subscriber was already installed; the existing
/// one is left in place.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = env_filter(config);
    let installed = if config.json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok()
    };

    if installed {
        debug!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    }
    installed
}
