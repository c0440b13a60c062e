//! Installs the process-wide `tracing` subscriber.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Installs a `fmt` subscriber filtered by `config.level`, as JSON when
/// `config.json` is set. An unparseable level falls back to `info`.
///
/// Returns `false` when a subscriber was already installed, which leaves
/// the existing one in place.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    installed.is_ok()
}
