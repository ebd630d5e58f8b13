//! Tracing subscriber setup for the `cms` binary.

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Installs a fmt subscriber. `RUST_LOG` wins over the configured filter.
///
/// Safe to call more than once; later calls are ignored.
pub fn init(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
