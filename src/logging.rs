//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Build the filter for `level`, letting `RUST_LOG` take precedence when set.
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install a global fmt subscriber.
///
/// Returns `false` if a subscriber was already installed, which happens when
/// the library is embedded in a host that sets up its own logging.
pub fn init(level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_target(false)
        .try_init()
        .is_ok()
}
