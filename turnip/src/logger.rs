//! Log subscriber shared by the daemons.
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Filtering comes from `RUST_LOG`, with
/// `info` as the default level.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init()
        .expect("global logger hasn't already been set");
}
