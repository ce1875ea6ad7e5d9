use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "lanchat_sync=info,lanchat_cli=info";

/// Installs the fmt subscriber. `RUST_LOG` overrides [`DEFAULT_FILTER`].
/// Only the first call in a process installs anything.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        tracing::trace!("tracing subscriber already installed");
    }
}
