//! Logger initialisation

use env_logger::Env;

/// Install `env_logger`, honouring `RUST_LOG` and falling back to `filter`
///
/// Returns `false` when a logger was already installed.
pub fn init(filter: &str) -> bool {
    env_logger::Builder::from_env(Env::default().default_filter_or(filter))
        .format_timestamp_millis()
        .try_init()
        .is_ok()
}
