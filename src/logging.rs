use env_logger::{Builder, Env};

use crate::config::LOG_ENV;

/// Installs the `env_logger` backend once per process, filtered by [`LOG_ENV`].
///
/// The host process may already own a logger; in that case ours is skipped silently.
pub fn init() {
    let env = Env::new().filter_or(LOG_ENV, "info");
    let _ = Builder::from_env(env).format_timestamp_millis().try_init();
}

pub fn flush() {
    log::logger().flush();
}
