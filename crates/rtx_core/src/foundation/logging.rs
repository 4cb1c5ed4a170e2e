//! Logging utilities

pub use log::{debug, info, warn, error, trace};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "info";

/// Initialize the logging system with the default filter
pub fn init() {
    init_with_filter(DEFAULT_FILTER);
}

/// Initialize the logging system, falling back to `filter` when `RUST_LOG`
/// is not set. Calling it more than once is harmless.
pub fn init_with_filter(filter: &str) {
    let env = env_logger::Env::default().default_filter_or(filter);
    if env_logger::Builder::from_env(env).try_init().is_err() {
        log::debug!("Logger already initialized");
    }
}
