//! Built-in logger bootstrap.
//!
//! Embedders that already install their own `log` backend should disable
//! the `builtin_env_logger` feature; `try_init` then becomes a no-op so two
//! competing `log::set_logger` calls never race.

/// Initializes `env_logger` reading `RUST_LOG` (default level `info`) if the
/// `builtin_env_logger` feature is enabled. Safe to call more than once;
/// only the first call has an effect.
#[cfg(feature = "builtin_env_logger")]
pub fn try_init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

#[cfg(not(feature = "builtin_env_logger"))]
pub fn try_init() {
    log::debug!(target: "g1core::logger", "builtin_env_logger disabled; assuming the embedder installed a log backend");
}
