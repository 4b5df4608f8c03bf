//! Diagnostics go through the `log` facade.  Hosts that already run their
//! own logging should disable the "builtin_env_logger" feature and register
//! an implementation themselves; with the feature on (the default), init
//! installs an `env_logger` showing warnings and up, overridable through
//! the usual `RUST_LOG` variable.

/// Install the built-in logger, if the feature asks for one and no other
/// logger beat us to it.
pub(crate) fn try_init() {
    #[cfg(feature = "builtin_env_logger")]
    {
        let env = env_logger::Env::default()
            .filter_or(env_logger::DEFAULT_FILTER_ENV, "warn");
        if env_logger::try_init_from_env(env).is_err() {
            // A logger was registered before us; defer to it.
            return;
        }
        debug!("installed the built-in env_logger");
    }
}
