use log::SetLoggerError;

/// Attempt to init an env_logger for g1-refine.
/// Does nothing if the "builtin_env_logger" feature is disabled.
pub fn try_init() -> Result<(), SetLoggerError> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            env_logger::try_init_from_env(
                // By default, use info level logging.
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            )
        } else {
            Ok(())
        }
    }
}

/// Install the built-in logger unless the embedder already installed one, then
/// report the build we are running.
pub(crate) fn init() {
    match try_init() {
        Ok(()) => debug!("g1-refine installed the built-in env_logger"),
        Err(_) => debug!("A logger is already installed; keeping it"),
    }
    info!("{}", crate::build_info::banner());
}
