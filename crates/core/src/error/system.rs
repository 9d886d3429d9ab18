use thiserror::Error;

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("logging is not initialized")]
    LoggingNotInitialized,

    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("failed to reconfigure logging: {0}")]
    LoggingReload(String),
}
