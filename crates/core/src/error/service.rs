use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("tunnel service not installed (timeout after {seconds} seconds)")]
    InstallTimeout { seconds: u64 },

    #[error("tunnel service not started (timeout after {seconds} seconds)")]
    StartTimeout { seconds: u64 },

    #[error("tunnel service stopped while starting")]
    StoppedDuringStart,

    #[error("tunnel service start error: {reason}")]
    StartFailed { reason: String },

    #[error("tunnel service not uninstalled (timeout after {seconds} seconds)")]
    UninstallTimeout { seconds: u64 },

    #[error("command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("failed to query tunnel service {service_name}: {reason}")]
    QueryFailed {
        service_name: String,
        reason: String,
    },
}
