use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon is not running")]
    NotRunning,

    #[error("daemon timeout after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("invalid daemon response: {reason}")]
    InvalidResponse { reason: String },

    #[error("daemon command failed: {reason}")]
    CommandFailed { reason: String },

    #[error("no tunnel is active")]
    NoActiveTunnel,

    #[error("a tunnel is already active")]
    TunnelAlreadyActive,

    #[error("unsupported platform: {reason}")]
    UnsupportedPlatform { reason: String },
}
