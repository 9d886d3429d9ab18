use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("a connection is already in progress for this controller")]
    AlreadyConnecting,

    #[error("disconnection already requested for this controller; create a new one to connect again")]
    DisconnectRequested,

    #[error("tunnel restart failed after {attempts} attempts")]
    RestartFailed { attempts: u32 },
}
