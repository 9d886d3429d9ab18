use std::{
    net::IpAddr,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep, timeout};
use tracing::debug;

use crate::{
    controller::TunnelState,
    error::{DaemonError, Error, Result},
    events::StateInfo,
    ipc::IpcStream,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "cmd")]
pub enum DaemonCommand {
    Connect { config_path: String },
    Disconnect,
    Pause,
    Resume,
    SetManualDns { ip: IpAddr },
    ResetManualDns,
    Status,
    Logs { max_bytes: u64 },
    SetLogging { enabled: bool },
    HealthCheck,
}

/// Reply to every command. `message` carries the payload for `Status` (JSON
/// of [`DaemonStatus`]) and `Logs`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DaemonResponse {
    pub ok: bool,
    pub message: String,
}

impl DaemonResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn failure(error: &Error) -> Self {
        Self {
            ok: false,
            message: error.to_string(),
        }
    }

    /// Turns a failed reply back into an error on the client side.
    pub fn into_result(self) -> Result<String> {
        if self.ok {
            Ok(self.message)
        } else {
            Err(DaemonError::CommandFailed {
                reason: self.message,
            }
            .into())
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonStatus {
    pub service_name: Option<String>,
    pub tunnel_state: Option<TunnelState>,
    pub last_event: Option<StateInfo>,
    pub manual_dns: Option<IpAddr>,
}

#[async_trait]
pub trait DaemonClient: Send + Sync {
    async fn send_command(&self, cmd: DaemonCommand) -> Result<DaemonResponse>;
    async fn is_daemon_running(&self) -> bool;
}

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Talks to the daemon over its control socket, one connection per command.
pub struct SocketDaemonClient {
    socket_path: PathBuf,
    response_timeout: Duration,
}

impl SocketDaemonClient {
    /// Connect replies arrive only once the tunnel is up, which can take as
    /// long as the install and start deadlines together.
    pub fn new(socket_path: impl Into<PathBuf>, response_timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            response_timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The daemon may still be starting, so connecting is retried for a
    /// few seconds before it is reported as not running.
    async fn connect(&self) -> Result<IpcStream> {
        let mut attempts = 0;
        loop {
            match IpcStream::connect(&self.socket_path).await {
                Ok(stream) => {
                    debug!("Connected to daemon at {}", self.socket_path.display());
                    return Ok(stream);
                }
                Err(error) if attempts + 1 < CONNECT_ATTEMPTS => {
                    debug!("Daemon not reachable yet: {}", error);
                    attempts += 1;
                    sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(error) => {
                    debug!("Daemon not reachable: {}", error);
                    return Err(DaemonError::NotRunning.into());
                }
            }
        }
    }

    async fn exchange(&self, mut stream: IpcStream, cmd: &DaemonCommand) -> Result<DaemonResponse> {
        let message = serde_json::to_string(cmd)?;
        stream.send_message(&message).await?;

        let line = timeout(self.response_timeout, stream.read_message())
            .await
            .map_err(|_| DaemonError::Timeout {
                seconds: self.response_timeout.as_secs(),
            })??
            .ok_or_else(|| DaemonError::InvalidResponse {
                reason: "daemon closed connection without response".to_string(),
            })?;

        serde_json::from_str(&line).map_err(|error| {
            DaemonError::InvalidResponse {
                reason: error.to_string(),
            }
            .into()
        })
    }
}

#[async_trait]
impl DaemonClient for SocketDaemonClient {
    async fn send_command(&self, cmd: DaemonCommand) -> Result<DaemonResponse> {
        let stream = self.connect().await?;
        self.exchange(stream, &cmd).await
    }

    /// Single attempt, no retries.
    async fn is_daemon_running(&self) -> bool {
        let stream = match IpcStream::connect(&self.socket_path).await {
            Ok(stream) => stream,
            Err(error) => {
                debug!("Daemon not reachable: {}", error);
                return false;
            }
        };
        match self.exchange(stream, &DaemonCommand::HealthCheck).await {
            Ok(response) => response.ok,
            Err(error) => {
                debug!("Daemon health check failed: {}", error);
                false
            }
        }
    }
}
