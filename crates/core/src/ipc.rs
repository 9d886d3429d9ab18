use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
#[cfg(windows)]
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};
#[cfg(unix)]
use tracing::{debug, warn};

#[cfg(not(any(unix, windows)))]
use crate::error::DaemonError;
use crate::error::Result;

/// Byte stream under one control connection.
trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Listening end of the daemon's control channel: a unix domain socket, or a
/// named pipe on Windows.
pub struct IpcSocket {
    #[cfg(unix)]
    listener: UnixListener,
    /// The pipe instance the next client connects to.
    #[cfg(windows)]
    next_instance: tokio::sync::Mutex<NamedPipeServer>,
    path: PathBuf,
}

impl IpcSocket {
    /// Binds the socket, replacing a stale socket file from an earlier run.
    #[cfg(unix)]
    pub async fn bind(path: PathBuf) -> Result<Self> {
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("Removing stale socket {}", path.display());
            let _ = tokio::fs::remove_file(&path).await;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let listener = UnixListener::bind(&path)?;

        // Non-root clients talk to a daemon running as root.
        use std::os::unix::fs::PermissionsExt;
        if let Err(error) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777))
        {
            warn!("Failed to set socket permissions: {}", error);
        }

        Ok(Self { listener, path })
    }

    /// Creates the first instance of the pipe. Fails when another daemon
    /// already serves it.
    #[cfg(windows)]
    pub async fn bind(path: PathBuf) -> Result<Self> {
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&path)?;
        Ok(Self {
            next_instance: tokio::sync::Mutex::new(server),
            path,
        })
    }

    #[cfg(not(any(unix, windows)))]
    pub async fn bind(path: PathBuf) -> Result<Self> {
        let _ = path;
        Err(unsupported())
    }

    #[cfg(unix)]
    pub async fn accept(&self) -> Result<IpcStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(IpcStream::new(stream))
    }

    #[cfg(windows)]
    pub async fn accept(&self) -> Result<IpcStream> {
        let mut next_instance = self.next_instance.lock().await;
        next_instance.connect().await?;
        // A fresh instance must exist before the connected one is handed out,
        // or clients arriving in between find no pipe.
        let fresh = ServerOptions::new().create(&self.path)?;
        let connected = std::mem::replace(&mut *next_instance, fresh);
        Ok(IpcStream::new(connected))
    }

    #[cfg(not(any(unix, windows)))]
    pub async fn accept(&self) -> Result<IpcStream> {
        Err(unsupported())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
impl Drop for IpcSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// One connection carrying newline-delimited messages.
pub struct IpcStream {
    stream: BufReader<Box<dyn Transport>>,
}

impl IpcStream {
    fn new(transport: impl Transport + 'static) -> Self {
        Self {
            stream: BufReader::new(Box::new(transport)),
        }
    }

    #[cfg(unix)]
    pub async fn connect(path: &Path) -> Result<Self> {
        Ok(Self::new(UnixStream::connect(path).await?))
    }

    /// Fails with a busy error while every pipe instance is taken; callers
    /// retry.
    #[cfg(windows)]
    pub async fn connect(path: &Path) -> Result<Self> {
        Ok(Self::new(ClientOptions::new().open(path)?))
    }

    #[cfg(not(any(unix, windows)))]
    pub async fn connect(path: &Path) -> Result<Self> {
        let _ = path;
        Err(unsupported())
    }

    pub async fn send_message(&mut self, message: &str) -> Result<()> {
        let stream = self.stream.get_mut();
        stream.write_all(message.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        Ok(())
    }

    /// Next message without its line terminator; `None` at end of stream.
    pub async fn read_message(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        Ok(Some(line))
    }
}

#[cfg(not(any(unix, windows)))]
fn unsupported() -> crate::error::Error {
    DaemonError::UnsupportedPlatform {
        reason: "the control channel needs unix domain sockets or named pipes".to_string(),
    }
    .into()
}
