use std::{net::IpAddr, path::Path, sync::Arc};

use svctunnel_core::{
    ConnectionParameters, ConnectionState, Settings, TunnelController,
    daemon_client::{DaemonCommand, DaemonResponse, DaemonStatus},
    dns::DnsOverride,
    error::{DaemonError, Error, Result},
    ipc::{IpcSocket, IpcStream},
    logging,
    service::{ServiceIdentity, TunnelService},
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

mod session;

use crate::session::TunnelSession;

/// Serves control commands on the settings' socket until the process exits.
pub async fn run_daemon(settings: Settings) -> Result<()> {
    let service = platform_service(&settings);
    let daemon = Arc::new(Daemon::new(settings, service, platform_dns()));
    daemon.cleanup_stale_service().await;

    let socket_path = daemon.settings.paths.socket.clone();
    let listener = IpcSocket::bind(socket_path).await?;
    info!("Daemon listening on {}", listener.path().display());
    info!("process id: {}", std::process::id());

    loop {
        let stream = listener.accept().await?;
        // Connect replies take as long as the install, so every client gets
        // its own task.
        tokio::spawn(serve_connection(Arc::clone(&daemon), stream));
    }
}

#[cfg(windows)]
fn platform_service(_settings: &Settings) -> Arc<dyn TunnelService> {
    Arc::new(svctunnel_core::service::WireGuardTunnelService::new())
}

#[cfg(not(windows))]
fn platform_service(settings: &Settings) -> Arc<dyn TunnelService> {
    Arc::new(svctunnel_core::service::WgQuickTunnelService::new(
        settings.paths.settings_dir.join("wg-quick"),
    ))
}

#[cfg(target_os = "macos")]
fn platform_dns() -> Arc<dyn DnsOverride> {
    Arc::new(svctunnel_core::dns::NetworkSetupDns::new())
}

#[cfg(not(target_os = "macos"))]
fn platform_dns() -> Arc<dyn DnsOverride> {
    Arc::new(svctunnel_core::dns::UnmanagedDns)
}

async fn serve_connection(daemon: Arc<Daemon>, mut stream: IpcStream) {
    loop {
        let line = match stream.read_message().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(error) => {
                warn!("Failed to read from client: {}", error);
                return;
            }
        };
        debug!("Daemon received: {}", line);

        let response = match serde_json::from_str::<DaemonCommand>(&line) {
            Ok(command) => match daemon.handle_command(command).await {
                Ok(message) => DaemonResponse::success(message),
                Err(error) => {
                    error!("Command failed: {}", error);
                    DaemonResponse::failure(&error)
                }
            },
            Err(error) => {
                let error = Error::from(DaemonError::InvalidResponse {
                    reason: format!("invalid command: {error}"),
                });
                DaemonResponse::failure(&error)
            }
        };

        let reply = match serde_json::to_string(&response) {
            Ok(reply) => reply,
            Err(error) => {
                error!("Response serialization error: {}", error);
                return;
            }
        };
        if stream.send_message(&reply).await.is_err() {
            error!("Failed to send response to client");
            return;
        }
    }
}

pub struct Daemon {
    settings: Settings,
    service: Arc<dyn TunnelService>,
    dns: Arc<dyn DnsOverride>,
    session: Mutex<Option<TunnelSession>>,
    /// Carried over to every new tunnel.
    manual_dns: Mutex<Option<IpAddr>>,
}

impl Daemon {
    pub fn new(settings: Settings, service: Arc<dyn TunnelService>, dns: Arc<dyn DnsOverride>) -> Self {
        Self {
            settings,
            service,
            dns,
            session: Mutex::new(None),
            manual_dns: Mutex::new(None),
        }
    }

    /// Removes a tunnel service left behind by a previous run.
    pub async fn cleanup_stale_service(&self) {
        let identity = ServiceIdentity::from_config_path(&self.settings.paths.wireguard_config);
        match self.service.query_status(&identity).await {
            Ok(status) if status.is_installed() => {
                info!("Removing stale tunnel service {}", identity);
                if let Err(error) = self
                    .service
                    .uninstall(&self.settings.paths.wireguard_binary, &identity)
                    .await
                {
                    warn!("Failed to remove stale tunnel service: {}", error);
                }
            }
            Ok(_) => {}
            Err(error) => warn!("Failed to query tunnel service: {}", error),
        }
    }

    pub async fn handle_command(&self, command: DaemonCommand) -> Result<String> {
        match command {
            DaemonCommand::Connect { config_path } => self.connect(Path::new(&config_path)).await,
            DaemonCommand::Disconnect => self.disconnect().await,
            DaemonCommand::Pause => {
                self.with_active(|controller| controller.pause()).await?;
                Ok("Pausing".to_string())
            }
            DaemonCommand::Resume => {
                self.with_active(|controller| controller.resume()).await?;
                Ok("Resuming".to_string())
            }
            DaemonCommand::SetManualDns { ip } => self.change_manual_dns(Some(ip)).await,
            DaemonCommand::ResetManualDns => self.change_manual_dns(None).await,
            DaemonCommand::Status => Ok(serde_json::to_string(&self.status().await)?),
            DaemonCommand::Logs { max_bytes } => {
                logging::read_log_tail(&self.settings.paths.log_file, max_bytes).await
            }
            DaemonCommand::SetLogging { enabled } => {
                logging::set_file_logging(enabled)?;
                Ok(if enabled {
                    "File logging enabled".to_string()
                } else {
                    "File logging disabled".to_string()
                })
            }
            DaemonCommand::HealthCheck => Ok("healthy".to_string()),
        }
    }

    async fn connect(&self, config_path: &Path) -> Result<String> {
        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(TunnelSession::is_running) {
            return Err(DaemonError::TunnelAlreadyActive.into());
        }

        let params = ConnectionParameters::from_wireguard_file(config_path)?;
        info!("Connecting to {}", params.host_endpoint());
        let controller = TunnelController::new(
            params,
            &self.settings,
            Arc::clone(&self.service),
            Arc::clone(&self.dns),
        );
        if let Some(address) = *self.manual_dns.lock().await {
            controller.set_manual_dns(address);
        }

        let (started, settled) = TunnelSession::start(Arc::new(controller));
        *session = Some(started);
        // Other commands, disconnect included, must get through while the
        // tunnel comes up.
        drop(session);

        match settled.await {
            Ok(info) if info.state == ConnectionState::Connected => Ok("Connected".to_string()),
            Ok(info) => Err(DaemonError::CommandFailed {
                reason: info
                    .reason
                    .unwrap_or_else(|| "disconnected while connecting".to_string()),
            }
            .into()),
            Err(_) => Err(DaemonError::NoActiveTunnel.into()),
        }
    }

    async fn disconnect(&self) -> Result<String> {
        let mut session = self.session.lock().await;
        let active = session.take().ok_or(DaemonError::NoActiveTunnel)?;
        // The slot stays locked until the old loop has removed its service,
        // otherwise its cleanup could tear down the next tunnel.
        let stopped = active.stop().await;
        drop(session);
        stopped?;
        Ok("Disconnected".to_string())
    }

    async fn change_manual_dns(&self, address: Option<IpAddr>) -> Result<String> {
        *self.manual_dns.lock().await = address;

        let session = self.session.lock().await;
        let reconnecting = match session.as_ref() {
            Some(active) if active.is_running() => match address {
                Some(address) => active.controller.set_manual_dns(address),
                None => active.controller.reset_manual_dns(),
            },
            _ => false,
        };

        Ok(if reconnecting {
            "Reconnecting to apply DNS server".to_string()
        } else {
            "DNS server saved".to_string()
        })
    }

    async fn with_active(&self, action: impl FnOnce(&TunnelController)) -> Result<()> {
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(active) if active.is_running() => {
                action(&active.controller);
                Ok(())
            }
            _ => Err(DaemonError::NoActiveTunnel.into()),
        }
    }

    pub async fn status(&self) -> DaemonStatus {
        let manual_dns = *self.manual_dns.lock().await;
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(active) => DaemonStatus {
                service_name: Some(active.controller.identity().service_name.clone()),
                tunnel_state: Some(active.controller.state()),
                last_event: active.last_event(),
                manual_dns,
            },
            None => DaemonStatus {
                manual_dns,
                ..DaemonStatus::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex as StdMutex, time::Duration};

    use async_trait::async_trait;
    use svctunnel_core::{
        TunnelState,
        dns::UnmanagedDns,
        service::ServiceStatus,
        settings::{Paths, Timeouts},
    };

    use super::*;

    const CONFIG: &str = "[Interface]\n\
        PrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=\n\
        Address = 10.0.0.2/32\n\
        DNS = 10.0.0.1\n\
        \n\
        [Peer]\n\
        PublicKey = xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=\n\
        Endpoint = 1.2.3.4:51820\n";

    /// Installs and uninstalls instantly.
    struct InstantService {
        status: StdMutex<ServiceStatus>,
    }

    impl InstantService {
        fn with_status(status: ServiceStatus) -> Self {
            Self {
                status: StdMutex::new(status),
            }
        }
    }

    #[async_trait]
    impl TunnelService for InstantService {
        async fn install(&self, _binary_path: &Path, _config_path: &Path) -> Result<()> {
            *self.status.lock().unwrap() = ServiceStatus::Running;
            Ok(())
        }

        async fn query_status(&self, _identity: &ServiceIdentity) -> Result<ServiceStatus> {
            Ok(*self.status.lock().unwrap())
        }

        async fn uninstall(&self, _binary_path: &Path, _identity: &ServiceIdentity) -> Result<()> {
            *self.status.lock().unwrap() = ServiceStatus::NotInstalled;
            Ok(())
        }
    }

    fn daemon(directory: &Path, service: Arc<InstantService>) -> Daemon {
        let settings = Settings {
            paths: Paths::in_directory(directory),
            timeouts: Timeouts::default(),
        };
        Daemon::new(settings, service, Arc::new(UnmanagedDns))
    }

    #[tokio::test(start_paused = true)]
    async fn commands_without_tunnel_are_rejected() {
        let directory = tempfile::tempdir().unwrap();
        let daemon = daemon(
            directory.path(),
            Arc::new(InstantService::with_status(ServiceStatus::NotInstalled)),
        );

        for command in [DaemonCommand::Pause, DaemonCommand::Resume, DaemonCommand::Disconnect] {
            let error = daemon.handle_command(command).await.unwrap_err();
            assert!(matches!(error, Error::Daemon(DaemonError::NoActiveTunnel)));
        }
        assert_eq!(
            daemon.handle_command(DaemonCommand::HealthCheck).await.unwrap(),
            "healthy"
        );
        assert_eq!(daemon.status().await, DaemonStatus::default());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_service_is_removed_on_startup() {
        let directory = tempfile::tempdir().unwrap();
        let service = Arc::new(InstantService::with_status(ServiceStatus::Running));
        let daemon = daemon(directory.path(), Arc::clone(&service));

        daemon.cleanup_stale_service().await;

        assert_eq!(*service.status.lock().unwrap(), ServiceStatus::NotInstalled);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_status_and_disconnect() {
        let directory = tempfile::tempdir().unwrap();
        let config_path = directory.path().join("client.conf");
        std::fs::write(&config_path, CONFIG).unwrap();
        let service = Arc::new(InstantService::with_status(ServiceStatus::NotInstalled));
        let daemon = daemon(directory.path(), Arc::clone(&service));

        let reply = daemon
            .handle_command(DaemonCommand::Connect {
                config_path: config_path.display().to_string(),
            })
            .await
            .unwrap();
        assert_eq!(reply, "Connected");

        let error = daemon
            .handle_command(DaemonCommand::Connect {
                config_path: config_path.display().to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Daemon(DaemonError::TunnelAlreadyActive)));

        let status: DaemonStatus =
            serde_json::from_str(&daemon.handle_command(DaemonCommand::Status).await.unwrap())
                .unwrap();
        assert_eq!(status.service_name.as_deref(), Some("WireGuardTunnel$svctunnel"));
        assert_eq!(status.tunnel_state, Some(TunnelState::Connected));

        let reply = daemon
            .handle_command(DaemonCommand::SetManualDns {
                ip: "9.9.9.9".parse().unwrap(),
            })
            .await
            .unwrap();
        assert_eq!(reply, "Reconnecting to apply DNS server");

        assert_eq!(
            daemon.handle_command(DaemonCommand::Disconnect).await.unwrap(),
            "Disconnected"
        );
        assert_eq!(*service.status.lock().unwrap(), ServiceStatus::NotInstalled);
        assert_eq!(daemon.status().await.tunnel_state, None);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_waits_for_previous_teardown() {
        let directory = tempfile::tempdir().unwrap();
        let config_path = directory.path().join("client.conf");
        std::fs::write(&config_path, CONFIG).unwrap();
        let service = Arc::new(InstantService::with_status(ServiceStatus::NotInstalled));
        let daemon = Arc::new(daemon(directory.path(), Arc::clone(&service)));
        let connect = DaemonCommand::Connect {
            config_path: config_path.display().to_string(),
        };

        assert_eq!(daemon.handle_command(connect.clone()).await.unwrap(), "Connected");

        let disconnecting = Arc::clone(&daemon);
        let disconnect = tokio::spawn(async move {
            disconnecting.handle_command(DaemonCommand::Disconnect).await
        });
        // Let the disconnect take the session and start winding down.
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(daemon.handle_command(connect).await.unwrap(), "Connected");
        assert_eq!(disconnect.await.unwrap().unwrap(), "Disconnected");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*service.status.lock().unwrap(), ServiceStatus::Running);
        assert_eq!(daemon.status().await.tunnel_state, Some(TunnelState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_with_missing_config_fails() {
        let directory = tempfile::tempdir().unwrap();
        let daemon = daemon(
            directory.path(),
            Arc::new(InstantService::with_status(ServiceStatus::NotInstalled)),
        );

        let error = daemon
            .handle_command(DaemonCommand::Connect {
                config_path: directory.path().join("missing.conf").display().to_string(),
            })
            .await
            .unwrap_err();
        assert!(error.to_string().contains("missing.conf"));
        assert_eq!(daemon.status().await.tunnel_state, None);
    }
}
