use std::{
    net::IpAddr,
    path::PathBuf,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::watch,
    time::{Instant, sleep},
};
use tracing::{error, info, warn};

use crate::{
    config::write_tunnel_config,
    dns::DnsOverride,
    error::{ControllerError, Result, ServiceError},
    events::{ConnectionState, EventSink, StateInfo},
    install_lock::InstallLock,
    params::ConnectionParameters,
    retry::{Backoff, Probe, RetryExecutor, WaitOutcome},
    service::{ServiceIdentity, ServiceStatus, TunnelService},
    settings::{Settings, Timeouts},
};

/// Requests delivered to the control loop through the single-slot mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlSignal {
    Pause,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelState {
    Idle,
    Installing,
    Connected,
    Pausing,
    Paused,
    Resuming,
    Restarting,
    Uninstalling,
    Terminated,
}

impl TunnelState {
    pub fn is_paused(self) -> bool {
        matches!(
            self,
            TunnelState::Pausing | TunnelState::Paused | TunnelState::Resuming
        )
    }
}

enum PausedExit {
    Resume,
    Disconnect,
}

/// A restart whose reinstall has not succeeded yet.
struct PendingRestart {
    attempts: u32,
    backoff: Backoff,
    next_attempt: Instant,
}

/// Owns the lifecycle of one tunnel service: install, supervise, pause,
/// resume, restart on configuration change, and uninstall.
///
/// [`connect`](Self::connect) runs the control loop and only returns once the
/// tunnel is torn down. Every other method may be called concurrently from
/// other tasks at any time, before, during or after that loop.
pub struct TunnelController {
    params: ConnectionParameters,
    binary_path: PathBuf,
    config_path: PathBuf,
    identity: ServiceIdentity,
    timeouts: Timeouts,
    service: Arc<dyn TunnelService>,
    dns: Arc<dyn DnsOverride>,
    install_lock: InstallLock,

    manual_dns: Mutex<Option<IpAddr>>,
    restart_requested: AtomicBool,
    disconnect_requested: AtomicBool,
    connect_running: AtomicBool,
    control: Mutex<Option<watch::Sender<ControlSignal>>>,
    state: watch::Sender<TunnelState>,
}

impl TunnelController {
    pub fn new(
        params: ConnectionParameters,
        settings: &Settings,
        service: Arc<dyn TunnelService>,
        dns: Arc<dyn DnsOverride>,
    ) -> Self {
        let config_path = settings.paths.wireguard_config.clone();
        Self {
            params,
            binary_path: settings.paths.wireguard_binary.clone(),
            identity: ServiceIdentity::from_config_path(&config_path),
            config_path,
            timeouts: settings.timeouts.clone(),
            service,
            dns,
            install_lock: InstallLock::global(),
            manual_dns: Mutex::new(None),
            restart_requested: AtomicBool::new(false),
            disconnect_requested: AtomicBool::new(false),
            connect_running: AtomicBool::new(false),
            control: Mutex::new(None),
            state: watch::channel(TunnelState::Idle).0,
        }
    }

    /// Replaces the process-wide install lock.
    pub fn with_install_lock(mut self, install_lock: InstallLock) -> Self {
        self.install_lock = install_lock;
        self
    }

    pub fn params(&self) -> &ConnectionParameters {
        &self.params
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    pub fn is_paused(&self) -> bool {
        self.state().is_paused()
    }

    pub fn is_disconnect_requested(&self) -> bool {
        self.disconnect_requested.load(Ordering::SeqCst)
    }

    pub fn manual_dns(&self) -> Option<IpAddr> {
        *self.manual_dns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Establishes the tunnel and supervises it until it is disconnected,
    /// stops on its own, or fails. Progress is reported through `events`,
    /// ending with a `Disconnected` event.
    pub async fn connect(&self, events: EventSink) -> Result<()> {
        if self.is_disconnect_requested() {
            return Err(ControllerError::DisconnectRequested.into());
        }
        if self.connect_running.swap(true, Ordering::SeqCst) {
            return Err(ControllerError::AlreadyConnecting.into());
        }
        let _running = LoopGuard(self);

        events.emit(StateInfo::connecting());
        let result = self.run(&events).await;

        *self.control_slot() = None;
        // Do not leave a manual DNS configuration behind.
        if let Err(error) = self.dns.delete_manual().await {
            error!("Failed to delete manual DNS: {}", error);
        }
        self.set_state(TunnelState::Terminated);

        let reason = result.as_ref().err().map(ToString::to_string);
        events.emit(StateInfo::disconnected(reason));
        info!("Connection stopped");
        result
    }

    /// Requests termination and removes the tunnel service. The request is
    /// permanent: this controller can not connect again afterwards.
    pub async fn disconnect(&self) -> Result<()> {
        self.disconnect_requested.store(true, Ordering::SeqCst);
        info!("Disconnecting...");
        // Unblocks a paused loop, which then observes the disconnect request.
        self.request(ControlSignal::Resume);
        self.uninstall_service().await
    }

    /// No-op unless the control loop is running.
    pub fn pause(&self) {
        self.request(ControlSignal::Pause);
    }

    /// No-op unless the control loop is running.
    pub fn resume(&self) {
        self.request(ControlSignal::Resume);
    }

    /// Sets the manual DNS server. Returns whether a reconnect was scheduled
    /// right away, which only happens for a changed value while connected.
    /// A change made during an install is picked up once that install
    /// completes.
    pub fn set_manual_dns(&self, address: IpAddr) -> bool {
        self.change_manual_dns(Some(address))
    }

    /// Reverts to the tunnel-assigned DNS server.
    pub fn reset_manual_dns(&self) -> bool {
        self.change_manual_dns(None)
    }

    fn change_manual_dns(&self, address: Option<IpAddr>) -> bool {
        {
            let mut manual_dns = self.manual_dns.lock().unwrap_or_else(PoisonError::into_inner);
            if *manual_dns == address {
                return false;
            }
            *manual_dns = address;
        }

        if self.state() != TunnelState::Connected {
            return false;
        }

        info!("Connection will be restarted due to DNS server IP configuration change...");
        self.restart_requested.store(true, Ordering::SeqCst);
        true
    }

    fn request(&self, signal: ControlSignal) {
        if let Some(sender) = self.control_slot().as_ref() {
            sender.send_replace(signal);
        }
    }

    fn control_slot(&self) -> std::sync::MutexGuard<'_, Option<watch::Sender<ControlSignal>>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TunnelState) {
        self.state.send_replace(state);
    }

    async fn run(&self, events: &EventSink) -> Result<()> {
        self.set_state(TunnelState::Uninstalling);
        self.uninstall_service()
            .await
            .map_err(|error| error.context("failed to disconnect before new connection"))?;

        let (control_sender, control) = watch::channel(ControlSignal::Resume);
        *self.control_slot() = Some(control_sender);

        self.set_state(TunnelState::Installing);
        let rendered_dns = match self.install_service(events).await {
            Ok(rendered_dns) => rendered_dns,
            Err(error) => {
                if self.is_disconnect_requested() {
                    info!("Disconnection was requested while connecting");
                    return Ok(());
                }
                return Err(error.context("failed to install tunnel service"));
            }
        };
        self.mark_connected(rendered_dns);

        let outcome = if self.is_disconnect_requested() {
            // The request came in while the service was being installed.
            info!("Disconnection was requested");
            Ok(())
        } else {
            self.supervise(events, control).await
        };

        self.set_state(TunnelState::Uninstalling);
        let cleanup = self.uninstall_service().await;
        match (outcome, cleanup) {
            (Err(error), Err(cleanup_error)) => {
                error!("Failed to uninstall service after failure: {}", cleanup_error);
                Err(error)
            }
            (outcome, cleanup) => outcome.and(cleanup),
        }
    }

    /// The connected-state loop. Each tick, in priority order: disconnect
    /// request, control signal, restart flag, service status.
    async fn supervise(
        &self,
        events: &EventSink,
        mut control: watch::Receiver<ControlSignal>,
    ) -> Result<()> {
        let mut pending_restart: Option<PendingRestart> = None;

        loop {
            if self.is_disconnect_requested() {
                info!("Disconnection was requested");
                return Ok(());
            }

            if control.has_changed().unwrap_or(false) {
                let signal = *control.borrow_and_update();
                if signal == ControlSignal::Pause {
                    match self.pause_until_resumed(&mut control).await? {
                        PausedExit::Disconnect => return Ok(()),
                        PausedExit::Resume => {
                            // The reinstall picks up the current parameters.
                            pending_restart = None;
                            self.restart_requested.store(false, Ordering::SeqCst);
                            self.resume_connection(events).await?;
                        }
                    }
                }
            }

            if self.restart_requested.swap(false, Ordering::SeqCst) {
                events.emit(StateInfo::new(
                    ConnectionState::Reconnecting,
                    "Reconnecting with new connection parameters",
                ));
                self.set_state(TunnelState::Restarting);
                pending_restart = Some(PendingRestart {
                    attempts: 0,
                    backoff: Backoff::new(self.timeouts.restart_retry),
                    next_attempt: Instant::now(),
                });
            }

            if let Some(restart) = pending_restart.as_mut() {
                // The service is expected to be absent until the restart succeeds.
                if Instant::now() >= restart.next_attempt {
                    restart.attempts += 1;
                    match self.restart_connection(events).await {
                        Ok(rendered_dns) => {
                            pending_restart = None;
                            self.mark_connected(rendered_dns);
                        }
                        Err(error) => {
                            error!("Failed to restart connection: {}", error);
                            if !self.is_disconnect_requested() {
                                if restart.attempts >= self.timeouts.max_restart_attempts {
                                    return Err(ControllerError::RestartFailed {
                                        attempts: restart.attempts,
                                    }
                                    .into());
                                }
                                let delay = restart.backoff.advance();
                                warn!("Retrying restart in {:?}", delay);
                                restart.next_attempt = Instant::now() + delay;
                            }
                        }
                    }
                }
            } else {
                match self.service.query_status(&self.identity).await {
                    Ok(ServiceStatus::NotInstalled) | Ok(ServiceStatus::Stopped) => {
                        info!("Tunnel service stopped");
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(error) => warn!("Failed to query tunnel service status: {}", error),
                }
            }

            sleep(self.timeouts.poll_interval).await;
        }
    }

    async fn pause_until_resumed(
        &self,
        control: &mut watch::Receiver<ControlSignal>,
    ) -> Result<PausedExit> {
        self.set_state(TunnelState::Pausing);
        info!("Pausing...");
        if let Err(error) = self.uninstall_service().await {
            error!("Failed to pause connection (disconnection error): {}", error);
            return Err(error.context("failed to pause connection"));
        }
        self.set_state(TunnelState::Paused);
        info!("Paused");

        loop {
            if self.is_disconnect_requested() {
                return Ok(PausedExit::Disconnect);
            }
            if control.changed().await.is_err() {
                // The sender lives as long as the loop; treat its loss as a stop.
                return Ok(PausedExit::Disconnect);
            }
            // Repeated pauses are coalesced.
            if *control.borrow_and_update() != ControlSignal::Pause {
                break;
            }
        }

        if self.is_disconnect_requested() {
            return Ok(PausedExit::Disconnect);
        }
        Ok(PausedExit::Resume)
    }

    async fn resume_connection(&self, events: &EventSink) -> Result<()> {
        self.set_state(TunnelState::Resuming);
        info!("Resuming...");
        let rendered_dns = match self.install_service(events).await {
            Ok(rendered_dns) => rendered_dns,
            Err(error) => {
                error!("Failed to resume connection (new connection error): {}", error);
                return Err(error.context("failed to resume connection"));
            }
        };
        self.mark_connected(rendered_dns);
        info!("Resumed");
        Ok(())
    }

    async fn restart_connection(&self, events: &EventSink) -> Result<Option<IpAddr>> {
        info!("Restarting...");
        self.uninstall_service()
            .await
            .map_err(|error| error.context("disconnection error"))?;
        let rendered_dns = self
            .install_service(events)
            .await
            .map_err(|error| error.context("new connection error"))?;
        info!("Connection restarted");
        Ok(rendered_dns)
    }

    /// Enters `Connected`. A manual DNS change that raced with the install
    /// left the tunnel on the resolver it was rendered with, so it schedules
    /// a restart.
    fn mark_connected(&self, rendered_dns: Option<IpAddr>) {
        self.set_state(TunnelState::Connected);
        if self.manual_dns() != rendered_dns {
            info!("DNS server IP configuration changed while connecting, restarting...");
            self.restart_requested.store(true, Ordering::SeqCst);
        }
    }

    /// Installs and starts the service, then reports the connection and
    /// applies the DNS policy for the resolver the configuration was rendered
    /// with, which is returned. A failed attempt never leaves a
    /// half-installed service behind.
    async fn install_service(&self, events: &EventSink) -> Result<Option<IpAddr>> {
        let rendered_dns = match self.install_and_wait().await {
            Ok(rendered_dns) => rendered_dns,
            Err(error) => {
                info!("Failed to install service. Uninstalling...");
                if let Err(cleanup_error) = self.uninstall_service().await {
                    error!(
                        "Failed to uninstall service after unsuccessful connect: {}",
                        cleanup_error
                    );
                }
                return Err(error);
            }
        };

        info!("Connection started");
        events.emit(StateInfo::connected(
            self.params.client_local_ip,
            self.params.host_ip,
        ));

        match rendered_dns {
            Some(address) => {
                if let Err(error) = self.dns.set_manual(address).await {
                    error!("Failed to set manual DNS: {}", error);
                }
            }
            None => {
                if let Err(error) = self.dns.delete_manual().await {
                    error!("Failed to delete manual DNS: {}", error);
                }
            }
        }
        Ok(rendered_dns)
    }

    async fn install_and_wait(&self) -> Result<Option<IpAddr>> {
        let _lock = self.install_lock.acquire().await;
        // A disconnect that came in while waiting for the lock or uninstalling
        // must not install the service again.
        self.ensure_not_disconnecting()?;
        info!("Connecting...");

        let rendered_dns = self.manual_dns();
        let config_file = write_tunnel_config(&self.config_path, &self.params, rendered_dns)
            .await
            .map_err(|error| error.context("failed to save config file"))?;

        info!("Installing service...");
        let installed = self
            .service
            .install(&self.binary_path, config_file.path())
            .await;
        drop(config_file);
        installed.map_err(|error| error.context("failed to install WireGuard service"))?;

        info!("Waiting for service install...");
        let this = self;
        let install_wait = RetryExecutor::new(self.timeouts.wait_interval, self.timeouts.install);
        if install_wait.run(move || this.probe_installed()).await? == WaitOutcome::TimedOut {
            return Err(ServiceError::InstallTimeout {
                seconds: self.timeouts.install.as_secs(),
            }
            .into());
        }
        info!("Service installed");

        info!("Waiting for service start...");
        let start_wait = RetryExecutor::new(self.timeouts.wait_interval, self.timeouts.start);
        if start_wait.run(move || this.probe_running()).await? == WaitOutcome::TimedOut {
            return Err(ServiceError::StartTimeout {
                seconds: self.timeouts.start.as_secs(),
            }
            .into());
        }
        info!("Service started");
        Ok(rendered_dns)
    }

    /// Stops and removes the service; succeeds right away when it is absent.
    async fn uninstall_service(&self) -> Result<()> {
        let _lock = self.install_lock.acquire().await;

        let status = self
            .service
            .query_status(&self.identity)
            .await
            .map_err(|error| error.context("failed to query tunnel service"))?;
        if !status.is_installed() {
            return Ok(());
        }

        info!("Uninstalling service...");
        self.issue_uninstall().await?;

        // The uninstall command sometimes has no effect; it is repeated on a
        // growing interval while the service keeps running.
        let this = self;
        let uninstall_wait =
            RetryExecutor::new(self.timeouts.poll_interval, self.timeouts.uninstall);
        let outcome = uninstall_wait
            .run_with_correction(
                move || this.probe_uninstalled(),
                Backoff::new(self.timeouts.uninstall_retry),
                move || this.issue_uninstall(),
            )
            .await?;
        if outcome == WaitOutcome::TimedOut {
            return Err(ServiceError::UninstallTimeout {
                seconds: self.timeouts.uninstall.as_secs(),
            }
            .into());
        }

        info!("Service uninstalled");
        Ok(())
    }

    async fn issue_uninstall(&self) -> Result<()> {
        self.service
            .uninstall(&self.binary_path, &self.identity)
            .await
            .map_err(|error| error.context("failed to uninstall WireGuard service"))
    }

    /// Query errors while waiting for the install are not fatal.
    async fn probe_installed(&self) -> Result<Probe<()>> {
        self.ensure_not_disconnecting()?;
        Ok(match self.service.query_status(&self.identity).await {
            Ok(status) if status.is_installed() => Probe::Ready(()),
            _ => Probe::Pending,
        })
    }

    async fn probe_running(&self) -> Result<Probe<()>> {
        self.ensure_not_disconnecting()?;
        let status = self
            .service
            .query_status(&self.identity)
            .await
            .map_err(|error| ServiceError::StartFailed {
                reason: error.to_string(),
            })?;
        match status {
            ServiceStatus::Running => Ok(Probe::Ready(())),
            ServiceStatus::Pending => Ok(Probe::Pending),
            ServiceStatus::Stopped => Err(ServiceError::StoppedDuringStart.into()),
            ServiceStatus::NotInstalled => Err(ServiceError::StartFailed {
                reason: "service disappeared".to_string(),
            }
            .into()),
        }
    }

    /// A service still running past a retry checkpoint gets the uninstall
    /// command again.
    async fn probe_uninstalled(&self) -> Result<Probe<()>> {
        Ok(match self.service.query_status(&self.identity).await {
            Ok(ServiceStatus::NotInstalled) => Probe::Ready(()),
            Ok(ServiceStatus::Running) => Probe::NeedsCorrection,
            _ => Probe::Pending,
        })
    }

    fn ensure_not_disconnecting(&self) -> Result<()> {
        if self.is_disconnect_requested() {
            return Err(ControllerError::DisconnectRequested.into());
        }
        Ok(())
    }
}

/// Closes the control channel and clears the re-entrancy flag however
/// `connect` ends, including when its future is dropped.
struct LoopGuard<'a>(&'a TunnelController);

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        *self.0.control_slot() = None;
        self.0.connect_running.store(false, Ordering::SeqCst);
    }
}
