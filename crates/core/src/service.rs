use std::{
    fmt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, ServiceError},
    shell,
};

const SERVICE_NAME_PREFIX: &str = "WireGuardTunnel$";
const SERVICE_DOES_NOT_EXIST: &str = "1060";

/// Names under which one tunnel is known to the OS service manager.
/// Every controller materializing the same config path competes for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceIdentity {
    pub tunnel_name: String,
    pub service_name: String,
}

impl ServiceIdentity {
    /// The tunnel is named after the configuration file stem.
    pub fn from_config_path(config_path: &Path) -> Self {
        let tunnel_name = config_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            service_name: format!("{SERVICE_NAME_PREFIX}{tunnel_name}"),
            tunnel_name,
        }
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.service_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceStatus {
    NotInstalled,
    Running,
    Stopped,
    /// Installed, in any transitional state.
    Pending,
}

impl ServiceStatus {
    pub fn is_installed(self) -> bool {
        self != ServiceStatus::NotInstalled
    }
}

/// The OS service manager as seen by the tunnel controller.
///
/// Every operation is idempotent with respect to a service that is already
/// absent, so callers may repeat them freely.
#[async_trait]
pub trait TunnelService: Send + Sync {
    /// Installs and starts a tunnel service from `config_path`.
    async fn install(&self, binary_path: &Path, config_path: &Path) -> Result<()>;

    async fn query_status(&self, identity: &ServiceIdentity) -> Result<ServiceStatus>;

    /// Stops and removes the tunnel service.
    async fn uninstall(&self, binary_path: &Path, identity: &ServiceIdentity) -> Result<()>;
}

/// WireGuard tunnel services driven through the tunnel binary's
/// `/installtunnelservice` and `/uninstalltunnelservice` commands, with the
/// state read back from `sc query`.
pub struct WireGuardTunnelService {
    sc_binary: PathBuf,
}

impl WireGuardTunnelService {
    pub fn new() -> Self {
        Self {
            sc_binary: PathBuf::from("sc.exe"),
        }
    }

    pub fn with_sc_binary(sc_binary: impl Into<PathBuf>) -> Self {
        Self {
            sc_binary: sc_binary.into(),
        }
    }
}

impl Default for WireGuardTunnelService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelService for WireGuardTunnelService {
    async fn install(&self, binary_path: &Path, config_path: &Path) -> Result<()> {
        shell::exec(
            binary_path,
            [
                Path::new("/installtunnelservice").as_os_str(),
                config_path.as_os_str(),
            ],
        )
        .await
    }

    async fn query_status(&self, identity: &ServiceIdentity) -> Result<ServiceStatus> {
        let mut output = String::new();
        let result = shell::exec_and_process_output(
            &self.sc_binary,
            ["query", identity.service_name.as_str()],
            |line, _| {
                output.push_str(line);
                output.push('\n');
            },
        )
        .await;

        if let Some(status) = parse_sc_query(&output) {
            return Ok(status);
        }

        let reason = match result {
            Err(error) => error.to_string(),
            Ok(()) => format!("unrecognized output: {}", output.trim()),
        };
        Err(ServiceError::QueryFailed {
            service_name: identity.service_name.clone(),
            reason,
        }
        .into())
    }

    async fn uninstall(&self, binary_path: &Path, identity: &ServiceIdentity) -> Result<()> {
        shell::exec(
            binary_path,
            ["/uninstalltunnelservice", identity.tunnel_name.as_str()],
        )
        .await
    }
}

/// Tunnels brought up with `wg-quick` on unix hosts, with the state read back
/// from `wg show`.
///
/// `wg-quick down` needs the configuration the tunnel came up with, while the
/// controller removes its materialized copy right after the install. The
/// adapter therefore keeps its own copy in `state_dir`, named after the
/// tunnel, which is also the interface name.
pub struct WgQuickTunnelService {
    wg_binary: PathBuf,
    state_dir: PathBuf,
}

impl WgQuickTunnelService {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self::with_wg_binary("wg", state_dir)
    }

    pub fn with_wg_binary(wg_binary: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            wg_binary: wg_binary.into(),
            state_dir: state_dir.into(),
        }
    }

    fn kept_config(&self, tunnel_name: &str) -> PathBuf {
        self.state_dir.join(format!("{tunnel_name}.conf"))
    }
}

#[async_trait]
impl TunnelService for WgQuickTunnelService {
    async fn install(&self, binary_path: &Path, config_path: &Path) -> Result<()> {
        let identity = ServiceIdentity::from_config_path(config_path);
        let kept_config = self.kept_config(&identity.tunnel_name);

        tokio::fs::create_dir_all(&self.state_dir).await?;
        tokio::fs::copy(config_path, &kept_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&kept_config, std::fs::Permissions::from_mode(0o600))
                .await?;
        }

        let result = shell::exec(
            binary_path,
            [Path::new("up").as_os_str(), kept_config.as_os_str()],
        )
        .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&kept_config).await;
        }
        result
    }

    async fn query_status(&self, identity: &ServiceIdentity) -> Result<ServiceStatus> {
        let mut output = String::new();
        let result = shell::exec_and_process_output(
            &self.wg_binary,
            ["show", identity.tunnel_name.as_str()],
            |line, _| {
                output.push_str(line);
                output.push('\n');
            },
        )
        .await;

        match result {
            Ok(()) => Ok(ServiceStatus::Running),
            Err(_) if is_missing_interface(&output) => Ok(ServiceStatus::NotInstalled),
            Err(error) => Err(ServiceError::QueryFailed {
                service_name: identity.service_name.clone(),
                reason: error.to_string(),
            }
            .into()),
        }
    }

    async fn uninstall(&self, binary_path: &Path, identity: &ServiceIdentity) -> Result<()> {
        let kept_config = self.kept_config(&identity.tunnel_name);
        if self.query_status(identity).await? == ServiceStatus::NotInstalled {
            return remove_if_present(&kept_config).await;
        }

        // Without the kept copy, wg-quick resolves the bare name itself.
        let target = if tokio::fs::try_exists(&kept_config).await.unwrap_or(false) {
            kept_config.clone().into_os_string()
        } else {
            identity.tunnel_name.clone().into()
        };
        shell::exec(binary_path, [std::ffi::OsStr::new("down"), target.as_os_str()]).await?;
        remove_if_present(&kept_config).await
    }
}

fn is_missing_interface(output: &str) -> bool {
    output.contains("No such device") || output.contains("No such file or directory")
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error.into()),
        _ => Ok(()),
    }
}

/// Reads the service state out of `sc query` output.
fn parse_sc_query(output: &str) -> Option<ServiceStatus> {
    for line in output.lines() {
        let line = line.trim();
        if line.contains("FAILED") && line.contains(SERVICE_DOES_NOT_EXIST) {
            return Some(ServiceStatus::NotInstalled);
        }

        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim() != "STATE" {
            continue;
        }

        let code = value.split_whitespace().next()?;
        return Some(match code {
            "1" => ServiceStatus::Stopped,
            "4" => ServiceStatus::Running,
            _ => ServiceStatus::Pending,
        });
    }
    None
}
