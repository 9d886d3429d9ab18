use std::{collections::HashMap, net::IpAddr, path::PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    error::{DnsError, Result},
    shell,
};

/// Host-wide DNS override applied next to the tunnel's own resolver.
#[async_trait]
pub trait DnsOverride: Send + Sync {
    async fn set_manual(&self, address: IpAddr) -> Result<()>;

    /// Removes any override; a no-op when none is active.
    async fn delete_manual(&self) -> Result<()>;
}

/// For platforms where the tunnel's own DNS setting is sufficient.
#[derive(Debug, Default)]
pub struct UnmanagedDns;

#[async_trait]
impl DnsOverride for UnmanagedDns {
    async fn set_manual(&self, address: IpAddr) -> Result<()> {
        debug!("Manual DNS {} left to the tunnel configuration", address);
        Ok(())
    }

    async fn delete_manual(&self) -> Result<()> {
        Ok(())
    }
}

/// Overrides DNS on every enabled macOS network service with `networksetup`,
/// remembering the original servers so they can be restored.
pub struct NetworkSetupDns {
    binary: PathBuf,
    original_servers_by_service: Mutex<Option<HashMap<String, Option<Vec<String>>>>>,
}

impl NetworkSetupDns {
    pub fn new() -> Self {
        Self::with_binary("/usr/sbin/networksetup")
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            original_servers_by_service: Mutex::new(None),
        }
    }

    async fn list_enabled_network_services(&self) -> Result<Vec<String>> {
        let mut output = Vec::new();
        shell::exec_and_process_output(&self.binary, ["-listallnetworkservices"], |line, is_error| {
            if !is_error {
                output.push(line.to_string());
            }
        })
        .await?;
        Ok(parse_network_services(&output))
    }

    async fn get_servers(&self, network_service_name: &str) -> Result<Option<Vec<String>>> {
        let mut output = Vec::new();
        shell::exec_and_process_output(
            &self.binary,
            ["-getdnsservers", network_service_name],
            |line, is_error| {
                if !is_error {
                    output.push(line.to_string());
                }
            },
        )
        .await?;
        Ok(parse_dns_servers(&output))
    }

    async fn set_servers(&self, network_service_name: &str, servers: Option<&[String]>) -> Result<()> {
        let mut args = vec!["-setdnsservers".to_string(), network_service_name.to_string()];
        match servers {
            Some(list) if !list.is_empty() => args.extend(list.iter().cloned()),
            // "Empty" clears the servers of the service.
            _ => args.push("Empty".to_string()),
        }
        shell::exec(&self.binary, &args).await
    }
}

impl Default for NetworkSetupDns {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsOverride for NetworkSetupDns {
    async fn set_manual(&self, address: IpAddr) -> Result<()> {
        let mut originals = self.original_servers_by_service.lock().await;

        let map_error = |error: crate::error::Error| DnsError::SetFailed {
            address: address.to_string(),
            reason: error.to_string(),
        };

        if originals.is_none() {
            let network_service_names = self
                .list_enabled_network_services()
                .await
                .map_err(map_error)?;
            if network_service_names.is_empty() {
                return Err(DnsError::NoNetworkServices.into());
            }
            let mut saved = HashMap::new();
            for network_service_name in network_service_names {
                let current = self
                    .get_servers(&network_service_name)
                    .await
                    .map_err(map_error)?;
                debug!("Original DNS for {}: {:?}", network_service_name, current);
                saved.insert(network_service_name, current);
            }
            *originals = Some(saved);
        }

        let desired = [address.to_string()];
        if let Some(saved) = originals.as_ref() {
            for network_service_name in saved.keys() {
                self.set_servers(network_service_name, Some(&desired))
                    .await
                    .map_err(map_error)?;
            }
        }
        info!("Manual DNS set to {}", address);
        Ok(())
    }

    async fn delete_manual(&self) -> Result<()> {
        let mut originals = self.original_servers_by_service.lock().await;
        let Some(saved) = originals.take() else {
            return Ok(());
        };

        for (network_service_name, original) in &saved {
            debug!("Restoring DNS for {}: {:?}", network_service_name, original);
            if let Err(error) = self
                .set_servers(network_service_name, original.as_deref())
                .await
            {
                // Keep the originals so a later call can retry.
                *originals = Some(saved.clone());
                return Err(DnsError::DeleteFailed {
                    reason: error.to_string(),
                }
                .into());
            }
        }
        info!("Manual DNS removed");
        Ok(())
    }
}

fn parse_network_services(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        // First line is a legend about disabled services.
        .skip(1)
        .map(|line| line.trim())
        // Disabled services are marked with an asterisk.
        .filter(|line| !line.is_empty() && !line.starts_with('*'))
        .map(str::to_string)
        .collect()
}

fn parse_dns_servers(lines: &[String]) -> Option<Vec<String>> {
    if lines
        .iter()
        .any(|line| line.contains("aren't any DNS Servers set"))
    {
        return None;
    }
    Some(
        lines
            .iter()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
    )
}
