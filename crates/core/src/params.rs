use std::{
    net::{IpAddr, SocketAddr},
    path::Path,
};

use base64::{Engine, engine::general_purpose};
use ini::{Ini, Properties};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::{ConfigurationError, Error, Result};

const KEY_LENGTH: usize = 32;
const DEFAULT_PERSISTENT_KEEPALIVE: u16 = 25;

/// Everything needed to materialize one tunnel configuration.
/// Set once when the controller is built; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub client_local_ip: IpAddr,
    pub host_local_ip: IpAddr,
    /// Public address of the tunnel host, reported in the connected event.
    pub host_ip: IpAddr,
    pub host_port: u16,
    pub host_public_key: String,
    pub client_private_key: String,
    pub allowed_ips: Vec<IpNet>,
    pub mtu: Option<u16>,
    pub persistent_keepalive: Option<u16>,
}

impl ConnectionParameters {
    pub fn new(
        client_local_ip: IpAddr,
        host_local_ip: IpAddr,
        host_endpoint: SocketAddr,
        client_private_key: impl Into<String>,
        host_public_key: impl Into<String>,
    ) -> Result<Self> {
        let params = Self {
            client_local_ip,
            host_local_ip,
            host_ip: host_endpoint.ip(),
            host_port: host_endpoint.port(),
            host_public_key: host_public_key.into(),
            client_private_key: client_private_key.into(),
            allowed_ips: default_allowed_ips(),
            mtu: None,
            persistent_keepalive: Some(DEFAULT_PERSISTENT_KEEPALIVE),
        };
        params.validate()?;
        Ok(params)
    }

    pub fn host_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.host_ip, self.host_port)
    }

    pub fn validate(&self) -> Result<()> {
        validate_key("PrivateKey", &self.client_private_key)?;
        validate_key("PublicKey", &self.host_public_key)?;
        if self.host_port == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "Endpoint".to_string(),
                reason: "port must not be zero".to_string(),
            }
            .into());
        }
        if self.allowed_ips.is_empty() {
            return Err(ConfigurationError::MissingField {
                field: "AllowedIPs".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Reads a WireGuard client configuration. The host tunnel-local IP is
    /// taken from the `DNS` entry of `[Interface]`, which the tunnel host
    /// serves on its own tunnel address.
    pub fn from_wireguard_file(config_path: &Path) -> Result<Self> {
        let config = Ini::load_from_file(config_path).map_err(|error| match error {
            ini::Error::Io(io_error) if io_error.kind() == std::io::ErrorKind::NotFound => {
                Error::from(ConfigurationError::FileNotFound {
                    path: config_path.display().to_string(),
                })
            }
            other => ConfigurationError::InvalidFile {
                reason: format!("Failed to read config file: {}", other),
            }
            .into(),
        })?;
        Self::from_wireguard_ini(&config)
    }

    pub fn from_wireguard_ini(config: &Ini) -> Result<Self> {
        let interface = config
            .section(Some("Interface"))
            .ok_or(ConfigurationError::MissingField {
                field: "[Interface] section".to_string(),
            })?;
        let peer = config
            .section(Some("Peer"))
            .ok_or(ConfigurationError::MissingField {
                field: "[Peer] section".to_string(),
            })?;

        let client_private_key = required(interface, "PrivateKey")?.to_string();

        let addresses = parse_networks("Address", required(interface, "Address")?)?;
        let client_local_ip = addresses
            .iter()
            .find(|network| network.addr().is_ipv4())
            .or_else(|| addresses.first())
            .ok_or(ConfigurationError::MissingField {
                field: "Address".to_string(),
            })?
            .addr();

        let host_local_ip = parse_dns_servers(interface)
            .into_iter()
            .next()
            .ok_or(ConfigurationError::MissingField {
                field: "DNS".to_string(),
            })?;

        let host_public_key = required(peer, "PublicKey")?.to_string();

        let endpoint: SocketAddr =
            required(peer, "Endpoint")?
                .parse()
                .map_err(|e| ConfigurationError::InvalidValue {
                    field: "Endpoint".to_string(),
                    reason: format!("{}", e),
                })?;

        let allowed_ips = match peer.get("AllowedIPs") {
            Some(value) => parse_networks("AllowedIPs", value)?,
            None => default_allowed_ips(),
        };

        let mtu = interface
            .get("MTU")
            .map(|value| parse_number("MTU", value))
            .transpose()?;
        let persistent_keepalive = match peer.get("PersistentKeepalive") {
            Some(value) => Some(parse_number("PersistentKeepalive", value)?),
            None => Some(DEFAULT_PERSISTENT_KEEPALIVE),
        };

        let params = Self {
            client_local_ip,
            host_local_ip,
            host_ip: endpoint.ip(),
            host_port: endpoint.port(),
            host_public_key,
            client_private_key,
            allowed_ips,
            mtu,
            persistent_keepalive,
        };
        params.validate()?;
        Ok(params)
    }
}

fn default_allowed_ips() -> Vec<IpNet> {
    vec![IpNet::V4(Ipv4Net::default()), IpNet::V6(Ipv6Net::default())]
}

fn required<'a>(section: &'a Properties, field: &str) -> Result<&'a str> {
    section.get(field).ok_or_else(|| {
        ConfigurationError::MissingField {
            field: field.to_string(),
        }
        .into()
    })
}

fn validate_key(field: &str, key: &str) -> Result<()> {
    let decoded = general_purpose::STANDARD
        .decode(key.trim())
        .map_err(|e| ConfigurationError::InvalidValue {
            field: field.to_string(),
            reason: e.to_string(),
        })?;
    if decoded.len() != KEY_LENGTH {
        return Err(ConfigurationError::InvalidValue {
            field: field.to_string(),
            reason: format!("must be exactly {KEY_LENGTH} bytes, got {}", decoded.len()),
        }
        .into());
    }
    Ok(())
}

fn parse_networks(field: &str, value: &str) -> Result<Vec<IpNet>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            // A bare address is a host route.
            part.parse::<IpNet>()
                .or_else(|_| part.parse::<IpAddr>().map(IpNet::from))
                .map_err(|e| {
                    ConfigurationError::InvalidValue {
                        field: field.to_string(),
                        reason: format!("{part}: {e}"),
                    }
                    .into()
                })
        })
        .collect()
}

fn parse_number(field: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| {
            ConfigurationError::InvalidValue {
                field: field.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
}

fn parse_dns_servers(interface_section: &Properties) -> Vec<IpAddr> {
    if let Some(value) = interface_section.get("DNS") {
        value
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(|p| p.trim())
            .filter_map(|p| p.parse().ok())
            .collect()
    } else {
        Vec::new()
    }
}
