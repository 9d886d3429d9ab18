use std::{
    net::IpAddr,
    path::{Path, PathBuf},
};

use handlebars::Handlebars;
use serde::Serialize;
use tokio::{
    fs::{OpenOptions, create_dir_all},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};

use crate::{
    error::{ConfigurationError, Result},
    params::ConnectionParameters,
};

#[derive(Serialize)]
struct TunnelConfigContext {
    client_private_key: String,
    client_local_ip: String,
    dns: String,
    mtu: Option<u16>,
    host_public_key: String,
    endpoint: String,
    allowed_ips: String,
    persistent_keepalive: Option<u16>,
}

/// Renders the tunnel binary's configuration. `manual_dns` replaces the
/// host tunnel-local resolver when set.
pub fn render_tunnel_config(
    params: &ConnectionParameters,
    manual_dns: Option<IpAddr>,
) -> Result<String> {
    let template_text: &str = include_str!("templates/tunnel_config.hbs");

    let context = TunnelConfigContext {
        client_private_key: params.client_private_key.clone(),
        client_local_ip: params.client_local_ip.to_string(),
        dns: manual_dns.unwrap_or(params.host_local_ip).to_string(),
        mtu: params.mtu,
        host_public_key: params.host_public_key.clone(),
        endpoint: params.host_endpoint().to_string(),
        allowed_ips: params
            .allowed_ips
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
        persistent_keepalive: params.persistent_keepalive,
    };

    let mut handlebars_registry = Handlebars::new();
    // Base64 keys end in '=', which the HTML escaper would mangle.
    handlebars_registry.register_escape_fn(handlebars::no_escape);

    let config = handlebars_registry
        .render_template(template_text, &context)
        .map_err(|error| ConfigurationError::TemplateRender {
            reason: error.to_string(),
        })?;
    Ok(config)
}

/// Writes the configuration (create or overwrite, owner-only on unix) and
/// returns a guard that deletes the file when dropped.
pub async fn write_tunnel_config(
    path: &Path,
    params: &ConnectionParameters,
    manual_dns: Option<IpAddr>,
) -> Result<ConfigFileGuard> {
    let config = render_tunnel_config(params, manual_dns)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent).await?;
        }
    }

    // Armed before the write so a partially written file is removed too.
    let guard = ConfigFileGuard::new(path);

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;

    #[cfg(unix)]
    {
        // `mode` only applies when the file is created.
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await?;
    }

    file.write_all(config.as_bytes()).await?;
    file.flush().await?;
    debug!("Tunnel configuration written to {}", path.display());

    Ok(guard)
}

/// Deletes the materialized configuration on drop, whatever the outcome of
/// the install that consumed it.
#[derive(Debug)]
pub struct ConfigFileGuard {
    path: PathBuf,
}

impl ConfigFileGuard {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ConfigFileGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Tunnel configuration {} removed", self.path.display()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => warn!(
                "Failed to remove tunnel configuration {}: {}",
                self.path.display(),
                error
            ),
        }
    }
}
