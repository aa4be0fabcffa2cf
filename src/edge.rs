//! Edge/TLS vhost registration
//!
//! Deployments are reached through a TLS-terminating web server in front of
//! the platform. [`NginxEdge`] renders a vhost config per subdomain, drops it
//! in sites-available, links it into sites-enabled and reloads the server.
//! The produced endpoint is opaque to the rest of the platform.

use crate::config::EdgeConfig;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

/// A rendered, registered vhost
#[derive(Debug, Clone)]
pub struct VhostConfig {
    pub host: String,
    pub available_path: PathBuf,
    pub enabled_path: PathBuf,
}

#[async_trait]
pub trait EdgeRegistrar: Send + Sync {
    /// Render and write the vhost for a subdomain targeting a host port.
    /// Idempotent: re-registering rewrites the config in place.
    async fn register(&self, subdomain: &str, target_port: u16) -> anyhow::Result<VhostConfig>;

    /// Activate a registered vhost. Errors on invalid configuration.
    async fn enable(&self, vhost: &VhostConfig) -> anyhow::Result<()>;
}

/// Nginx sites-available/sites-enabled implementation
pub struct NginxEdge {
    domain: String,
    settings: EdgeConfig,
}

impl NginxEdge {
    pub fn new(domain: impl Into<String>, settings: EdgeConfig) -> Self {
        Self {
            domain: domain.into(),
            settings,
        }
    }

    async fn run_command(&self, command: &str) -> anyhow::Result<()> {
        if command.trim().is_empty() {
            return Ok(());
        }

        let words = shell_words::split(command)
            .map_err(|e| anyhow::anyhow!("Invalid edge command '{}': {}", command, e))?;
        let (program, args) = words
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("Empty edge command"))?;

        debug!(command, "Running edge command");
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to run '{}': {}", command, e))?;

        if !output.status.success() {
            anyhow::bail!(
                "Edge command '{}' failed: {}",
                command,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }
}

#[async_trait]
impl EdgeRegistrar for NginxEdge {
    async fn register(&self, subdomain: &str, target_port: u16) -> anyhow::Result<VhostConfig> {
        let host = format!("{}.{}", subdomain, self.domain);
        let contents = render_vhost(&host, &self.settings.cert_dir, target_port);

        let filename = format!("{}.conf", host);
        let available_path = PathBuf::from(&self.settings.sites_available).join(&filename);
        let enabled_path = PathBuf::from(&self.settings.sites_enabled).join(&filename);

        if let Some(parent) = available_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&available_path, contents)
            .map_err(|e| anyhow::anyhow!("Failed to write vhost config '{}': {}", available_path.display(), e))?;

        debug!(host = %host, target_port, "Wrote vhost config");

        Ok(VhostConfig {
            host,
            available_path,
            enabled_path,
        })
    }

    async fn enable(&self, vhost: &VhostConfig) -> anyhow::Result<()> {
        if let Some(parent) = vhost.enabled_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !vhost.enabled_path.exists() {
            std::os::unix::fs::symlink(&vhost.available_path, &vhost.enabled_path).map_err(
                |e| {
                    anyhow::anyhow!(
                        "Failed to enable vhost '{}': {}",
                        vhost.enabled_path.display(),
                        e
                    )
                },
            )?;
        }

        self.run_command(&self.settings.check_command).await?;
        self.run_command(&self.settings.reload_command).await?;

        info!(host = %vhost.host, "Edge vhost enabled");
        Ok(())
    }
}

/// Render the TLS-terminating vhost: port 80 redirects to HTTPS, port 443
/// proxies to the deployment's host port.
fn render_vhost(host: &str, cert_dir: &str, target_port: u16) -> String {
    format!(
        r#"server {{
  listen 80;
  server_name {host};
  return 301 https://$host$request_uri;
}}

server {{
  listen 443 ssl http2;
  server_name {host};

  ssl_certificate {cert_dir}/fullchain.pem;
  ssl_certificate_key {cert_dir}/privkey.pem;
  ssl_session_cache shared:SSL:10m;
  ssl_session_timeout 10m;
  ssl_protocols TLSv1.2 TLSv1.3;

  location / {{
    proxy_pass http://127.0.0.1:{target_port};
    proxy_set_header Host $host;
    proxy_set_header X-Real-IP $remote_addr;
    proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
    proxy_set_header X-Forwarded-Proto $scheme;
    proxy_http_version 1.1;
    proxy_set_header Upgrade $http_upgrade;
    proxy_set_header Connection $http_connection;
    proxy_buffering off;
  }}
}}
"#
    )
}
