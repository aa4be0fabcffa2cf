//! Container runtime access
//!
//! The orchestrator and resolver consume the runtime through the
//! [`ContainerRuntime`] trait; [`DockerRuntime`] is the bollard-backed
//! implementation. Live inspection through this trait is the ground truth
//! for "is it running" decisions, never the persisted or cached status.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::RemoveImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the orchestrator asks the runtime to create
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// KEY=VALUE pairs
    pub env: Vec<String>,
    /// Port the application listens on inside the container
    pub service_port: u16,
    /// Host-side port bound to the service port
    pub host_port: u16,
}

/// Live state derived from runtime inspection
#[derive(Debug, Clone, Default)]
pub struct ContainerState {
    pub running: bool,
    /// Bridge-network address of the container, when attached
    pub internal_addr: Option<String>,
    /// Service port advertised by the container's exposed-port set
    pub service_port: Option<u16>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container, returning its runtime-assigned id
    async fn create(&self, spec: &ContainerSpec) -> anyhow::Result<String>;
    async fn start(&self, container_id: &str) -> anyhow::Result<()>;
    async fn stop(&self, container_id: &str, grace: Duration) -> anyhow::Result<()>;
    async fn remove(&self, container_id: &str) -> anyhow::Result<()>;
    /// Inspect live state; an unknown container is an error
    async fn inspect(&self, container_id: &str) -> anyhow::Result<ContainerState>;
    async fn remove_image(&self, image: &str) -> anyhow::Result<()>;
}

/// Bollard-backed runtime against a local Docker daemon
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon.
    ///
    /// Connection priority:
    /// 1. Explicit endpoint from configuration
    /// 2. DOCKER_HOST environment variable
    /// 3. The default socket
    pub async fn connect(endpoint: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = endpoint {
            Self::connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host)?
        } else {
            Docker::connect_with_socket_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker socket: {}", e))?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION).map_err(
                |e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e),
            )
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker endpoint: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        let port_key = format!("{}/tcp", spec.service_port);

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        // Bridge networking, no restart policy: the platform decides when
        // containers run, not the daemon.
        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: Some("bridge".to_string()),
            auto_remove: Some(false),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("port is already allocated")
                    || err_str.contains("address already in use")
                {
                    anyhow::anyhow!(
                        "Host port {} is already in use by another container or process",
                        spec.host_port
                    )
                } else {
                    anyhow::anyhow!(
                        "Failed to create container '{}' from image '{}': {}",
                        spec.name,
                        spec.image,
                        e
                    )
                }
            })?;

        info!(
            container_id = %response.id,
            name = %spec.name,
            image = %spec.image,
            host_port = spec.host_port,
            "Created container"
        );

        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> anyhow::Result<()> {
        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start container '{}': {}", container_id, e))?;

        info!(container_id, "Started container");
        Ok(())
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => {
                info!(container_id, "Stopped container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id, "Container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to stop container: {}", e)),
        }
    }

    async fn remove(&self, container_id: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(_) => {
                debug!(container_id, "Removed container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(e) => {
                warn!(container_id, error = %e, "Failed to remove container");
                Ok(())
            }
        }
    }

    async fn inspect(&self, container_id: &str) -> anyhow::Result<ContainerState> {
        let info = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to inspect container '{}': {}", container_id, e))?;

        let running = info
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);

        let mut state = ContainerState {
            running,
            ..Default::default()
        };

        if let Some(network_settings) = info.network_settings {
            if let Some(networks) = network_settings.networks {
                state.internal_addr = networks
                    .get("bridge")
                    .or_else(|| networks.values().next())
                    .and_then(|endpoint| endpoint.ip_address.clone())
                    .filter(|addr| !addr.is_empty());
            }
            if let Some(ports) = network_settings.ports {
                state.service_port = service_port_from_keys(ports.keys().map(|k| k.as_str()));
            }
        }

        Ok(state)
    }

    async fn remove_image(&self, image: &str) -> anyhow::Result<()> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_image(image, Some(options), None).await {
            Ok(_) => {
                debug!(image, "Removed image");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(image, "Image not found");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to remove image '{}': {}", image, e)),
        }
    }
}

/// Pick the service port out of an exposed-port set like `{"3000/tcp"}`.
///
/// Web workloads conventionally sit on 80, 3000 or 8000; prefer those in
/// that order, then fall back to the lowest exposed port.
pub fn service_port_from_keys<'a>(keys: impl Iterator<Item = &'a str>) -> Option<u16> {
    let mut ports: Vec<u16> = keys
        .filter_map(|key| key.split('/').next())
        .filter_map(|p| p.parse().ok())
        .collect();
    ports.sort_unstable();

    for preferred in [80, 3000, 8000] {
        if ports.contains(&preferred) {
            return Some(preferred);
        }
    }
    ports.first().copied()
}
