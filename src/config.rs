use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the platform control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Proxy server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Platform domain and reserved hostnames
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Container runtime connection
    #[serde(default)]
    pub docker: DockerConfig,

    /// Persisted store location
    #[serde(default)]
    pub store: StoreConfig,

    /// Host-port allocation range
    #[serde(default)]
    pub ports: PortsConfig,

    /// Lookup cache TTLs
    #[serde(default)]
    pub cache: CacheConfig,

    /// Idle reaping thresholds
    #[serde(default)]
    pub idle: IdleConfig,

    /// Health-gate and wake polling budgets
    #[serde(default)]
    pub health: HealthConfig,

    /// Edge/TLS vhost registration
    #[serde(default)]
    pub edge: EdgeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the resolver/proxy (default: 0.0.0.0)
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Listen port for the resolver/proxy (default: 8000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Upstream for traffic outside the platform domain and for reserved
    /// hostnames (the platform's own API/dashboard). Unset means such
    /// requests get a plain 404.
    pub fallback_upstream: Option<SocketAddr>,

    /// Per-request timeout for proxied requests in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_listen_port(),
            fallback_upstream: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlatformConfig {
    /// Apex domain under which deployments are exposed, e.g. "platform.site"
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Subdomain labels that bypass the resolver (the platform's own hosts)
    #[serde(default = "default_reserved_hosts")]
    pub reserved_hosts: Vec<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            reserved_hosts: default_reserved_hosts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Docker daemon endpoint; unset falls back to DOCKER_HOST and then
    /// common socket paths
    pub host: Option<String>,

    /// Grace period for container stops in seconds (default: 30)
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Path to the docker binary used for image builds (default: "docker")
    #[serde(default = "default_docker_path")]
    pub build_path: String,
}

impl DockerConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            stop_grace_secs: default_stop_grace(),
            build_path: default_docker_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// SQLite database path (default: "slipway.db")
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortsConfig {
    /// First host port handed to deployments (default: 4000)
    #[serde(default = "default_port_start")]
    pub start: u16,

    /// One past the last host port (default: 5000)
    #[serde(default = "default_port_end")]
    pub end: u16,

    /// Allocation attempts before giving up (default: 100)
    #[serde(default = "default_port_attempts")]
    pub max_attempts: u32,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
            max_attempts: default_port_attempts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// TTL for record snapshots and subdomain mappings in seconds
    /// (default: 3600)
    #[serde(default = "default_snapshot_ttl")]
    pub snapshot_ttl_secs: u64,

    /// TTL for negative port-reservation markers in seconds (default: 120)
    #[serde(default = "default_reservation_ttl")]
    pub reservation_ttl_secs: u64,
}

impl CacheConfig {
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            snapshot_ttl_secs: default_snapshot_ttl(),
            reservation_ttl_secs: default_reservation_ttl(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdleConfig {
    /// Seconds without proxied traffic before a container is stopped
    /// (default: 600)
    #[serde(default = "default_idle_threshold")]
    pub threshold_secs: u64,

    /// Seconds between reaper sweeps (default: 60)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl IdleConfig {
    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            threshold_secs: default_idle_threshold(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Attempts waiting for a new container's network attachment
    /// (default: 10)
    #[serde(default = "default_attach_attempts")]
    pub attach_attempts: u32,

    /// Seconds between network-attach polls (default: 3)
    #[serde(default = "default_attach_interval")]
    pub attach_interval_secs: u64,

    /// Health-gate probe attempts against a new revision (default: 10)
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,

    /// Seconds between health-gate probes (default: 1)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Attempts waiting for a woken container to report running
    /// (default: 10)
    #[serde(default = "default_wake_attempts")]
    pub wake_attempts: u32,

    /// Seconds between wake polls (default: 1)
    #[serde(default = "default_wake_interval")]
    pub wake_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            attach_attempts: default_attach_attempts(),
            attach_interval_secs: default_attach_interval(),
            probe_attempts: default_probe_attempts(),
            probe_interval_secs: default_probe_interval(),
            wake_attempts: default_wake_attempts(),
            wake_interval_secs: default_wake_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EdgeConfig {
    /// Directory for rendered vhost configs
    #[serde(default = "default_sites_available")]
    pub sites_available: String,

    /// Directory the web server loads enabled vhosts from
    #[serde(default = "default_sites_enabled")]
    pub sites_enabled: String,

    /// Directory holding fullchain.pem / privkey.pem for the platform domain
    #[serde(default = "default_cert_dir")]
    pub cert_dir: String,

    /// Command validating the edge configuration; empty string skips it
    #[serde(default = "default_check_command")]
    pub check_command: String,

    /// Command applying the edge configuration; empty string skips it
    #[serde(default = "default_reload_command")]
    pub reload_command: String,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            sites_available: default_sites_available(),
            sites_enabled: default_sites_enabled(),
            cert_dir: default_cert_dir(),
            check_command: default_check_command(),
            reload_command: default_reload_command(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        let config: Config = toml::from_str(&contents).map_err(|e| {
            anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.platform.domain.is_empty() {
            anyhow::bail!("platform.domain must not be empty");
        }
        if self.ports.start >= self.ports.end {
            anyhow::bail!(
                "ports.start ({}) must be below ports.end ({})",
                self.ports.start,
                self.ports.end
            );
        }
        if self.ports.max_attempts == 0 {
            anyhow::bail!("ports.max_attempts must be at least 1");
        }
        Ok(())
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_reserved_hosts() -> Vec<String> {
    vec!["api".to_string(), "www".to_string(), "admin".to_string()]
}

fn default_stop_grace() -> u64 {
    30
}

fn default_docker_path() -> String {
    "docker".to_string()
}

fn default_store_path() -> String {
    "slipway.db".to_string()
}

fn default_port_start() -> u16 {
    4000
}

fn default_port_end() -> u16 {
    5000
}

fn default_port_attempts() -> u32 {
    100
}

fn default_snapshot_ttl() -> u64 {
    3600
}

fn default_reservation_ttl() -> u64 {
    120
}

fn default_idle_threshold() -> u64 {
    600
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_attach_attempts() -> u32 {
    10
}

fn default_attach_interval() -> u64 {
    3
}

fn default_probe_attempts() -> u32 {
    10
}

fn default_probe_interval() -> u64 {
    1
}

fn default_wake_attempts() -> u32 {
    10
}

fn default_wake_interval() -> u64 {
    1
}

fn default_sites_available() -> String {
    "/etc/nginx/sites-available".to_string()
}

fn default_sites_enabled() -> String {
    "/etc/nginx/sites-enabled".to_string()
}

fn default_cert_dir() -> String {
    "/etc/letsencrypt/live/localhost".to_string()
}

fn default_check_command() -> String {
    "nginx -t".to_string()
}

fn default_reload_command() -> String {
    "systemctl reload nginx".to_string()
}
