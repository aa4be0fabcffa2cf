//! In-memory fakes and helpers shared by the integration tests
//!
//! Healthy fake containers are backed by real local TCP listeners so the
//! orchestrator's health gate and the proxy's forwarding path run against
//! actual sockets; unhealthy ones get an address nothing listens on.

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use slipway::build::{BuildArtifact, BuildPipeline};
use slipway::cache::{CacheTtls, LookupCache};
use slipway::deploy::{DeployRequest, Orchestrator, OrchestratorSettings};
use slipway::edge::{EdgeRegistrar, VhostConfig};
use slipway::ports::PortAllocator;
use slipway::proxy::{ProxyServer, ResolverSettings};
use slipway::retry::Backoff;
use slipway::runtime::{ContainerRuntime, ContainerSpec, ContainerState};
use slipway::store::{Database, DeploymentRecord};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

struct FakeContainer {
    spec: ContainerSpec,
    running: bool,
    healthy: bool,
    port: Option<u16>,
    server: Option<tokio::task::JoinHandle<()>>,
}

/// Container runtime over local TCP listeners
pub struct FakeRuntime {
    containers: DashMap<String, FakeContainer>,
    next_id: AtomicU64,
    unhealthy_next: AtomicBool,
    fail_next_start: AtomicBool,
    fail_stop_ids: Mutex<std::collections::HashSet<String>>,
    removed_containers: Mutex<Vec<String>>,
    removed_images: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            containers: DashMap::new(),
            next_id: AtomicU64::new(1),
            unhealthy_next: AtomicBool::new(false),
            fail_next_start: AtomicBool::new(false),
            fail_stop_ids: Mutex::new(std::collections::HashSet::new()),
            removed_containers: Mutex::new(Vec::new()),
            removed_images: Mutex::new(Vec::new()),
        }
    }

    /// The next created container will never accept connections
    pub fn set_unhealthy_next(&self) {
        self.unhealthy_next.store(true, Ordering::SeqCst);
    }

    /// The next start call fails
    pub fn set_fail_next_start(&self) {
        self.fail_next_start.store(true, Ordering::SeqCst);
    }

    /// Stop calls for this container fail
    pub fn set_fail_stop(&self, container_id: &str) {
        self.fail_stop_ids
            .lock()
            .unwrap()
            .insert(container_id.to_string());
    }

    pub fn is_running(&self, container_id: &str) -> bool {
        self.containers
            .get(container_id)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.containers.len()
    }

    pub fn spec_of(&self, container_id: &str) -> Option<ContainerSpec> {
        self.containers.get(container_id).map(|c| c.spec.clone())
    }

    pub fn was_removed(&self, container_id: &str) -> bool {
        self.removed_containers
            .lock()
            .unwrap()
            .iter()
            .any(|id| id == container_id)
    }

    pub fn removed_containers(&self) -> Vec<String> {
        self.removed_containers.lock().unwrap().clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.removed_images.lock().unwrap().clone()
    }
}

/// A minimal HTTP server answering 200 to every request
async fn spawn_http_ok(body: &'static str) -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (port, handle)
}

/// A port nothing listens on
fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let healthy = !self.unhealthy_next.swap(false, Ordering::SeqCst);
        self.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
                healthy,
                port: None,
                server: None,
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> anyhow::Result<()> {
        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            anyhow::bail!("injected start failure");
        }

        let healthy = self
            .containers
            .get(container_id)
            .map(|c| c.healthy)
            .ok_or_else(|| anyhow::anyhow!("no such container: {}", container_id))?;

        let (port, server) = if healthy {
            let (port, handle) = spawn_http_ok("ok from backend").await;
            (port, Some(handle))
        } else {
            (dead_port(), None)
        };

        let mut container = self
            .containers
            .get_mut(container_id)
            .ok_or_else(|| anyhow::anyhow!("no such container: {}", container_id))?;
        container.running = true;
        container.port = Some(port);
        container.server = server;

        Ok(())
    }

    async fn stop(&self, container_id: &str, _grace: Duration) -> anyhow::Result<()> {
        if self.fail_stop_ids.lock().unwrap().contains(container_id) {
            anyhow::bail!("injected stop failure for {}", container_id);
        }
        if let Some(mut container) = self.containers.get_mut(container_id) {
            if let Some(server) = container.server.take() {
                server.abort();
            }
            container.running = false;
            container.port = None;
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> anyhow::Result<()> {
        if let Some((_, mut container)) = self.containers.remove(container_id) {
            if let Some(server) = container.server.take() {
                server.abort();
            }
        }
        self.removed_containers
            .lock()
            .unwrap()
            .push(container_id.to_string());
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> anyhow::Result<ContainerState> {
        let container = self
            .containers
            .get(container_id)
            .ok_or_else(|| anyhow::anyhow!("no such container: {}", container_id))?;

        Ok(ContainerState {
            running: container.running,
            internal_addr: container.running.then(|| "127.0.0.1".to_string()),
            service_port: if container.running {
                container.port
            } else {
                None
            },
        })
    }

    async fn remove_image(&self, image: &str) -> anyhow::Result<()> {
        self.removed_images.lock().unwrap().push(image.to_string());
        Ok(())
    }
}

/// Build pipeline that mints image references without touching Docker
pub struct FakeBuilder {
    counter: AtomicU64,
    layered: Mutex<Vec<(String, HashMap<String, String>)>>,
}

impl FakeBuilder {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
            layered: Mutex::new(Vec::new()),
        }
    }

    pub fn layered(&self) -> Vec<(String, HashMap<String, String>)> {
        self.layered.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildPipeline for FakeBuilder {
    async fn build(&self, _source: &std::path::Path, name: &str) -> anyhow::Result<BuildArtifact> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(BuildArtifact {
            image: format!("{}:{}", name, n),
            service_port: 3000,
        })
    }

    async fn layer_env(
        &self,
        base_image: &str,
        env: &HashMap<String, String>,
    ) -> anyhow::Result<String> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.layered
            .lock()
            .unwrap()
            .push((base_image.to_string(), env.clone()));
        let repository = base_image.split(':').next().unwrap_or(base_image);
        Ok(format!("{}:{}", repository, n))
    }
}

/// Edge registrar that records registrations
pub struct FakeEdge {
    registrations: Mutex<Vec<(String, u16)>>,
    enabled: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl FakeEdge {
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(Vec::new()),
            enabled: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn registrations(&self) -> Vec<(String, u16)> {
        self.registrations.lock().unwrap().clone()
    }

    pub fn enabled(&self) -> Vec<String> {
        self.enabled.lock().unwrap().clone()
    }
}

#[async_trait]
impl EdgeRegistrar for FakeEdge {
    async fn register(&self, subdomain: &str, target_port: u16) -> anyhow::Result<VhostConfig> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("edge is down");
        }
        self.registrations
            .lock()
            .unwrap()
            .push((subdomain.to_string(), target_port));
        Ok(VhostConfig {
            host: format!("{}.platform.site", subdomain),
            available_path: PathBuf::new(),
            enabled_path: PathBuf::new(),
        })
    }

    async fn enable(&self, vhost: &VhostConfig) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("edge is down");
        }
        self.enabled.lock().unwrap().push(vhost.host.clone());
        Ok(())
    }
}

/// Everything an orchestration test needs, wired together
pub struct TestWorld {
    pub store: Arc<Database>,
    pub cache: Arc<LookupCache>,
    pub runtime: Arc<FakeRuntime>,
    pub builder: Arc<FakeBuilder>,
    pub edge: Arc<FakeEdge>,
    pub ports: Arc<PortAllocator>,
    pub orchestrator: Arc<Orchestrator>,
}

/// Build a world over its own port range (ranges must not overlap between
/// tests; they all bind real sockets)
pub fn world(port_start: u16, port_end: u16) -> TestWorld {
    let store = Arc::new(Database::open_in_memory().unwrap());
    let cache = Arc::new(LookupCache::new(CacheTtls::default()));
    let runtime = Arc::new(FakeRuntime::new());
    let builder = Arc::new(FakeBuilder::new());
    let edge = Arc::new(FakeEdge::new());
    let ports = Arc::new(PortAllocator::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        port_start,
        port_end,
        200,
    ));

    let settings = OrchestratorSettings {
        domain: "platform.site".to_string(),
        attach: Backoff::new(5, Duration::from_millis(50)),
        probe: Backoff::new(3, Duration::from_millis(50)),
        wake: Backoff::new(5, Duration::from_millis(50)),
        stop_grace: Duration::from_secs(1),
    };

    let runtime_dyn: Arc<dyn ContainerRuntime> = runtime.clone();
    let builder_dyn: Arc<dyn BuildPipeline> = builder.clone();
    let edge_dyn: Arc<dyn EdgeRegistrar> = edge.clone();

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        runtime_dyn,
        builder_dyn,
        edge_dyn,
        Arc::clone(&ports),
        settings,
    ));

    TestWorld {
        store,
        cache,
        runtime,
        builder,
        edge,
        ports,
        orchestrator,
    }
}

pub async fn deploy(world: &TestWorld, project_name: &str) -> DeploymentRecord {
    world
        .orchestrator
        .deploy(DeployRequest {
            source_path: PathBuf::from("/tmp"),
            project_name: project_name.to_string(),
            env: None,
        })
        .await
        .unwrap()
}

/// Start a proxy over the world on a fresh local port; returns the port and
/// the shutdown sender
pub async fn start_proxy(
    world: &TestWorld,
    fallback_upstream: Option<SocketAddr>,
) -> (u16, watch::Sender<bool>) {
    let port = dead_port();
    let bind_addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runtime_dyn: Arc<dyn ContainerRuntime> = world.runtime.clone();
    let settings = ResolverSettings {
        domain: "platform.site".to_string(),
        reserved_hosts: ["api".to_string()].into_iter().collect(),
        fallback_upstream,
        request_timeout: Duration::from_secs(5),
    };

    let proxy = ProxyServer::new(
        bind_addr,
        Arc::clone(&world.store),
        Arc::clone(&world.cache),
        runtime_dyn,
        Arc::clone(&world.orchestrator),
        settings,
        shutdown_rx,
    );
    tokio::spawn(proxy.run());

    assert!(
        wait_for_port(port, Duration::from_secs(5)).await,
        "proxy never came up on port {}",
        port
    );

    (port, shutdown_tx)
}

/// Wait for a port to become available (server listening)
pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send HTTP request with custom Host header (for proxy testing)
pub async fn http_get_with_host(
    port: u16,
    path: &str,
    host: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// A standalone upstream answering every request, for passthrough tests
pub async fn spawn_upstream(body: &'static str) -> SocketAddr {
    let (port, _handle) = spawn_http_ok(body).await;
    format!("127.0.0.1:{}", port).parse().unwrap()
}
