use slipway::build::{BuildPipeline, DockerfileBuilder};
use slipway::cache::{CacheTtls, LookupCache};
use slipway::config::Config;
use slipway::deploy::{Orchestrator, OrchestratorSettings};
use slipway::edge::{EdgeRegistrar, NginxEdge};
use slipway::ports::PortAllocator;
use slipway::proxy::{ProxyServer, ResolverSettings};
use slipway::reaper::IdleReaper;
use slipway::runtime::{ContainerRuntime, DockerRuntime};
use slipway::store::Database;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("slipway=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        path = %config_path.display(),
        domain = %config.platform.domain,
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Construct the shared services and inject them into each component
    let store = Arc::new(Database::open(&config.store.path)?);
    let cache = Arc::new(LookupCache::new(CacheTtls {
        snapshot: config.cache.snapshot_ttl(),
        reservation: config.cache.reservation_ttl(),
    }));
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::connect(config.docker.host.as_deref()).await?);
    let ports = Arc::new(PortAllocator::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        config.ports.start,
        config.ports.end,
        config.ports.max_attempts,
    ));
    let builder: Arc<dyn BuildPipeline> =
        Arc::new(DockerfileBuilder::new(config.docker.build_path.clone()));
    let edge: Arc<dyn EdgeRegistrar> = Arc::new(NginxEdge::new(
        config.platform.domain.clone(),
        config.edge.clone(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&runtime),
        builder,
        edge,
        Arc::clone(&ports),
        OrchestratorSettings::from_config(&config),
    ));

    // Idle reaper
    let reaper = IdleReaper::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&orchestrator),
        config.idle.threshold(),
        config.idle.sweep_interval(),
        shutdown_rx.clone(),
    );
    let reaper_handle = tokio::spawn(reaper.run());

    // Resolver/proxy
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::new(
        bind_addr,
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&runtime),
        Arc::clone(&orchestrator),
        ResolverSettings::from_config(&config),
        shutdown_rx,
    );
    let proxy_handle = tokio::spawn(proxy.run());

    info!(addr = %bind_addr, "Slipway control plane started");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = proxy_handle.await;
    let _ = reaper_handle.await;

    info!("Shutdown complete");
    Ok(())
}
