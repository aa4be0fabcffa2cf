//! Deployment orchestration
//!
//! Creates fresh deployments and performs health-gated, zero-downtime
//! revision swaps. Every lifecycle-mutating sequence (deploy, redeploy,
//! wake, stop) runs under a per-deployment lease so a redeploy can never
//! interleave with a resolver-driven wake or a reaper-driven stop on the
//! same deployment.

use crate::build::BuildPipeline;
use crate::cache::LookupCache;
use crate::config::Config;
use crate::domains;
use crate::edge::EdgeRegistrar;
use crate::error::{Error, Result};
use crate::ports::PortAllocator;
use crate::retry::Backoff;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::store::{Database, DeploymentRecord, DeploymentStatus, NewDeployment};
use dashmap::DashMap;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// A deploy request handed over by the trigger subsystem
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// Source bundle with a Dockerfile produced by the build preparation
    pub source_path: PathBuf,
    pub project_name: String,
    pub env: Option<HashMap<String, String>>,
}

/// Polling budgets and lifecycle knobs
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Platform apex domain, used for logging the public URL
    pub domain: String,
    /// Waiting for a new container's network attachment
    pub attach: Backoff,
    /// Health gate against a new revision
    pub probe: Backoff,
    /// Waiting for a woken container to report running
    pub wake: Backoff,
    pub stop_grace: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            domain: config.platform.domain.clone(),
            attach: Backoff::new(
                config.health.attach_attempts,
                Duration::from_secs(config.health.attach_interval_secs),
            ),
            probe: Backoff::new(
                config.health.probe_attempts,
                Duration::from_secs(config.health.probe_interval_secs),
            ),
            wake: Backoff::new(
                config.health.wake_attempts,
                Duration::from_secs(config.health.wake_interval_secs),
            ),
            stop_grace: config.docker.stop_grace(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            attach: Backoff::new(10, Duration::from_secs(3)),
            probe: Backoff::new(10, Duration::from_secs(1)),
            wake: Backoff::new(10, Duration::from_secs(1)),
            stop_grace: Duration::from_secs(30),
        }
    }
}

/// Deployment orchestrator
pub struct Orchestrator {
    store: Arc<Database>,
    cache: Arc<LookupCache>,
    runtime: Arc<dyn ContainerRuntime>,
    builder: Arc<dyn BuildPipeline>,
    edge: Arc<dyn EdgeRegistrar>,
    ports: Arc<PortAllocator>,
    /// Per-deployment-id leases serializing lifecycle mutations
    leases: DashMap<String, Arc<Mutex<()>>>,
    probe_client: Client<HttpConnector, Empty<Bytes>>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Database>,
        cache: Arc<LookupCache>,
        runtime: Arc<dyn ContainerRuntime>,
        builder: Arc<dyn BuildPipeline>,
        edge: Arc<dyn EdgeRegistrar>,
        ports: Arc<PortAllocator>,
        settings: OrchestratorSettings,
    ) -> Self {
        let probe_client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Self {
            store,
            cache,
            runtime,
            builder,
            edge,
            ports,
            leases: DashMap::new(),
            probe_client,
            settings,
        }
    }

    fn lease(&self, id: &str) -> Arc<Mutex<()>> {
        self.leases
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Build, provision and expose a fresh deployment
    pub async fn deploy(&self, req: DeployRequest) -> Result<DeploymentRecord> {
        if req.project_name.trim().is_empty() {
            return Err(Error::Validation("project name is required".into()));
        }
        let slug = domains::slugify(&req.project_name);
        if slug.is_empty() {
            return Err(Error::Validation(
                "project name has no usable characters".into(),
            ));
        }

        let started = Instant::now();

        // 1. image build happens before anything is provisioned
        let artifact = self
            .builder
            .build(&req.source_path, &slug)
            .await
            .map_err(|e| Error::Runtime(format!("image build failed: {:#}", e)))?;

        // 2-3. host port + container
        let host_port = self.ports.allocate()?;
        let subdomain = domains::generate_subdomain(&req.project_name);
        let container_name = format!("slipway-{}", subdomain);
        let id = Uuid::new_v4().to_string();

        let lease = self.lease(&id);
        let _guard = lease.lock().await;

        let spec = ContainerSpec {
            name: container_name.clone(),
            image: artifact.image.clone(),
            env: env_to_vec(req.env.as_ref()),
            service_port: artifact.service_port,
            host_port,
        };

        let container_id = self
            .runtime
            .create(&spec)
            .await
            .map_err(|e| Error::Runtime(e.to_string()))?;

        if let Err(e) = self.runtime.start(&container_id).await {
            // abort without leaving the unstartable container behind
            let _ = self.runtime.remove(&container_id).await;
            return Err(Error::Runtime(e.to_string()));
        }

        // 5. edge registration is retried out-of-band on failure
        self.register_edge(&subdomain, host_port).await;

        // 6. persist + write-through
        let record = self.store.create(&NewDeployment {
            id,
            subdomain: subdomain.clone(),
            host_port,
            container_id,
            container_name,
            image: artifact.image,
            env: req.env,
        })?;
        self.cache.put_record(&record);

        info!(
            subdomain = %record.subdomain,
            url = %format!("https://{}.{}", record.subdomain, self.settings.domain),
            host_port,
            elapsed_secs = format!("{:.1}", started.elapsed().as_secs_f64()),
            "Deployment created"
        );

        Ok(record)
    }

    /// Swap a deployment onto a new revision with zero perceptible downtime.
    ///
    /// The old container serves until the new one has a network address and
    /// passes the health gate; a revision that never proves healthy is
    /// removed and the record is left exactly as it was.
    pub async fn redeploy(
        &self,
        id: &str,
        new_env: Option<HashMap<String, String>>,
    ) -> Result<DeploymentRecord> {
        let lease = self.lease(id);
        let _guard = lease.lock().await;

        let record = self
            .store
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("no deployment with id {}", id)))?;

        let env = new_env.or_else(|| record.env.clone()).unwrap_or_default();

        // 1. new image layered over the stored base reference
        let new_image = self
            .builder
            .layer_env(&record.image, &env)
            .await
            .map_err(|e| Error::Runtime(format!("image build failed: {:#}", e)))?;

        // the service port convention travels with the image; read it off
        // the live old container when possible
        let service_port = match self.runtime.inspect(&record.container_id).await {
            Ok(state) => state.service_port.unwrap_or(3000),
            Err(_) => 3000,
        };

        // 2. fresh container under a new name and port; old keeps serving
        let new_port = self.ports.allocate()?;
        let new_name = format!("slipway-{}-{}", record.subdomain, domains::short_id());

        let spec = ContainerSpec {
            name: new_name.clone(),
            image: new_image.clone(),
            env: env_to_vec(Some(&env)),
            service_port,
            host_port: new_port,
        };

        let new_cid = match self.runtime.create(&spec).await {
            Ok(cid) => cid,
            Err(e) => {
                self.discard_image(&new_image).await;
                return Err(Error::Runtime(e.to_string()));
            }
        };

        if let Err(e) = self.runtime.start(&new_cid).await {
            self.discard_revision(&new_cid, &new_image).await;
            return Err(Error::Runtime(e.to_string()));
        }

        // 3. wait for a network attachment
        let attach = self
            .settings
            .attach
            .run(|| {
                let runtime = Arc::clone(&self.runtime);
                let cid = new_cid.clone();
                async move {
                    match runtime.inspect(&cid).await {
                        Ok(state) if state.running => state
                            .internal_addr
                            .map(|addr| (addr, state.service_port.unwrap_or(service_port))),
                        _ => None,
                    }
                }
            })
            .await;

        let (addr, probe_port) = match attach {
            Ok(v) => v,
            Err(e) => {
                warn!(deployment = id, "New revision never attached to the network");
                self.discard_revision(&new_cid, &new_image).await;
                return Err(e);
            }
        };

        // 4. health gate: the swap only happens for a proven revision
        let probed = self
            .settings
            .probe
            .run(|| {
                let client = self.probe_client.clone();
                let url = format!("http://{}:{}/", addr, probe_port);
                async move { probe_ok(&client, &url).await.then_some(()) }
            })
            .await;

        if probed.is_err() {
            warn!(
                deployment = id,
                container_id = %new_cid,
                "New revision failed health checks; keeping previous revision"
            );
            self.discard_revision(&new_cid, &new_image).await;
            return Err(Error::HealthCheck {
                attempts: self.settings.probe.attempts,
            });
        }

        // 5. retire the old revision (best-effort) and commit the new one
        if let Err(e) = self
            .runtime
            .stop(&record.container_id, self.settings.stop_grace)
            .await
        {
            warn!(container_id = %record.container_id, error = %e, "Failed to stop previous container");
        }
        if let Err(e) = self.runtime.remove(&record.container_id).await {
            warn!(container_id = %record.container_id, error = %e, "Failed to remove previous container");
        }
        if let Err(e) = self.runtime.remove_image(&record.image).await {
            warn!(image = %record.image, error = %e, "Failed to remove previous image");
        }

        self.register_edge(&record.subdomain, new_port).await;

        self.store
            .update_revision(id, &new_cid, &new_name, &new_image, new_port, Some(&env))?;
        let updated = self
            .store
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("no deployment with id {}", id)))?;
        self.cache.put_record(&updated);

        info!(
            subdomain = %updated.subdomain,
            image = %updated.image,
            host_port = updated.host_port,
            "Revision swapped"
        );

        Ok(updated)
    }

    /// Start a stopped deployment's container and wait until it reports
    /// running. Safe to call when it is already running.
    pub async fn wake(&self, id: &str) -> Result<DeploymentRecord> {
        let lease = self.lease(id);
        let _guard = lease.lock().await;

        let record = self
            .store
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("no deployment with id {}", id)))?;

        // live state decides whether a start is needed, not the stored hint
        let running = self
            .runtime
            .inspect(&record.container_id)
            .await
            .map(|s| s.running)
            .unwrap_or(false);

        if !running {
            self.runtime
                .start(&record.container_id)
                .await
                .map_err(|e| Error::Runtime(e.to_string()))?;

            self.settings
                .wake
                .run(|| {
                    let runtime = Arc::clone(&self.runtime);
                    let cid = record.container_id.clone();
                    async move {
                        match runtime.inspect(&cid).await {
                            Ok(state) if state.running => Some(()),
                            _ => None,
                        }
                    }
                })
                .await?;

            info!(subdomain = %record.subdomain, "Deployment woken");
        }

        if record.status != DeploymentStatus::Running {
            self.store.set_status(id, DeploymentStatus::Running)?;
        }

        let updated = self
            .store
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("no deployment with id {}", id)))?;
        self.cache.put_record(&updated);

        Ok(updated)
    }

    /// Stop a deployment's container and record it stopped. The cache
    /// snapshot is refreshed in the same step so the resolver sees the
    /// stopped hint immediately instead of after the TTL lapses.
    pub async fn stop(&self, id: &str) -> Result<DeploymentRecord> {
        let lease = self.lease(id);
        let _guard = lease.lock().await;

        let record = self
            .store
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("no deployment with id {}", id)))?;

        self.runtime
            .stop(&record.container_id, self.settings.stop_grace)
            .await
            .map_err(|e| Error::Runtime(e.to_string()))?;

        self.store.set_status(id, DeploymentStatus::Stopped)?;

        let updated = self
            .store
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("no deployment with id {}", id)))?;
        self.cache.put_record(&updated);

        info!(subdomain = %updated.subdomain, "Deployment stopped");
        Ok(updated)
    }

    /// Register and enable the edge vhost; failures are logged for
    /// out-of-band retry, never fatal to the deploy
    async fn register_edge(&self, subdomain: &str, host_port: u16) {
        match self.edge.register(subdomain, host_port).await {
            Ok(vhost) => {
                if let Err(e) = self.edge.enable(&vhost).await {
                    warn!(subdomain, error = %e, "Edge enable failed; route needs out-of-band retry");
                }
            }
            Err(e) => {
                warn!(subdomain, error = %e, "Edge registration failed; route needs out-of-band retry");
            }
        }
    }

    async fn discard_revision(&self, container_id: &str, image: &str) {
        if let Err(e) = self.runtime.stop(container_id, Duration::from_secs(5)).await {
            warn!(container_id, error = %e, "Failed to stop rejected revision");
        }
        if let Err(e) = self.runtime.remove(container_id).await {
            warn!(container_id, error = %e, "Failed to remove rejected revision");
        }
        self.discard_image(image).await;
    }

    async fn discard_image(&self, image: &str) {
        if let Err(e) = self.runtime.remove_image(image).await {
            warn!(image, error = %e, "Failed to remove rejected image");
        }
    }
}

fn env_to_vec(env: Option<&HashMap<String, String>>) -> Vec<String> {
    let mut vars: Vec<String> = env
        .map(|e| e.iter().map(|(k, v)| format!("{}={}", k, v)).collect())
        .unwrap_or_default();
    vars.sort();
    vars
}

async fn probe_ok(client: &Client<HttpConnector, Empty<Bytes>>, url: &str) -> bool {
    let req = match Request::builder()
        .method("GET")
        .uri(url)
        .body(Empty::<Bytes>::new())
    {
        Ok(r) => r,
        Err(_) => return false,
    };

    match client.request(req).await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}
