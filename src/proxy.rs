//! Subdomain resolver and reverse proxy
//!
//! Maps each inbound virtual host to a live backend container, waking
//! stopped containers on demand. The persisted/cached `status` is never
//! trusted for the routing decision; the container runtime is inspected
//! live on every request, and the container's *current* internal address is
//! targeted rather than any stored port.

use crate::cache::LookupCache;
use crate::deploy::Orchestrator;
use crate::domains;
use crate::error::text_response;
use crate::runtime::{ContainerRuntime, ContainerState};
use crate::store::{Database, DeploymentRecord};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Resolver behavior knobs
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// Platform apex domain; `*.{domain}` is managed traffic
    pub domain: String,
    /// Subdomain labels that bypass the resolver
    pub reserved_hosts: HashSet<String>,
    /// Where unmanaged and reserved traffic goes; None answers 404
    pub fallback_upstream: Option<SocketAddr>,
    pub request_timeout: Duration,
}

impl ResolverSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            domain: config.platform.domain.clone(),
            reserved_hosts: config.platform.reserved_hosts.iter().cloned().collect(),
            fallback_upstream: config.server.fallback_upstream,
            request_timeout: config.server.request_timeout(),
        }
    }
}

/// Shared state for request handling
struct ProxyContext {
    store: Arc<Database>,
    cache: Arc<LookupCache>,
    runtime: Arc<dyn ContainerRuntime>,
    orchestrator: Arc<Orchestrator>,
    client: Client<HttpConnector, Incoming>,
    settings: ResolverSettings,
}

/// The edge-facing reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        store: Arc<Database>,
        cache: Arc<LookupCache>,
        runtime: Arc<dyn ContainerRuntime>,
        orchestrator: Arc<Orchestrator>,
        settings: ResolverSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            bind_addr,
            ctx: Arc::new(ProxyContext {
                store,
                cache,
                runtime,
                orchestrator,
                client,
                settings,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, ctx: Arc<ProxyContext>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let hostname = match req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(domains::normalize_host)
    {
        Some(h) => h,
        None => {
            return Ok(text_response(
                StatusCode::BAD_REQUEST,
                "missing or invalid Host header",
            ));
        }
    };

    debug!(hostname = %hostname, method = %req.method(), uri = %req.uri(), "Incoming request");

    // Traffic outside *.{domain}, and reserved system hostnames, are not
    // this platform's routing responsibility
    let subdomain = match domains::subdomain_for_host(&hostname, &ctx.settings.domain) {
        Some(label) if !ctx.settings.reserved_hosts.contains(label) => label.to_string(),
        _ => return Ok(passthrough(req, &ctx).await),
    };

    let mut record = match resolve_record(&ctx, &subdomain) {
        Ok(Some(record)) => record,
        Ok(None) => {
            return Ok(text_response(StatusCode::NOT_FOUND, "subdomain not found"));
        }
        Err(e) => {
            error!(subdomain = %subdomain, error = %e, "Store lookup failed");
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error",
            ));
        }
    };

    // Live inspection is authoritative; an inspect failure (container gone,
    // stale handle) is the same as not running
    let mut state = ctx
        .runtime
        .inspect(&record.container_id)
        .await
        .unwrap_or_else(|_| ContainerState::default());

    if !state.running {
        record = match ctx.orchestrator.wake(&record.id).await {
            Ok(rec) => rec,
            Err(e) => {
                error!(subdomain = %subdomain, error = %e, "Failed to start backend");
                return Ok(text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to start backend",
                ));
            }
        };

        state = match ctx.runtime.inspect(&record.container_id).await {
            Ok(s) => s,
            Err(e) => {
                error!(subdomain = %subdomain, error = %e, "Backend vanished after wake");
                return Ok(text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to start backend",
                ));
            }
        };
    }

    // Every routed request resets the idle clock, wakes included
    if let Err(e) = ctx.store.touch(&record.id) {
        warn!(subdomain = %subdomain, error = %e, "Failed to refresh activity timestamp");
    }
    record.last_active_at = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
    ctx.cache.put_record(&record);

    // Target the container's current address, not the stored port (which
    // may be one redeploy stale)
    let addr = match state.internal_addr {
        Some(addr) => addr,
        None => {
            error!(subdomain = %subdomain, container_id = %record.container_id, "Backend has no internal address");
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "backend has no internal address",
            ));
        }
    };
    let port = state.service_port.unwrap_or(3000);

    if is_upgrade_request(&req) {
        return handle_upgrade(req, addr, port, subdomain).await;
    }

    Ok(forward(req, &ctx.client, &addr, port, ctx.settings.request_timeout).await)
}

/// Resolve a subdomain to a record: cache first, store on miss (populating
/// the cache on the way)
fn resolve_record(
    ctx: &ProxyContext,
    subdomain: &str,
) -> anyhow::Result<Option<DeploymentRecord>> {
    if let Some(id) = ctx.cache.get_subdomain(subdomain) {
        if let Some(snapshot) = ctx.cache.get_snapshot(&id) {
            return Ok(Some(snapshot));
        }
    }

    match ctx.store.get_by_subdomain(subdomain)? {
        Some(record) => {
            ctx.cache.put_record(&record);
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

/// Hand unmanaged traffic to the fallback upstream, or 404 without one
async fn passthrough(
    req: Request<Incoming>,
    ctx: &ProxyContext,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    match ctx.settings.fallback_upstream {
        Some(upstream) => {
            forward(
                req,
                &ctx.client,
                &upstream.ip().to_string(),
                upstream.port(),
                ctx.settings.request_timeout,
            )
            .await
        }
        None => text_response(StatusCode::NOT_FOUND, "not managed by this platform"),
    }
}

/// Headers that must not travel hop to hop
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_headers(headers: &mut hyper::HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Forward a request to `http://{addr}:{port}` and relay the response
/// verbatim. A single network failure yields a single 5xx; there is no
/// retry.
async fn forward(
    mut req: Request<Incoming>,
    client: &Client<HttpConnector, Incoming>,
    addr: &str,
    port: u16,
    timeout: Duration,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    strip_hop_headers(req.headers_mut());

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("http://{}:{}{}", addr, port, path);

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(&uri);
    for (key, value) in parts.headers.iter() {
        builder = builder.header(key, value);
    }

    let backend_req = match builder.body(body) {
        Ok(r) => r,
        Err(e) => {
            error!(uri = %uri, error = %e, "Failed to build backend request");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
        }
    };

    match tokio::time::timeout(timeout, client.request(backend_req)).await {
        Ok(Ok(response)) => {
            let (parts, body) = response.into_parts();
            Response::from_parts(parts, body.boxed())
        }
        Ok(Err(e)) => {
            error!(uri = %uri, error = %e, "Failed to reach backend");
            text_response(StatusCode::BAD_GATEWAY, "failed to reach backend")
        }
        Err(_) => {
            warn!(uri = %uri, timeout_secs = timeout.as_secs(), "Backend request timed out");
            text_response(StatusCode::GATEWAY_TIMEOUT, "backend request timed out")
        }
    }
}

/// Check if a request is a WebSocket/HTTP upgrade request
fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Build the raw HTTP upgrade request to send to the backend
fn build_upgrade_request(req: &Request<Incoming>, addr: &str, port: u16) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}:{}\r\n", addr, port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the backend's response head, looking for 101 Switching Protocols
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Forward bytes bidirectionally between client and backend after an upgrade
async fn forward_bidirectional(client: Upgraded, backend: TcpStream, subdomain: &str) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = backend;

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                subdomain,
                client_to_backend, backend_to_client, "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(subdomain, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Handle a WebSocket/HTTP upgrade request against the backend's internal
/// address
async fn handle_upgrade(
    req: Request<Incoming>,
    addr: String,
    port: u16,
    subdomain: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    debug!(subdomain = %subdomain, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, &addr, port);

    let backend_addr = format!("{}:{}", addr, port);
    let mut backend_stream = match TcpStream::connect(&backend_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(subdomain = %subdomain, backend = %backend_addr, error = %e, "Failed to connect for upgrade");
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                "failed to reach backend",
            ));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(subdomain = %subdomain, error = %e, "Failed to send upgrade request");
        return Ok(text_response(
            StatusCode::BAD_GATEWAY,
            "failed to reach backend",
        ));
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match backend_stream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            error!(subdomain = %subdomain, "Backend closed connection before upgrade response");
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                "backend closed connection",
            ));
        }
        Err(e) => {
            error!(subdomain = %subdomain, error = %e, "Failed to read upgrade response");
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                "failed to reach backend",
            ));
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&response_buf[..n]) {
        Some(parsed) => parsed,
        None => {
            error!(subdomain = %subdomain, "Invalid upgrade response from backend");
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                "invalid upgrade response from backend",
            ));
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(subdomain = %subdomain, status = %status, "Backend rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(subdomain = %subdomain, "Upgrade successful");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, backend_stream, &subdomain).await;
            }
            Err(e) => {
                error!(subdomain = %subdomain, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}
