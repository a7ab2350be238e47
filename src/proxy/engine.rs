use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{request::Parts, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, info_span, instrument, warn, Span};

use super::{admin, client_identity, RequestContext};
use crate::balancer::{self, BackendDescriptor, BackendState, Strategy};
use crate::config::Config;
use crate::error::{ProxyError, Result as ProxyResult};
use crate::observability::{logging, metrics};
use crate::ratelimit::controller::{DEFAULT_CLEANUP_INTERVAL, DEFAULT_IDLE_TIMEOUT};
use crate::ratelimit::AdmissionController;

const LISTEN_BACKLOG: u32 = 1024;

/// One request/response pipeline: admission, selection and forwarding.
///
/// An instance is immutable once built; a configuration change builds a new
/// one rather than mutating this.
pub struct ReverseProxy {
    strategy: Arc<dyn Strategy>,
    limiter: Option<Arc<AdmissionController>>,
    clients: HashMap<String, reqwest::Client>,
    fallback_client: reqwest::Client,
    trust_forwarded_headers: bool,
    proxy_id: String,
    span: Span,
    terminated: watch::Sender<bool>,
}

/// Holds one active-connection slot on a backend until dropped
struct ConnectionGuard {
    backend: Arc<BackendState>,
}

impl ConnectionGuard {
    fn acquire(backend: Arc<BackendState>, already_counted: bool) -> Self {
        if !already_counted {
            backend.inc_active_connections();
        }
        Self { backend }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let remaining = self.backend.dec_active_connections();
        debug!("Released connection on backend {} ({} active)", self.backend.id(), remaining);
    }
}

impl ReverseProxy {
    pub fn new(
        strategy: Arc<dyn Strategy>,
        limiter: Option<Arc<AdmissionController>>,
        trust_forwarded_headers: bool,
        proxy_id: impl Into<String>,
    ) -> Result<Self> {
        let mut clients = HashMap::new();
        for backend in strategy.registry().get_backends() {
            clients.insert(backend.id().to_string(), build_client(backend.descriptor())?);
        }

        let fallback_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            strategy,
            limiter,
            clients,
            fallback_client,
            trust_forwarded_headers,
            proxy_id: proxy_id.into(),
            span: Span::none(),
            terminated: watch::channel(false).0,
        })
    }

    /// Build the whole pipeline from a validated configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let strategy = balancer::from_config(config);
        let limiter = config
            .token_bucket()
            .map(|bucket| Arc::new(AdmissionController::from_config(bucket)));
        if let Some(limiter) = &limiter {
            // exits on its own once this pipeline is dropped
            AdmissionController::spawn_cleanup(limiter, DEFAULT_CLEANUP_INTERVAL, DEFAULT_IDLE_TIMEOUT);
        }
        let proxy_id = config
            .logger
            .as_ref()
            .map(|logger| logger.service_name.clone())
            .unwrap_or_else(|| "lb-proxy".to_string());

        let mut proxy = Self::new(strategy, limiter, config.trust_forwarded_headers(), proxy_id)?;
        proxy.span = logging::service_span(config);
        Ok(proxy)
    }

    pub fn strategy(&self) -> &Arc<dyn Strategy> {
        &self.strategy
    }

    pub fn limiter(&self) -> Option<&Arc<AdmissionController>> {
        self.limiter.as_ref()
    }

    /// Abort every request still in flight on this instance
    pub fn terminate(&self) {
        self.terminated.send_replace(true);
    }

    async fn terminated(&self) {
        let mut rx = self.terminated.subscribe();
        let _ = rx.wait_for(|terminated| *terminated).await;
    }

    pub fn router(self: &Arc<Self>) -> Router {
        let parent = self.span.clone();

        Router::new()
            .route(
                "/ratelimit/:client_id",
                get(admin::get_limits)
                    .post(admin::create_limits)
                    .put(admin::update_limits)
                    .delete(admin::delete_limits),
            )
            .route("/lb/stats", get(stats_handler))
            .fallback(proxy_handler)
            .layer(TraceLayer::new_for_http().make_span_with(move |req: &Request| {
                info_span!(parent: &parent, "request", method = %req.method(), uri = %req.uri())
            }))
            .with_state(self.clone())
    }

    #[instrument(skip(self, req), fields(client = tracing::field::Empty, backend = tracing::field::Empty))]
    pub async fn handle_proxy_request(&self, req: Request, peer: Option<SocketAddr>) -> ProxyResult<Response> {
        let client_id = client_identity(req.headers(), peer, self.trust_forwarded_headers);
        let mut context = RequestContext::new(client_id, req.method().as_str(), req.uri().path());
        if let Some(request_id) = req.headers().get("x-request-id").and_then(|v| v.to_str().ok()) {
            context = context.with_request_id(request_id);
        }
        Span::current().record("client", context.client_id.as_str());

        if let Some(limiter) = &self.limiter {
            if !limiter.allow(&context.client_id) {
                debug!("Rejected request {} from {}: rate limit", context.request_id, context.client_id);
                metrics::record_rate_limited();
                metrics::record_request("rate_limited");
                return Err(ProxyError::RateLimitExceeded {
                    client_id: context.client_id,
                });
            }
        }

        let backend = match self.strategy.invoke(&context) {
            Some(backend) => backend,
            None => {
                warn!("No backend available for request {}", context.request_id);
                metrics::record_request("no_backend");
                return Err(ProxyError::NoBackendAvailable);
            }
        };
        Span::current().record("backend", backend.id());
        metrics::record_backend_selected(backend.id());

        let _slot = ConnectionGuard::acquire(backend.clone(), self.strategy.counts_connections());

        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::BadRequest(format!("Failed to read request body: {}", e)))?
            .to_bytes();

        let result = self.forward_request(&context, &backend, parts, body, peer).await;
        match &result {
            Ok(response) => {
                metrics::record_request("success");
                debug!(
                    "Completed request {} via {} with {} in {}ms",
                    context.request_id,
                    backend.id(),
                    response.status(),
                    context.start_time.elapsed().as_millis()
                );
            }
            Err(ProxyError::UpstreamTimeout { .. }) => metrics::record_request("upstream_timeout"),
            Err(_) => metrics::record_request("upstream_error"),
        }
        result
    }

    async fn forward_request(
        &self,
        context: &RequestContext,
        backend: &Arc<BackendState>,
        parts: Parts,
        body: Bytes,
        peer: Option<SocketAddr>,
    ) -> ProxyResult<Response> {
        let target_url = format!(
            "{}{}",
            backend.url().trim_end_matches('/'),
            parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );
        debug!("Forwarding request {} to {}", context.request_id, target_url);

        let client = self.clients.get(backend.id()).unwrap_or(&self.fallback_client);
        let mut request_builder = client.request(parts.method.clone(), &target_url);

        for (name, value) in parts.headers.iter() {
            if !is_hop_by_hop_header(name) && !is_rewritten_header(name) {
                request_builder = request_builder.header(name.clone(), value.clone());
            }
        }

        let peer_ip = peer.map(|addr| addr.ip().to_string()).unwrap_or_else(|| context.client_id.clone());
        let forwarded_for = match parts.headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(chain) if !chain.trim().is_empty() => format!("{}, {}", chain, peer_ip),
            _ => peer_ip,
        };

        request_builder = request_builder
            .header("X-Forwarded-For", forwarded_for)
            .header("X-Real-IP", context.client_id.as_str())
            .header("X-Request-ID", context.request_id.as_str())
            .header("X-Proxy-ID", self.proxy_id.as_str());

        if !body.is_empty() {
            request_builder = request_builder.body(body);
        }

        let upstream_start = Instant::now();
        let response = match request_builder.send().await {
            Ok(response) => response,
            Err(e) => return Err(self.upstream_failure(context, backend, upstream_start, e)),
        };

        let status = response.status();
        let headers = response.headers().clone();
        let response_body = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.upstream_failure(context, backend, upstream_start, e)),
        };

        let elapsed = upstream_start.elapsed();
        backend.record_outcome(elapsed, !status.is_server_error());
        metrics::record_upstream_response(backend.id(), elapsed.as_secs_f64());

        Ok(self.build_response(status, &headers, response_body, &context.request_id))
    }

    fn upstream_failure(
        &self,
        context: &RequestContext,
        backend: &Arc<BackendState>,
        started: Instant,
        e: reqwest::Error,
    ) -> ProxyError {
        let elapsed = started.elapsed();
        backend.record_outcome(elapsed, false);
        metrics::record_upstream_response(backend.id(), elapsed.as_secs_f64());

        if e.is_timeout() {
            warn!("Upstream {} timed out for request {}", backend.id(), context.request_id);
            ProxyError::UpstreamTimeout {
                backend_id: backend.id().to_string(),
            }
        } else {
            error!("Upstream request to {} failed for {}: {}", backend.id(), context.request_id, e);
            ProxyError::Upstream {
                backend_id: backend.id().to_string(),
                message: e.to_string(),
            }
        }
    }

    fn build_response(&self, status: StatusCode, headers: &HeaderMap, body: Bytes, request_id: &str) -> Response {
        let mut response_builder = Response::builder().status(status);

        for (name, value) in headers.iter() {
            if !is_hop_by_hop_header(name) && name.as_str() != "content-length" {
                response_builder = response_builder.header(name, value);
            }
        }

        if let Ok(value) = HeaderValue::from_str(request_id) {
            response_builder = response_builder.header("X-Request-ID", value);
        }

        response_builder
            .body(Body::from(body))
            .unwrap_or_else(|e| {
                error!("Failed to build response: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            })
    }

    pub fn get_statistics(&self) -> serde_json::Value {
        let mut stats = serde_json::json!({
            "proxy_id": self.proxy_id,
            "strategy": self.strategy.name(),
            "registry": self.strategy.registry().statistics(),
        });
        if let Some(limiter) = &self.limiter {
            stats["rate_limiter"] = limiter.get_statistics();
        }
        stats
    }
}

impl std::fmt::Debug for ReverseProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseProxy")
            .field("strategy", &self.strategy.name())
            .field("backends", &self.strategy.registry().len())
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}

fn build_client(descriptor: &BackendDescriptor) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(descriptor.connect_timeout)
        .timeout(descriptor.read_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .user_agent(concat!("lb-proxy/", env!("CARGO_PKG_VERSION")));

    if descriptor.max_connections > 0 {
        builder = builder.pool_max_idle_per_host(descriptor.max_connections);
    }

    builder
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create HTTP client for backend {}: {}", descriptor.id, e))
}

/// Bind a listener that may share its port with a previous instance
pub fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Serve `proxy` on `listener` until `shutdown` resolves and in-flight requests finish
pub async fn serve<F>(proxy: Arc<ReverseProxy>, listener: TcpListener, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Load balancer listening on {} ({})", addr, proxy.strategy.name());
    }

    axum::serve(
        listener,
        proxy.router().into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn proxy_handler(
    State(proxy): State<Arc<ReverseProxy>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
) -> Response {
    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    let result = tokio::select! {
        result = proxy.handle_proxy_request(req, peer) => result,
        _ = proxy.terminated() => Err(ProxyError::ShuttingDown),
    };
    match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn stats_handler(State(proxy): State<Arc<ReverseProxy>>) -> Json<serde_json::Value> {
    Json(proxy.get_statistics())
}

fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Headers the proxy sets itself on the upstream request
fn is_rewritten_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "host" | "content-length" | "x-forwarded-for" | "x-real-ip" | "x-request-id" | "x-proxy-id"
    )
}
