//! HTTP server wiring guards, routing and forwarding together.

use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, error, info, warn};

use crate::config::{FloodgateConfig, KeySource};
use crate::error::{FloodgateError, Result};
use crate::ratelimit::{DecisionCounters, Limiter};

use super::guard::{client_ip, GuardOutcome, LimitGuard};
use super::proxy::Forwarder;
use super::router::Router;

/// Everything a request handler needs.
pub struct GatewayState {
    pub edge: LimitGuard,
    /// Per-upstream guard, applied after routing
    pub upstream: Option<LimitGuard>,
    pub router: Router,
    pub forwarder: Forwarder,
    pub counters: Arc<DecisionCounters>,
    /// Peers allowed to read `/metrics`
    pub metrics_allowed: HashSet<IpAddr>,
}

/// The HTTP gateway.
pub struct Gateway {
    /// Address to bind to
    listen: SocketAddr,
    state: Arc<GatewayState>,
}

impl Gateway {
    pub fn new(listen: SocketAddr, state: GatewayState) -> Self {
        Self {
            listen,
            state: Arc::new(state),
        }
    }

    /// Build limiters, storage connections and the routing table.
    pub async fn from_config(config: &FloodgateConfig) -> Result<Self> {
        let counters = Arc::new(DecisionCounters::new());

        let edge_limiter =
            Limiter::from_config("edge", &config.edge_limiter.limiter, counters.clone()).await?;
        let edge = LimitGuard::new(
            "edge",
            Arc::new(edge_limiter),
            config.edge_limiter.key.unwrap_or(KeySource::Ip),
            config.edge_limiter.failure_policy,
        );

        let upstream = match &config.proxy.limiter {
            Some(guard) => {
                let limiter = Limiter::from_config("upstream", &guard.limiter, counters.clone()).await?;
                Some(LimitGuard::new(
                    "upstream",
                    Arc::new(limiter),
                    KeySource::Upstream,
                    guard.failure_policy,
                ))
            }
            None => None,
        };

        let metrics_allowed = config
            .metrics
            .allowed_hosts
            .iter()
            .map(|host| {
                host.parse::<IpAddr>()
                    .map_err(|e| FloodgateError::Config(format!("metrics.allowed_hosts `{host}`: {e}")))
            })
            .collect::<Result<HashSet<_>>>()?;

        let state = GatewayState {
            edge,
            upstream,
            router: Router::from_config(&config.proxy)?,
            forwarder: Forwarder::new(config.server.upstream_timeout)?,
            counters,
            metrics_allowed,
        };

        Ok(Self::new(config.server.listen, state))
    }

    /// The axum application serving health, metrics and proxied traffic.
    pub fn app(&self) -> axum::Router {
        axum::Router::new()
            .route("/health", get(health))
            .route("/metrics", get(metrics))
            .fallback(proxy)
            .with_state(self.state.clone())
            .layer(CatchPanicLayer::new())
    }

    /// Serve until `signal` resolves, then drain open connections.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.listen).await?;
        info!(addr = %self.listen, "Gateway listening");

        axum::serve(
            listener,
            self.app().into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "Gateway server failed");
            FloodgateError::Io(e)
        })
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics(
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    if !state.metrics_allowed.contains(&peer.ip()) {
        debug!(peer = %peer.ip(), "Metrics request from client not in allowed_hosts");
        return reject(StatusCode::FORBIDDEN);
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.counters.render(),
    )
        .into_response()
}

async fn proxy(
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let client = client_ip(request.headers(), peer.ip());

    let key = state.edge.key(client, None);
    if let GuardOutcome::Reject(status) = state.edge.check(&key).await {
        return reject(status);
    }

    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().host());
    let Some(route) = state.router.route(host, request.uri().path()) else {
        debug!(host = ?host, path = %request.uri().path(), "No upstream for request");
        return (StatusCode::BAD_GATEWAY, "no upstream configured").into_response();
    };

    if let Some(guard) = &state.upstream {
        let key = guard.key(client, Some(&route.upstream.name));
        if let GuardOutcome::Reject(status) = guard.check(&key).await {
            return reject(status);
        }
    }

    debug!(client = %client, upstream = %route.upstream.name, path = %route.path, "Proxying request");
    let target = route.target(request.uri().query());
    match state.forwarder.forward(request, target).await {
        Ok(response) => {
            state.counters.record_proxied(&route.dest());
            response
        }
        Err(e) => {
            warn!(upstream = %route.upstream.name, error = %e, "Upstream request failed");
            (StatusCode::BAD_GATEWAY, "bad gateway").into_response()
        }
    }
}

fn reject(status: StatusCode) -> Response {
    (status, status.canonical_reason().unwrap_or("")).into_response()
}
