use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::GatewayError;
use crate::health;
use crate::observability::{self, Observability};
use super::{
    forwarder::{Forwarder, InboundRequest},
    router::RouteTable,
    upstream::UpstreamRegistry,
    ProxyOutcome,
};

/// The API gateway: static route table, pooled forwarder and observability
/// sinks, shared immutably by all in-flight requests.
pub struct Gateway {
    config: Arc<Config>,
    upstreams: UpstreamRegistry,
    routes: RouteTable,
    forwarder: Forwarder,
    observability: Observability,
}

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

impl Gateway {
    pub fn new(config: Config, observability: Observability) -> Result<Self> {
        config.validate()?;

        let upstreams = UpstreamRegistry::from_config(&config.upstreams);
        let routes = RouteTable::from_config(&config.routing, &upstreams)?;
        let forwarder = Forwarder::new(&config.client)?;

        for rule in routes.rules() {
            info!("Route {} -> {} ({})", rule.path_prefix, rule.target.name, rule.target.base_url);
        }

        Ok(Self {
            config: Arc::new(config),
            upstreams,
            routes,
            forwarder,
            observability,
        })
    }

    pub fn upstreams(&self) -> &UpstreamRegistry {
        &self.upstreams
    }

    /// Build the axum application: introspection endpoints, optional metrics,
    /// and the proxy fallback for everything else.
    pub fn router(self: Arc<Self>) -> Router {
        let state = AppState { gateway: self.clone() };

        // Non-GET verbs on the introspection paths are proxied like any
        // other path.
        let mut app = Router::new()
            .route("/health", get(health::health_check).fallback(proxy_handler))
            .route("/gateway/status", get(health::gateway_status).fallback(proxy_handler))
            .route("/gateway/services", get(health::gateway_services).fallback(proxy_handler));

        if self.observability.metrics.is_enabled() {
            app = app.route(self.observability.metrics.path(), get(metrics_handler));
        }

        let mut app = app
            .fallback(proxy_handler)
            .with_state(state)
            .layer(middleware::from_fn_with_state(
                self.observability.clone(),
                observability::record_requests,
            ))
            .layer(TraceLayer::new_for_http());

        if self.config.cors.enabled {
            app = app.layer(CorsLayer::permissive());
        }

        app
    }

    /// Route and forward a single request, translating failures into
    /// client-safe responses.
    pub async fn handle_proxy_request(&self, req: Request) -> Response {
        let path = req.uri().path().to_string();

        let Some(rule) = self.routes.route(&path) else {
            warn!("No route matched path {:?}", path);
            return GatewayError::RouteNotFound(path).into_response();
        };
        let target = rule.target.clone();

        let inbound = InboundRequest::from_request(req);
        let upstream_url = target.url_for(&inbound.path, inbound.query.as_deref());

        let (mut response, outcome) = match self.forwarder.forward(inbound, &target).await {
            Ok(proxy_response) => {
                let upstream_response_time = Some(proxy_response.upstream_response_time);
                (
                    proxy_response.into_response(),
                    ProxyOutcome {
                        upstream: target.name.clone(),
                        upstream_url,
                        outcome: "ok",
                        upstream_response_time,
                    },
                )
            }
            Err(err) => {
                let outcome = match err.proxy_kind() {
                    Some(kind) => {
                        self.observability
                            .metrics
                            .record_upstream_error(&target.name, kind.as_str());
                        kind.as_str()
                    }
                    None => {
                        warn!(upstream = %target.name, "Request not forwarded: {}", err);
                        "rejected"
                    }
                };
                (
                    err.into_response(),
                    ProxyOutcome {
                        upstream: target.name.clone(),
                        upstream_url,
                        outcome,
                        upstream_response_time: None,
                    },
                )
            }
        };

        response.extensions_mut().insert(outcome);
        response
    }

    /// Serve on `listener` until `shutdown` resolves, then drain in-flight
    /// requests.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn start<F>(self: Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        info!("API Gateway listening on {}", addr);

        self.serve(listener, shutdown)
            .await
            .context("Server error")?;

        Ok(())
    }
}

async fn proxy_handler(State(state): State<AppState>, req: Request) -> Response {
    state.gateway.handle_proxy_request(req).await
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.gateway.observability.metrics.render() {
        Some(body) => body.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
