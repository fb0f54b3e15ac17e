pub mod logger;
pub mod metrics;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::{LogFormat, LoggingConfig};
use crate::proxy::ProxyOutcome;

pub use logger::{AccessLog, AccessLogEntry, AccessLogWriter};
pub use metrics::MetricsCollector;

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Observability facade shared by the request path
#[derive(Clone)]
pub struct Observability {
    pub metrics: Arc<MetricsCollector>,
    pub access_log: AccessLog,
}

impl Observability {
    pub fn new(metrics: Arc<MetricsCollector>, access_log: AccessLog) -> Self {
        Self { metrics, access_log }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(MetricsCollector::disabled()), AccessLog::disabled())
    }
}

/// Records every request once its response head is ready. Runs beside the
/// request path and cannot fail it.
pub async fn record_requests(
    State(observability): State<Observability>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let request_id = Uuid::new_v4().to_string();
    let client_ip = connect_info.map(|ConnectInfo(addr)| addr.ip().to_string());
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    let elapsed = started.elapsed();
    let status = response.status().as_u16();
    let outcome = response.extensions().get::<ProxyOutcome>();

    info!(
        request_id = %request_id,
        client = client_ip.as_deref().unwrap_or("-"),
        upstream = outcome.map(|o| o.upstream.as_str()).unwrap_or("-"),
        upstream_url = outcome.map(|o| o.upstream_url.as_str()).unwrap_or("-"),
        outcome = outcome.map(|o| o.outcome).unwrap_or("local"),
        "{} {} {} {:.3}s",
        method,
        path,
        status,
        elapsed.as_secs_f64()
    );

    observability.metrics.record_request(
        outcome.map(|o| o.upstream.as_str()),
        &method,
        status,
        elapsed.as_secs_f64(),
    );

    if let Some(outcome) = outcome {
        if let Some(upstream_time) = outcome.upstream_response_time {
            observability
                .metrics
                .record_upstream_response(&outcome.upstream, upstream_time.as_secs_f64());
        }
    }

    observability.access_log.record(AccessLogEntry {
        timestamp: Utc::now(),
        request_id,
        client_ip,
        method,
        path,
        upstream: outcome.map(|o| o.upstream.clone()),
        upstream_url: outcome.map(|o| o.upstream_url.clone()),
        status,
        duration_ms: elapsed.as_millis() as u64,
        outcome: outcome.map(|o| o.outcome).unwrap_or("local").to_string(),
    });

    response
}
