pub mod engine;
pub mod forwarder;
pub mod router;
pub mod upstream;

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

pub use engine::Gateway;
pub use forwarder::{Forwarder, InboundRequest};
pub use router::{RouteRule, RouteTable};
pub use upstream::{UpstreamRegistry, UpstreamTarget};

/// Proxy response information
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Streamed upstream body.
    pub body: Body,
    pub upstream_url: String,
    /// Time until the upstream's response headers arrived.
    pub upstream_response_time: std::time::Duration,
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Attached to proxied responses so the access log can report where a
/// request went and how it ended.
#[derive(Debug, Clone)]
pub struct ProxyOutcome {
    pub upstream: String,
    pub upstream_url: String,
    /// `ok`, or the kind of upstream failure.
    pub outcome: &'static str,
    pub upstream_response_time: Option<std::time::Duration>,
}
