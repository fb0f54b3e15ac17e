use std::error::Error as StdError;
use std::io;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Why a forwarded call produced no upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorKind {
    /// Connect failed, or the connection was refused/reset before a response.
    ConnectionFailed,
    /// The call exceeded its deadline.
    Timeout,
    /// Malformed response or any other transport failure.
    UpstreamError,
}

impl ProxyErrorKind {
    /// Classify a client error. Timeouts are checked first so that a connect
    /// timeout counts as a timeout, not as a refused connection. A connection
    /// that was closed or reset before a response head arrived counts as a
    /// failed connection.
    pub fn classify(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyErrorKind::Timeout
        } else if err.is_connect() || closed_before_response(err) {
            ProxyErrorKind::ConnectionFailed
        } else {
            ProxyErrorKind::UpstreamError
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyErrorKind::ConnectionFailed => "connection_failed",
            ProxyErrorKind::Timeout => "timeout",
            ProxyErrorKind::UpstreamError => "upstream_error",
        }
    }
}

/// Walks the source chain for an early EOF from hyper or a reset socket.
/// Parse errors on a response that did arrive are left alone.
fn closed_before_response(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(hyper_err) = cause.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() || hyper_err.is_closed() {
                return true;
            }
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

/// Application-wide error types
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("No route matched path: {0}")]
    RouteNotFound(String),

    #[error("Connection to upstream '{upstream}' failed: {source}")]
    UpstreamConnectionFailed {
        upstream: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Upstream '{upstream}' timed out: {source}")]
    UpstreamTimeout {
        upstream: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Upstream '{upstream}' failed: {source}")]
    UpstreamProtocol {
        upstream: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to read request body: {0}")]
    RequestBody(#[from] axum::Error),
}

impl GatewayError {
    /// Wrap a client error raised while forwarding to `upstream`.
    pub fn from_upstream(upstream: &str, source: reqwest::Error) -> Self {
        let upstream = upstream.to_string();
        match ProxyErrorKind::classify(&source) {
            ProxyErrorKind::ConnectionFailed => GatewayError::UpstreamConnectionFailed { upstream, source },
            ProxyErrorKind::Timeout => GatewayError::UpstreamTimeout { upstream, source },
            ProxyErrorKind::UpstreamError => GatewayError::UpstreamProtocol { upstream, source },
        }
    }

    /// `None` for failures that did not happen on the upstream hop.
    pub fn proxy_kind(&self) -> Option<ProxyErrorKind> {
        match self {
            GatewayError::UpstreamConnectionFailed { .. } => Some(ProxyErrorKind::ConnectionFailed),
            GatewayError::UpstreamTimeout { .. } => Some(ProxyErrorKind::Timeout),
            GatewayError::UpstreamProtocol { .. } => Some(ProxyErrorKind::UpstreamError),
            _ => None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::UpstreamConnectionFailed { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamProtocol { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::RequestBody(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound(_) => "ROUTE_NOT_FOUND",
            GatewayError::UpstreamConnectionFailed { .. } => "UPSTREAM_CONNECTION_FAILED",
            GatewayError::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            GatewayError::UpstreamProtocol { .. } => "UPSTREAM_ERROR",
            GatewayError::RequestBody(_) => "BAD_REQUEST",
        }
    }

    /// Message safe to show to clients. Upstream addresses and error text
    /// stay in the server log.
    pub fn client_message(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound(_) => "Not found",
            GatewayError::UpstreamConnectionFailed { .. } => "Backend connection failed",
            GatewayError::UpstreamTimeout { .. } => "Backend unavailable",
            GatewayError::UpstreamProtocol { .. } => "Backend unavailable",
            GatewayError::RequestBody(_) => "Invalid request body",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = Json(json!({
            "error": {
                "code": self.error_code(),
                "message": self.client_message(),
                "status": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_route_not_found_renders_envelope() {
        let response = GatewayError::RouteNotFound("".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], "ROUTE_NOT_FOUND");
        assert_eq!(value["error"]["status"], 404);
    }

    #[tokio::test]
    async fn test_connection_failure_is_classified_and_hidden() {
        // Nothing listens on port 1 of the loopback interface.
        let err = reqwest::Client::new()
            .get("http://127.0.0.1:1/secret-path")
            .send()
            .await
            .unwrap_err();

        let err = GatewayError::from_upstream("device-service", err);
        assert_eq!(err.proxy_kind(), Some(ProxyErrorKind::ConnectionFailed));
        assert!(err.to_string().contains("device-service"));

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("Backend connection failed"));
        assert!(!text.contains("127.0.0.1"));
        assert!(!text.contains("secret-path"));
    }
}
