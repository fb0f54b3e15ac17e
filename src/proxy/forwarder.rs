use std::time::Instant;

use anyhow::Result;
use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderName, Method},
};
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::BodyExt;
use tracing::{debug, error, warn};

use crate::config::ClientConfig;
use crate::error::{GatewayError, Result as GatewayResult};
use super::upstream::UpstreamTarget;
use super::ProxyResponse;

/// The parts of a client request that take part in forwarding.
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Body,
}

impl InboundRequest {
    pub fn from_request(req: Request) -> Self {
        let (parts, body) = req.into_parts();
        Self {
            method: parts.method,
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers,
            body,
        }
    }
}

/// Sends requests to upstreams over one pooled client.
///
/// The client is created with the forwarder and released when it is
/// dropped; clones share the same pool.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            // 3xx responses belong to the client, not to the gateway.
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self { client })
    }

    /// Forward `inbound` to `target` and relay the upstream response.
    ///
    /// GET requests carry no body; for every other method the inbound body is
    /// read exactly once and sent as-is. The response body is streamed back
    /// in the order the upstream produces it.
    pub async fn forward(
        &self,
        inbound: InboundRequest,
        target: &UpstreamTarget,
    ) -> GatewayResult<ProxyResponse> {
        let started = Instant::now();
        let url = target.url_for(&inbound.path, inbound.query.as_deref());
        let send_body = inbound.method != Method::GET;

        debug!("Forwarding {} {} -> {}", inbound.method, inbound.path, url);

        let headers = outbound_headers(&inbound.headers, send_body);
        let mut request_builder = self
            .client
            .request(inbound.method.clone(), &url)
            .headers(headers);

        if send_body {
            let body: Bytes = inbound.body.collect().await?.to_bytes();
            request_builder = request_builder.body(body);
        }

        let response = request_builder.send().await.map_err(|e| {
            error!(
                upstream = %target.name,
                url = %url,
                error = %e,
                "Upstream request failed"
            );
            GatewayError::from_upstream(&target.name, e)
        })?;

        let status = response.status();
        let headers = response_headers(response.headers());

        let upstream = target.name.clone();
        let stream = response.bytes_stream().inspect_err(move |e| {
            warn!(upstream = %upstream, error = %e, "Upstream body stream aborted");
        });

        Ok(ProxyResponse {
            status,
            headers,
            body: Body::from_stream(stream),
            upstream_url: url,
            upstream_response_time: started.elapsed(),
        })
    }
}

/// Headers scoped to a single connection. They are never relayed; each hop
/// frames its own messages.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Header names listed in `Connection`, which are hop-by-hop for this
/// message only.
fn connection_listed(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Copy inbound headers for the upstream. `Host` is dropped so the client
/// sets the upstream's own; `Content-Length` is dropped along with the body.
pub(crate) fn outbound_headers(inbound: &HeaderMap, with_body: bool) -> HeaderMap {
    let listed = connection_listed(inbound);
    let mut outbound = HeaderMap::with_capacity(inbound.len());

    for (name, value) in inbound.iter() {
        if name == header::HOST
            || is_hop_by_hop_header(name)
            || listed.iter().any(|l| l == name.as_str())
        {
            continue;
        }
        if !with_body && name == header::CONTENT_LENGTH {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }

    outbound
}

/// Copy upstream response headers for the client, minus hop-by-hop ones.
pub(crate) fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let listed = connection_listed(upstream);
    let mut headers = HeaderMap::with_capacity(upstream.len());

    for (name, value) in upstream.iter() {
        if is_hop_by_hop_header(name) || listed.iter().any(|l| l == name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    headers
}
