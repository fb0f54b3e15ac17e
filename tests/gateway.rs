//! End-to-end tests: the gateway and mock upstreams run on ephemeral
//! loopback ports and are driven over real HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use smarthome_gateway::config::{Config, DEVICE_SERVICE, SMART_HOME_APP, TELEMETRY_SERVICE};
use smarthome_gateway::observability::Observability;
use smarthome_gateway::Gateway;

/// Reports everything the upstream received.
async fn echo(
    axum::extract::State(name): axum::extract::State<&'static str>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let headers: serde_json::Map<String, Value> = headers
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), json!(v.to_str().unwrap_or_default())))
        .collect();

    (
        [("x-upstream", name)],
        Json(json!({
            "upstream": name,
            "method": method.as_str(),
            "uri": uri.to_string(),
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
            "body_len": body.len(),
        })),
    )
}

async fn teapot() -> impl IntoResponse {
    (
        StatusCode::IM_A_TEAPOT,
        [("x-powered-by", "sensor-store"), ("content-type", "text/plain")],
        "short and stout",
    )
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_millis(1500)).await;
    "finally"
}

async fn spawn(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn spawn_upstream(name: &'static str) -> String {
    let app = Router::new()
        .route("/api/v1/sensors/teapot", get(teapot))
        .route("/api/v1/telemetry/slow", get(slow))
        .fallback(echo)
        .with_state(name);
    format!("http://{}", spawn(app).await)
}

/// A loopback address with nothing listening on it.
async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

/// A raw TCP upstream that reads the request head and then either writes
/// `reply` or, when it is `None`, closes without answering.
async fn raw_upstream(reply: Option<&'static [u8]>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                if let Some(reply) = reply {
                    let _ = socket.write_all(reply).await;
                }
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{}", addr)
}

struct Harness {
    gateway: SocketAddr,
    client: reqwest::Client,
}

impl Harness {
    async fn start(configure: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        for upstream in &mut config.upstreams {
            upstream.url = match upstream.name.as_str() {
                SMART_HOME_APP => spawn_upstream(SMART_HOME_APP).await,
                DEVICE_SERVICE => spawn_upstream(DEVICE_SERVICE).await,
                TELEMETRY_SERVICE => spawn_upstream(TELEMETRY_SERVICE).await,
                other => panic!("unexpected upstream {other}"),
            };
        }
        configure(&mut config);

        let gateway = Arc::new(Gateway::new(config, Observability::disabled()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(gateway.serve(listener, std::future::pending()));

        Self {
            gateway: addr,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.gateway, path_and_query)
    }
}

#[tokio::test]
async fn device_request_is_forwarded_with_query_and_headers() {
    let harness = Harness::start(|_| {}).await;

    let response = harness
        .client
        .get(harness.url("/api/v1/devices/42?full=true"))
        .header("X-Trace", "abc")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-upstream"], DEVICE_SERVICE);

    let echoed: Value = response.json().await.unwrap();
    assert_eq!(echoed["upstream"], DEVICE_SERVICE);
    assert_eq!(echoed["method"], "GET");
    assert_eq!(echoed["uri"], "/api/v1/devices/42?full=true");
    assert_eq!(echoed["headers"]["x-trace"], "abc");

    let gateway_host = harness.gateway.to_string();
    assert_ne!(echoed["headers"]["host"], gateway_host.as_str());
}

#[tokio::test]
async fn routes_select_their_upstreams() {
    let harness = Harness::start(|_| {}).await;

    for (path, expected) in [
        ("/api/v1/sensors/1", SMART_HOME_APP),
        ("/api/v1/telemetry/latest", TELEMETRY_SERVICE),
        ("/api/v1/telemetryX", SMART_HOME_APP),
        ("/dashboard", SMART_HOME_APP),
    ] {
        let echoed: Value = harness
            .client
            .get(harness.url(path))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(echoed["upstream"], expected, "path {path}");
        assert_eq!(echoed["uri"], path);
    }
}

#[tokio::test]
async fn query_string_passes_through_verbatim() {
    let harness = Harness::start(|_| {}).await;

    let echoed: Value = harness
        .client
        .get(harness.url("/api/v1/sensors/search?a=1&b=two%20words"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(echoed["uri"], "/api/v1/sensors/search?a=1&b=two%20words");
}

#[tokio::test]
async fn get_body_is_never_forwarded() {
    let harness = Harness::start(|_| {}).await;

    let echoed: Value = harness
        .client
        .get(harness.url("/api/v1/devices/7"))
        .body("should not travel")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(echoed["body_len"], 0);
    assert!(echoed["headers"].get("content-length").is_none());
}

#[tokio::test]
async fn non_get_bodies_are_forwarded_byte_for_byte() {
    let harness = Harness::start(|_| {}).await;
    let payload = r#"{"name":"hall lamp","room":"hall","power":"on"}"#;

    for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
        let echoed: Value = harness
            .client
            .request(method.clone(), harness.url("/api/v1/devices/9"))
            .header("content-type", "application/json")
            .body(payload)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(echoed["method"], method.as_str());
        assert_eq!(echoed["body"], payload);
        assert_eq!(echoed["body_len"], payload.len());
        assert_eq!(echoed["headers"]["content-type"], "application/json");
    }
}

#[tokio::test]
async fn upstream_response_passes_through() {
    let harness = Harness::start(|_| {}).await;

    let response = harness
        .client
        .get(harness.url("/api/v1/sensors/teapot"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(response.headers()["x-powered-by"], "sensor-store");
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.text().await.unwrap(), "short and stout");
}

#[tokio::test]
async fn connection_failure_returns_502_without_leaking_upstream() {
    let dead = closed_port_url().await;
    let dead_for_config = dead.clone();
    let harness = Harness::start(move |config| {
        config.upstreams[1].url = dead_for_config;
    })
    .await;

    let response = harness
        .client
        .get(harness.url("/api/v1/devices/42"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = response.text().await.unwrap();
    assert!(body.contains("Backend connection failed"));
    assert!(!body.contains(dead.trim_start_matches("http://")));
    assert!(!body.contains(DEVICE_SERVICE));
}

#[tokio::test]
async fn upstream_timeout_returns_502_backend_unavailable() {
    let harness = Harness::start(|config| {
        config.client.timeout = Duration::from_millis(300);
    })
    .await;

    let response = harness
        .client
        .get(harness.url("/api/v1/telemetry/slow"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = response.text().await.unwrap();
    assert!(body.contains("Backend unavailable"));
}

#[tokio::test]
async fn health_is_ok_when_every_upstream_is_down() {
    let dead = closed_port_url().await;
    let harness = Harness::start(move |config| {
        for upstream in &mut config.upstreams {
            upstream.url = dead.clone();
        }
    })
    .await;

    let response = harness.client.get(harness.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn slow_upstream_does_not_block_other_targets() {
    let harness = Arc::new(Harness::start(|_| {}).await);

    let slow_request = {
        let harness = harness.clone();
        tokio::spawn(async move {
            harness
                .client
                .get(harness.url("/api/v1/telemetry/slow"))
                .send()
                .await
                .unwrap()
                .text()
                .await
                .unwrap()
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let response = harness
        .client
        .get(harness.url("/api/v1/devices/1"))
        .send()
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(elapsed < Duration::from_millis(1000), "fast request took {elapsed:?}");
    assert_eq!(slow_request.await.unwrap(), "finally");
}

#[tokio::test]
async fn non_get_on_introspection_path_is_proxied() {
    let harness = Harness::start(|_| {}).await;

    let echoed: Value = harness
        .client
        .post(harness.url("/health"))
        .body("ping")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(echoed["upstream"], SMART_HOME_APP);
    assert_eq!(echoed["body"], "ping");
}

#[tokio::test]
async fn upstream_closing_before_response_is_a_connection_failure() {
    let silent = raw_upstream(None).await;
    let harness = Harness::start(move |config| {
        config.upstreams[1].url = silent;
    })
    .await;

    let response = harness
        .client
        .get(harness.url("/api/v1/devices/42"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "UPSTREAM_CONNECTION_FAILED");
    assert_eq!(body["error"]["message"], "Backend connection failed");
}

#[tokio::test]
async fn malformed_upstream_response_is_backend_unavailable() {
    let garbage = raw_upstream(Some(b"GARBAGE NOT HTTP\r\n\r\n")).await;
    let harness = Harness::start(move |config| {
        config.upstreams[1].url = garbage;
    })
    .await;

    let response = harness
        .client
        .get(harness.url("/api/v1/devices/42"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "UPSTREAM_ERROR");
    assert_eq!(body["error"]["message"], "Backend unavailable");
}
