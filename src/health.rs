//! Liveness and introspection endpoints.
//!
//! None of these probe upstreams: gateway liveness is reported on its own.

use std::collections::BTreeMap;

use axum::{extract::State, response::IntoResponse, Json};
use serde::Serialize;

use crate::proxy::engine::AppState;

pub const SERVICE_NAME: &str = "api-gateway";
pub const GATEWAY_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct GatewayStatus {
    pub status: &'static str,
    pub version: &'static str,
    pub services: BTreeMap<String, String>,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub url: String,
    pub description: String,
}

fn unix_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// `GET /health`
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        timestamp: unix_timestamp(),
    })
}

/// `GET /gateway/status`
pub async fn gateway_status(State(state): State<AppState>) -> impl IntoResponse {
    let services = state
        .gateway
        .upstreams()
        .iter()
        .map(|target| (target.name.clone(), target.base_url.clone()))
        .collect();

    Json(GatewayStatus {
        status: "running",
        version: GATEWAY_VERSION,
        services,
        timestamp: unix_timestamp(),
    })
}

/// `GET /gateway/services`
pub async fn gateway_services(State(state): State<AppState>) -> impl IntoResponse {
    let services: Vec<ServiceInfo> = state
        .gateway
        .upstreams()
        .iter()
        .map(|target| ServiceInfo {
            name: target.name.clone(),
            url: target.base_url.clone(),
            description: target.description.clone(),
        })
        .collect();

    Json(services)
}
