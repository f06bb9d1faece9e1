//! HTTP routes of the gateway binary.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::Instrument;
use uuid::Uuid;

use super::session::SessionPhase;
use super::Gateway;
use crate::registry::{
    DiscoveryStats, HealthReport, RefreshOutcome, ServiceConfig, ServiceOrigin, ServiceRegistry,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct GatewayState {
    pub gateway: Arc<Gateway>,
}

impl GatewayState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    fn registry(&self) -> &Arc<ServiceRegistry> {
        self.gateway.registry()
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/services", get(list_services))
        .route("/mcp/{service}", any(mcp))
        .route("/discovery/register", post(register_service))
        .route("/discovery/services", get(discovery_services))
        .route("/discovery/services/{name}", delete(unregister_service))
        .route("/discovery/stats", get(discovery_stats))
        .route("/discovery/health", get(discovery_health))
        .route("/discovery/endpoints", post(add_endpoint))
        .route("/discovery/refresh", post(refresh_discovery))
        .with_state(state)
}

// ─── Gateway ─────────────────────────────────────────────────────────────────

async fn health(State(state): State<GatewayState>) -> Json<Value> {
    let registry = state.registry();
    let services: Vec<String> = registry.list().into_iter().map(|s| s.name).collect();
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "services": services,
        "initializedServices": state.gateway.sessions().initialized_services(),
        "stats": registry.stats(),
    }))
}

#[derive(Serialize)]
struct ServiceSummary {
    name: String,
    endpoint: String,
    origin: ServiceOrigin,
    status: SessionPhase,
}

async fn list_services(State(state): State<GatewayState>) -> Json<Value> {
    let sessions = state.gateway.sessions();
    let services: Vec<ServiceSummary> = state
        .registry()
        .list()
        .into_iter()
        .map(|s| ServiceSummary {
            endpoint: format!("/mcp/{}", s.name),
            origin: s.origin,
            status: sessions.phase(&s.name),
            name: s.name,
        })
        .collect();
    Json(json!({ "services": services }))
}

async fn mcp(
    State(state): State<GatewayState>,
    Path(service): Path<String>,
    body: Bytes,
) -> Response {
    let span = tracing::info_span!(
        "mcp_request",
        request_id = %Uuid::new_v4(),
        service = %service
    );
    let reply = state
        .gateway
        .handle(&service, &body)
        .instrument(span)
        .await;

    match reply.body {
        Some(body) => (reply.status, Json(body)).into_response(),
        None => reply.status.into_response(),
    }
}

// ─── Discovery ───────────────────────────────────────────────────────────────

async fn register_service(
    State(state): State<GatewayState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let (name, config) = parse_registration(&body)?;

    let descriptor = state
        .registry()
        .try_register_dynamic(&name, config)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to register service: {e}")))?;

    Ok(Json(json!({
        "message": format!("Service {name} registered successfully"),
        "service": descriptor,
    })))
}

/// Extract `serviceName` and `serviceConfig` from a registration body.
fn parse_registration(body: &[u8]) -> Result<(String, ServiceConfig), ApiError> {
    const REQUIRED: &str = "serviceName and serviceConfig.url are required";

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {e}")))?;

    let name = value
        .get("serviceName")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::BadRequest(REQUIRED.into()))?;

    let config: ServiceConfig = value
        .get("serviceConfig")
        .filter(|c| c.get("url").and_then(Value::as_str).is_some_and(|u| !u.is_empty()))
        .and_then(|c| serde_json::from_value(c.clone()).ok())
        .ok_or_else(|| ApiError::BadRequest(REQUIRED.into()))?;

    Ok((name.to_string(), config))
}

async fn unregister_service(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.registry().unregister(&name) {
        Ok(Json(json!({ "message": format!("Service {name} unregistered") })))
    } else {
        Err(ApiError::NotFound(format!("Service {name} not found")))
    }
}

async fn discovery_services(State(state): State<GatewayState>) -> Json<Value> {
    let services: serde_json::Map<String, Value> = state
        .registry()
        .list()
        .into_iter()
        .filter_map(|s| Some((s.name.clone(), serde_json::to_value(&s).ok()?)))
        .collect();
    Json(json!({ "services": services }))
}

async fn discovery_stats(State(state): State<GatewayState>) -> Json<DiscoveryStats> {
    Json(state.registry().stats())
}

async fn discovery_health(
    State(state): State<GatewayState>,
) -> Json<BTreeMap<String, HealthReport>> {
    Json(state.registry().health_check_all().await)
}

async fn add_endpoint(
    State(state): State<GatewayState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let value: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {e}")))?;
    let endpoint = value
        .get("endpoint")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .ok_or_else(|| ApiError::BadRequest("endpoint is required".into()))?;

    state.registry().add_discovery_endpoint(endpoint);
    Ok(Json(json!({
        "message": "Discovery endpoint added",
        "endpoint": endpoint,
    })))
}

async fn refresh_discovery(State(state): State<GatewayState>) -> Json<Value> {
    let outcome = state.registry().refresh().await;
    let refreshed = matches!(outcome, RefreshOutcome::Completed { .. });
    let message = if refreshed {
        "Discovery refreshed"
    } else {
        "Discovery refresh skipped, last refresh is recent"
    };
    Json(json!({
        "message": message,
        "refreshed": refreshed,
        "stats": state.registry().stats(),
    }))
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Failures of the non-JSON-RPC routes.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
