//! HTTP routes of the supervisor binary.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::Instrument;
use uuid::Uuid;

use super::Supervisor;
use crate::gateway::types::{error_codes, JsonRpcResponse};

/// Timeout for a request proxied to a supervised service.
const PROXY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct SupervisorState {
    pub supervisor: Arc<Supervisor>,
    http: reqwest::Client,
}

impl SupervisorState {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            http: reqwest::Client::new(),
        }
    }
}

pub fn router(state: SupervisorState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/services", get(list_services))
        .route("/dev/{service}", any(proxy))
        .route("/services/{name}/restart", post(restart_service))
        .route("/services/{name}", delete(stop_service))
        .with_state(state)
}

async fn health(State(state): State<SupervisorState>) -> Json<Value> {
    let records = state.supervisor.list().await;
    let services: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "services": services,
        "totalServices": records.len(),
    }))
}

async fn list_services(State(state): State<SupervisorState>) -> Json<Value> {
    Json(json!({ "services": state.supervisor.list().await }))
}

/// Forward a JSON-RPC body to a running service.
async fn proxy(
    State(state): State<SupervisorState>,
    Path(service): Path<String>,
    method: Method,
    body: Bytes,
) -> Response {
    let span = tracing::info_span!(
        "dev_proxy",
        request_id = %Uuid::new_v4(),
        service = %service
    );
    proxy_inner(state, service, method, body)
        .instrument(span)
        .await
}

async fn proxy_inner(
    state: SupervisorState,
    service: String,
    method: Method,
    body: Bytes,
) -> Response {
    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let id = request.get("id").cloned().unwrap_or(Value::Null);

    let Some(port) = state.supervisor.running_port(&service).await else {
        let envelope = JsonRpcResponse::failure(
            id,
            error_codes::UNKNOWN_SERVICE,
            format!("Service {service} not available"),
        );
        return (StatusCode::NOT_FOUND, Json(envelope)).into_response();
    };

    let outcome = async {
        let mut outbound = state
            .http
            .request(method.clone(), format!("http://localhost:{port}"))
            .timeout(PROXY_TIMEOUT)
            .header("content-type", "application/json");
        // GET carries no body.
        if method != Method::GET {
            outbound = outbound.body(body);
        }
        let response = outbound
            .send()
            .await?
            .error_for_status()?;
        response.json::<Value>().await
    }
    .await;

    match outcome {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => {
            tracing::warn!(service = %service, port, error = %e, "proxy request failed");
            let envelope = JsonRpcResponse::failure(
                id,
                error_codes::INTERNAL_ERROR,
                format!("Proxy error: {e}"),
            );
            (StatusCode::INTERNAL_SERVER_ERROR, Json(envelope)).into_response()
        }
    }
}

async fn restart_service(
    State(state): State<SupervisorState>,
    Path(name): Path<String>,
) -> Json<Value> {
    let supervisor = state.supervisor.clone();
    let service = name.clone();
    tokio::spawn(async move {
        if supervisor.restart(&service).await.is_none() {
            tracing::warn!(service = %service, "restart requested for unknown service");
        }
    });
    Json(json!({ "message": format!("Service {name} restart initiated") }))
}

async fn stop_service(
    State(state): State<SupervisorState>,
    Path(name): Path<String>,
) -> Json<Value> {
    state.supervisor.stop(&name).await;
    Json(json!({ "message": format!("Service {name} stopped") }))
}
