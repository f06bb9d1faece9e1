//! Shared fixtures for unit tests: in-process mock backends.

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

/// Serve `router` on an ephemeral localhost port and return its base URL.
pub(crate) async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// A base URL on which nothing is listening.
pub(crate) async fn closed_port_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

pub(crate) fn healthy_router() -> Router {
    Router::new().route("/health", get(|| async { Json(json!({"status": "ok"})) }))
}

pub(crate) fn unhealthy_router() -> Router {
    Router::new().route(
        "/health",
        get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
    )
}

/// A minimal calculator backend speaking JSON-RPC on `POST /`.
///
/// `tools` is what `tools/list` returns; resources and prompts are not
/// supported and answer with a JSON-RPC error.
pub(crate) fn calc_backend(tools: Value) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }))
        .route(
            "/",
            post(move |Json(request): Json<Value>| {
                let tools = tools.clone();
                async move { Json(calc_reply(&request, tools)) }
            }),
        )
}

fn calc_reply(request: &Value, tools: Value) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    match method {
        "initialize" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": "2025-03-26",
                "serverInfo": {"name": "calc", "version": "0.3.0"},
                "capabilities": {}
            }
        }),
        "tools/list" => json!({"jsonrpc": "2.0", "id": id, "result": {"tools": tools}}),
        "tools/call" => {
            let args = &request["params"]["arguments"];
            let sum = args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0);
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"content": [{"type": "text", "text": format!("{sum}")}]}
            })
        }
        "ping" => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
        other => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": format!("Method not found: {other}")}
        }),
    }
}
