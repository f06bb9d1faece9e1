//! Registration of supervised services with the gateway.

use std::time::Duration;

use serde_json::{json, Value};

use super::types::ServerManifest;

/// Per-attempt timeout for a registration call.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of `POST /discovery/register` for a supervised service.
pub fn registration_payload(
    name: &str,
    port: u16,
    manifest: &ServerManifest,
    service_host: &str,
) -> Value {
    let description = manifest.description.as_deref().unwrap_or(name);
    let capabilities = manifest
        .capabilities
        .clone()
        .unwrap_or_else(|| json!({ "tools": true }));

    json!({
        "serviceName": name,
        "serviceConfig": {
            "url": format!("http://{service_host}:{port}"),
            "description": format!("Custom development MCP: {description}"),
            "capabilities": capabilities,
        }
    })
}

/// Register with the gateway, retrying with a fixed delay.
///
/// Returns whether registration succeeded and how many attempts were made.
pub async fn register_with_retry(
    http: &reqwest::Client,
    gateway_url: &str,
    payload: &Value,
    attempts: u32,
    delay: Duration,
) -> (bool, u32) {
    let url = format!("{}/discovery/register", gateway_url.trim_end_matches('/'));
    let service = payload
        .get("serviceName")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let attempts = attempts.max(1);

    for attempt in 1..=attempts {
        let outcome = http
            .post(&url)
            .timeout(REGISTRATION_TIMEOUT)
            .json(payload)
            .send()
            .await;

        match outcome {
            Ok(response) if response.status().is_success() => {
                tracing::info!(service, attempt, "registered with gateway");
                return (true, attempt);
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                tracing::warn!(service, attempt, %status, body = %body, "gateway rejected registration");
            }
            Err(e) => {
                tracing::warn!(service, attempt, error = %e, "gateway registration failed");
            }
        }

        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }

    tracing::error!(service, attempts, "giving up on gateway registration");
    (false, attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_payload_defaults() {
        let payload = registration_payload("calc", 3100, &ServerManifest::default(), "dev-mcp-service");
        assert_eq!(payload["serviceName"], "calc");
        assert_eq!(payload["serviceConfig"]["url"], "http://dev-mcp-service:3100");
        assert_eq!(
            payload["serviceConfig"]["description"],
            "Custom development MCP: calc"
        );
        assert_eq!(payload["serviceConfig"]["capabilities"], json!({"tools": true}));
    }

    #[test]
    fn test_payload_uses_manifest() {
        let manifest = ServerManifest {
            description: Some("Weather tools".into()),
            capabilities: Some(json!({"tools": true, "resources": true})),
            ..ServerManifest::default()
        };
        let payload = registration_payload("weather", 3101, &manifest, "localhost");
        assert_eq!(
            payload["serviceConfig"]["description"],
            "Custom development MCP: Weather tools"
        );
        assert_eq!(payload["serviceConfig"]["capabilities"]["resources"], true);
    }

    #[tokio::test]
    async fn test_retries_until_accepted() {
        let calls = Arc::new(AtomicU32::new(0));
        let received: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let router = {
            let calls = calls.clone();
            let received = received.clone();
            Router::new().route(
                "/discovery/register",
                post(move |Json(body): Json<Value>| {
                    let calls = calls.clone();
                    let received = received.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "busy"})));
                        }
                        *received.lock().unwrap() = Some(body);
                        (StatusCode::OK, Json(json!({"success": true})))
                    }
                }),
            )
        };
        let gateway = testing::serve(router).await;

        let payload = registration_payload("calc", 3100, &ServerManifest::default(), "localhost");
        let http = reqwest::Client::new();
        let (ok, attempts) = register_with_retry(
            &http,
            &format!("{gateway}/"),
            &payload,
            5,
            Duration::from_millis(10),
        )
        .await;

        assert!(ok);
        assert_eq!(attempts, 2);
        assert_eq!(received.lock().unwrap().as_ref().unwrap()["serviceName"], "calc");
    }

    #[tokio::test]
    async fn test_unreachable_gateway_exhausts_attempts() {
        let gateway = testing::closed_port_url().await;
        let payload = registration_payload("calc", 3100, &ServerManifest::default(), "localhost");
        let http = reqwest::Client::new();
        let (ok, attempts) =
            register_with_retry(&http, &gateway, &payload, 3, Duration::from_millis(10)).await;
        assert!(!ok);
        assert_eq!(attempts, 3);
    }
}
