//! HTTP JSON-RPC client for backend services.
//!
//! Every backend exposes a single JSON-RPC endpoint at its base URL
//! (`POST <url>`). Envelopes are returned as raw JSON so the gateway can
//! forward them unchanged.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use super::types::JsonRpcRequest;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum BackendError {
    /// Connection refused, timeout, DNS failure, …
    #[error("{reason}")]
    Transport { url: String, reason: String },

    /// The backend answered with a non-2xx status.
    #[error("HTTP {status}: {reason}")]
    Status { status: u16, reason: String },

    /// The body was not JSON.
    #[error("invalid JSON-RPC response: {reason}")]
    Decode { reason: String },

    #[error("failed to build HTTP client: {reason}")]
    Client { reason: String },
}

/// Shared client for all backend calls.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
}

impl BackendClient {
    /// Create a client whose calls give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Client {
                reason: e.to_string(),
            })?;
        Ok(Self { http })
    }

    /// POST `request` to `url` and return the decoded response envelope.
    pub async fn send(&self, url: &str, request: &JsonRpcRequest) -> Result<Value, BackendError> {
        let response = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| BackendError::Transport {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_string(),
            });
        }

        response.json().await.map_err(|e| BackendError::Decode {
            reason: e.to_string(),
        })
    }

    /// Call `method` with empty params, using the method name as request id.
    pub async fn call(&self, url: &str, method: &str) -> Result<Value, BackendError> {
        let id = method.replace('/', "-");
        let request = JsonRpcRequest::new(id, method, Some(Value::Object(Default::default())));
        self.send(url, &request).await
    }
}

/// The `result` member of a response envelope, if it is a success.
pub fn extract_result(envelope: &Value) -> Option<&Value> {
    if envelope.get("error").is_some_and(|e| !e.is_null()) {
        return None;
    }
    envelope.get("result").filter(|r| !r.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use serde_json::json;

    #[test]
    fn test_extract_result_success() {
        let envelope = json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}});
        assert_eq!(extract_result(&envelope), Some(&json!({"tools": []})));
    }

    #[test]
    fn test_extract_result_error() {
        let envelope = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "x"}});
        assert!(extract_result(&envelope).is_none());
        assert!(extract_result(&json!({"jsonrpc": "2.0", "id": 1})).is_none());
    }

    #[tokio::test]
    async fn test_send_returns_backend_envelope() {
        let base = testing::serve(testing::calc_backend(json!([{"name": "add"}]))).await;
        let client = BackendClient::new(Duration::from_secs(5)).unwrap();

        let envelope = client.call(&base, "tools/list").await.unwrap();
        assert_eq!(envelope["id"], "tools-list");
        assert_eq!(envelope["result"]["tools"][0]["name"], "add");
    }

    #[tokio::test]
    async fn test_send_non_2xx_is_status_error() {
        // The healthy router has no POST / route.
        let base = testing::serve(testing::healthy_router()).await;
        let client = BackendClient::new(Duration::from_secs(5)).unwrap();

        let err = client.call(&base, "ping").await.unwrap_err();
        assert!(matches!(err, BackendError::Status { .. }));
    }

    #[tokio::test]
    async fn test_send_unreachable_is_transport_error() {
        let url = testing::closed_port_url().await;
        let client = BackendClient::new(Duration::from_secs(2)).unwrap();
        let err = client.call(&url, "ping").await.unwrap_err();
        assert!(matches!(err, BackendError::Transport { .. }));
    }
}
