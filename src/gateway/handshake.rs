//! Capability negotiation for `initialize`.
//!
//! The backend's own `initialize` answer is not trusted for capabilities.
//! Instead the gateway probes `tools/list`, `resources/list` and
//! `prompts/list` and advertises what actually answered.

use serde_json::{json, Map, Value};

use super::backend::{extract_result, BackendClient, BackendError};
use super::types::{JsonRpcRequest, DEFAULT_PROTOCOL_VERSION, FALLBACK_SERVER_VERSION};

/// Capabilities derived from the three probes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedCapabilities {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
    pub tool_count: usize,
}

impl NegotiatedCapabilities {
    /// Derive capabilities from probe results (`None` = probe failed).
    ///
    /// `tools` requires a non-empty array; `resources` and `prompts` only
    /// require the array to be present.
    pub fn from_probes(
        tools: Option<&Value>,
        resources: Option<&Value>,
        prompts: Option<&Value>,
    ) -> Self {
        let tool_count = tools
            .and_then(|r| r.get("tools"))
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        let has_array = |result: Option<&Value>, key: &str| {
            result.and_then(|r| r.get(key)).is_some_and(Value::is_array)
        };

        Self {
            tools: tool_count > 0,
            resources: has_array(resources, "resources"),
            prompts: has_array(prompts, "prompts"),
            tool_count,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut caps = Map::new();
        if self.tools {
            caps.insert("tools".into(), json!({}));
        }
        if self.resources {
            caps.insert("resources".into(), json!({}));
        }
        if self.prompts {
            caps.insert("prompts".into(), json!({}));
        }
        Value::Object(caps)
    }
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub capabilities: NegotiatedCapabilities,
    /// The `result` to send back to the client.
    pub result: Value,
}

/// Run the handshake against the backend at `url`.
///
/// Only a failure of the forwarded `initialize` aborts; each probe failing
/// just means that capability is absent.
pub async fn negotiate(
    backend: &BackendClient,
    service: &str,
    url: &str,
    request: &JsonRpcRequest,
) -> Result<Handshake, BackendError> {
    let init_envelope = backend.send(url, request).await?;
    let init_result = extract_result(&init_envelope);

    let (tools, resources, prompts) = tokio::join!(
        probe(backend, service, url, "tools/list"),
        probe(backend, service, url, "resources/list"),
        probe(backend, service, url, "prompts/list"),
    );
    let capabilities =
        NegotiatedCapabilities::from_probes(tools.as_ref(), resources.as_ref(), prompts.as_ref());

    let protocol_version = init_result
        .and_then(|r| r.get("protocolVersion"))
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_PROTOCOL_VERSION);
    let server_info = init_result
        .and_then(|r| r.get("serverInfo"))
        .filter(|info| !info.is_null())
        .cloned()
        .unwrap_or_else(|| {
            json!({
                "name": format!("mcp-gateway-{service}"),
                "version": FALLBACK_SERVER_VERSION,
            })
        });

    let result = json!({
        "protocolVersion": protocol_version,
        "capabilities": capabilities.to_json(),
        "serverInfo": server_info,
    });

    Ok(Handshake {
        capabilities,
        result,
    })
}

async fn probe(backend: &BackendClient, service: &str, url: &str, method: &str) -> Option<Value> {
    match backend.call(url, method).await {
        Ok(envelope) => extract_result(&envelope).cloned(),
        Err(e) => {
            tracing::debug!(service, method, error = %e, "capability probe failed");
            None
        }
    }
}
