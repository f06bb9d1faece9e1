//! JSON-RPC 2.0 envelopes and protocol constants used by the gateway.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Protocol constants ──────────────────────────────────────────────────────

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol version reported when the backend does not announce one.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Version reported in the synthesized `serverInfo` fallback.
pub const FALLBACK_SERVER_VERSION: &str = "1.0.0";

pub const INITIALIZE: &str = "initialize";

/// Prefix of fire-and-forget notifications.
pub const NOTIFICATION_PREFIX: &str = "notifications/";

/// Methods forwarded to an initialized backend.
pub const FORWARDED_METHODS: &[&str] = &[
    "ping",
    "tools/list",
    "tools/call",
    "resources/list",
    "resources/read",
    "resources/templates/list",
    "prompts/list",
    "prompts/get",
    "completion/complete",
    "logging/setLevel",
];

pub fn is_notification(method: &str) -> bool {
    method.starts_with(NOTIFICATION_PREFIX)
}

pub fn is_forwarded_method(method: &str) -> bool {
    FORWARDED_METHODS.contains(&method)
}

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request, as received from clients and forwarded to backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Absent for notifications. A literal `null` id is treated as absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_string()
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id: Some(id.into()),
        }
    }

    /// The id to echo in a reply, `null` when the request had none.
    pub fn reply_id(&self) -> Value {
        self.id.clone().unwrap_or(Value::Null)
    }
}

/// JSON-RPC 2.0 response produced by the gateway itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub id: Value,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// The part of `initialize` params the gateway records.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub client_info: Option<Value>,
}

impl InitializeParams {
    /// Parse leniently; malformed params are treated as empty.
    pub fn from_params(params: Option<&Value>) -> Self {
        params
            .and_then(|p| serde_json::from_value(p.clone()).ok())
            .unwrap_or_default()
    }
}

// ─── Error codes ─────────────────────────────────────────────────────────────

/// JSON-RPC error codes emitted by the gateway and the supervisor.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error, including any backend transport failure.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// The named service is unknown or not available.
    pub const UNKNOWN_SERVICE: i32 = -32000;
    /// A method other than `initialize` arrived before initialization.
    pub const NOT_INITIALIZED: i32 = -32002;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
