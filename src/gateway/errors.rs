use axum::http::StatusCode;
use serde_json::Value;
use thiserror::Error;

use super::backend::BackendError;
use super::types::{error_codes, JsonRpcResponse};

/// Client-facing failures of the gateway. Every variant becomes a JSON-RPC
/// error envelope.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Parse error: {reason}")]
    Parse { reason: String },

    #[error("Invalid Request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Unknown MCP service: {service}")]
    UnknownService { service: String },

    #[error("Server not initialized. Call initialize first.")]
    NotInitialized { service: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    /// Backend transport failure or non-2xx answer.
    #[error("{source}")]
    Backend {
        service: String,
        #[source]
        source: BackendError,
    },
}

impl GatewayError {
    pub fn code(&self) -> i32 {
        match self {
            GatewayError::Parse { .. } => error_codes::PARSE_ERROR,
            GatewayError::InvalidRequest { .. } => error_codes::INVALID_REQUEST,
            GatewayError::UnknownService { .. } => error_codes::UNKNOWN_SERVICE,
            GatewayError::NotInitialized { .. } => error_codes::NOT_INITIALIZED,
            GatewayError::MethodNotFound { .. } => error_codes::METHOD_NOT_FOUND,
            GatewayError::Backend { .. } => error_codes::INTERNAL_ERROR,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            GatewayError::Parse { .. }
            | GatewayError::InvalidRequest { .. }
            | GatewayError::NotInitialized { .. }
            | GatewayError::MethodNotFound { .. } => StatusCode::BAD_REQUEST,
            GatewayError::UnknownService { .. } => StatusCode::NOT_FOUND,
            GatewayError::Backend { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_envelope(&self, id: Value) -> JsonRpcResponse {
        JsonRpcResponse::failure(id, self.code(), self.to_string())
    }
}
