//! JSON-RPC gateway.
//!
//! Resolves a service name through the [`ServiceRegistry`], negotiates
//! capabilities on `initialize`, gates every other method on the service's
//! initialization state, and forwards recognized methods to the backend.
//!
//! Request handling order:
//! 1. malformed body (`-32700` / `-32600`)
//! 2. `notifications/*` (acknowledged, never forwarded)
//! 3. unknown service (`-32000`)
//! 4. `initialize` (handshake)
//! 5. not initialized (`-32002`)
//! 6. recognized method (forwarded verbatim)
//! 7. anything else (`-32601`)

pub mod backend;
pub mod errors;
pub mod handshake;
pub mod router;
pub mod session;
pub mod types;

use std::sync::Arc;

use axum::http::StatusCode;
use chrono::Utc;
use serde_json::Value;

use crate::events::{EventBus, GatewayEvent};
use crate::registry::{ServiceDescriptor, ServiceRegistry};

pub use backend::{BackendClient, BackendError};
pub use errors::GatewayError;
pub use handshake::NegotiatedCapabilities;
pub use session::{HandshakeTicket, InitializationState, SessionPhase, SessionTable};
pub use types::{error_codes, JsonRpcRequest, JsonRpcResponse};

use types::{InitializeParams, DEFAULT_PROTOCOL_VERSION, INITIALIZE};

/// What to send back for one `/mcp/{service}` request.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayReply {
    pub status: StatusCode,
    /// `None` for acknowledged notifications.
    pub body: Option<Value>,
}

impl GatewayReply {
    fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body: Some(body),
        }
    }

    fn empty() -> Self {
        Self {
            status: StatusCode::OK,
            body: None,
        }
    }

    fn error(err: &GatewayError, id: Value) -> Self {
        let envelope = err.to_envelope(id);
        Self {
            status: err.http_status(),
            body: serde_json::to_value(envelope).ok(),
        }
    }
}

pub struct Gateway {
    registry: Arc<ServiceRegistry>,
    sessions: SessionTable,
    backend: BackendClient,
    events: EventBus,
}

impl Gateway {
    pub fn new(registry: Arc<ServiceRegistry>, backend: BackendClient, events: EventBus) -> Self {
        Self {
            registry,
            sessions: SessionTable::new(),
            backend,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Handle one raw request body addressed to `service`.
    pub async fn handle(&self, service: &str, body: &[u8]) -> GatewayReply {
        let request = match parse_request(body) {
            Ok(request) => request,
            Err((err, id)) => {
                tracing::debug!(service, error = %err, "rejected malformed request");
                self.events.publish(GatewayEvent::RequestFailed {
                    service: service.to_string(),
                    method: None,
                    error: err.to_string(),
                });
                return GatewayReply::error(&err, id);
            }
        };

        self.events.publish(GatewayEvent::Route {
            service: service.to_string(),
            method: request.method.clone(),
        });

        match self.dispatch(service, &request).await {
            Ok(Some(body)) => GatewayReply::ok(body),
            Ok(None) => GatewayReply::empty(),
            Err(err) => {
                match &err {
                    GatewayError::Backend { .. } => tracing::warn!(
                        service,
                        method = %request.method,
                        error = %err,
                        "backend call failed"
                    ),
                    _ => tracing::debug!(
                        service,
                        method = %request.method,
                        error = %err,
                        "request rejected"
                    ),
                }
                self.events.publish(GatewayEvent::RequestFailed {
                    service: service.to_string(),
                    method: Some(request.method.clone()),
                    error: err.to_string(),
                });
                GatewayReply::error(&err, request.reply_id())
            }
        }
    }

    async fn dispatch(
        &self,
        service: &str,
        request: &JsonRpcRequest,
    ) -> Result<Option<Value>, GatewayError> {
        let method = request.method.as_str();

        if types::is_notification(method) {
            tracing::debug!(service, method, "notification acknowledged");
            self.events.publish(GatewayEvent::Notification {
                service: service.to_string(),
                method: method.to_string(),
            });
            return Ok(None);
        }

        let descriptor =
            self.registry
                .get(service)
                .ok_or_else(|| GatewayError::UnknownService {
                    service: service.to_string(),
                })?;

        if method == INITIALIZE {
            return self.initialize(&descriptor, request).await.map(Some);
        }

        if !self.sessions.is_initialized(service) {
            return Err(GatewayError::NotInitialized {
                service: service.to_string(),
            });
        }

        if !types::is_forwarded_method(method) {
            return Err(GatewayError::MethodNotFound {
                method: method.to_string(),
            });
        }

        self.forward(&descriptor, request).await.map(Some)
    }

    async fn initialize(
        &self,
        descriptor: &ServiceDescriptor,
        request: &JsonRpcRequest,
    ) -> Result<Value, GatewayError> {
        let service = descriptor.name.as_str();
        tracing::info!(service, url = %descriptor.url, "initializing service");
        self.events.publish(GatewayEvent::InitializeStart {
            service: service.to_string(),
        });

        let ticket = self.sessions.begin(service);
        let handshake =
            match handshake::negotiate(&self.backend, service, &descriptor.url, request).await {
                Ok(handshake) => handshake,
                Err(source) => {
                    self.sessions.abort(service, ticket);
                    return Err(GatewayError::Backend {
                        service: service.to_string(),
                        source,
                    });
                }
            };

        let params = InitializeParams::from_params(request.params.as_ref());
        self.sessions.complete(
            service,
            ticket,
            InitializationState {
                protocol_version: params
                    .protocol_version
                    .unwrap_or_else(|| DEFAULT_PROTOCOL_VERSION.to_string()),
                client_info: params.client_info,
                initialized_at: Utc::now(),
            },
        );

        let capabilities = handshake.capabilities.to_json();
        tracing::info!(
            service,
            tools = handshake.capabilities.tool_count,
            capabilities = %capabilities,
            "service initialized"
        );
        self.events.publish(GatewayEvent::InitializeComplete {
            service: service.to_string(),
            capabilities,
            tools_count: handshake.capabilities.tool_count,
        });

        let envelope = JsonRpcResponse::success(request.reply_id(), handshake.result);
        serde_json::to_value(envelope).map_err(|e| GatewayError::Backend {
            service: service.to_string(),
            source: BackendError::Decode {
                reason: e.to_string(),
            },
        })
    }

    async fn forward(
        &self,
        descriptor: &ServiceDescriptor,
        request: &JsonRpcRequest,
    ) -> Result<Value, GatewayError> {
        let service = descriptor.name.as_str();
        tracing::debug!(service, method = %request.method, url = %descriptor.url, "forwarding");
        self.events.publish(GatewayEvent::ProxyRequest {
            service: service.to_string(),
            method: request.method.clone(),
            url: descriptor.url.clone(),
        });

        let outbound = JsonRpcRequest {
            jsonrpc: types::JSONRPC_VERSION.to_string(),
            ..request.clone()
        };
        let envelope = self
            .backend
            .send(&descriptor.url, &outbound)
            .await
            .map_err(|source| GatewayError::Backend {
                service: service.to_string(),
                source,
            })?;

        self.events.publish(GatewayEvent::ProxyResponse {
            service: service.to_string(),
            method: request.method.clone(),
        });
        Ok(envelope)
    }
}

/// Parse a raw body into a request, or the error and id to reply with.
fn parse_request(body: &[u8]) -> Result<JsonRpcRequest, (GatewayError, Value)> {
    let value: Value = serde_json::from_slice(body).map_err(|e| {
        (
            GatewayError::Parse {
                reason: e.to_string(),
            },
            Value::Null,
        )
    })?;

    let Some(object) = value.as_object() else {
        return Err((
            GatewayError::InvalidRequest {
                reason: "request must be a JSON object".into(),
            },
            Value::Null,
        ));
    };

    let id = object.get("id").cloned().unwrap_or(Value::Null);
    if !object.get("method").is_some_and(Value::is_string) {
        return Err((
            GatewayError::InvalidRequest {
                reason: "missing string 'method'".into(),
            },
            id,
        ));
    }

    serde_json::from_value(value).map_err(|e| {
        (
            GatewayError::InvalidRequest {
                reason: e.to_string(),
            },
            id,
        )
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
