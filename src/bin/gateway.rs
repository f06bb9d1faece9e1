//! MCP gateway server.
//!
//! Routes JSON-RPC requests at `/mcp/{service}` to registered backend
//! services and exposes the discovery API.
//!
//! # Environment Variables
//!
//! - `PORT`, `HOST`: listen address (default `0.0.0.0:8080`)
//! - `GATEWAY_CONFIG`: YAML file with static services and discovery endpoints
//! - `DISCOVERY_ENDPOINTS`: comma-separated discovery URLs
//! - `DISCOVERY_REFRESH_INTERVAL_MS`, `AUTO_REFRESH`: discovery polling
//! - `HEALTH_TIMEOUT_MS`, `DISCOVERY_TIMEOUT_MS`, `BACKEND_TIMEOUT_MS`
//! - `LOG_DIR`, `LOG_FORMAT`, `RUST_LOG`: logging

use std::sync::Arc;

use anyhow::Context;
use mcp_gateway::config::{self, GatewayConfig};
use mcp_gateway::events::{EventBus, GatewayEvent};
use mcp_gateway::gateway::router::{router, GatewayState};
use mcp_gateway::gateway::{BackendClient, Gateway};
use mcp_gateway::registry::ServiceRegistry;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

const COMPONENT: &str = "gateway";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mcp_gateway::init_tracing(COMPONENT)?;

    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;
    let events = EventBus::new();

    let registry = Arc::new(ServiceRegistry::new(
        config.registry_settings(),
        events.clone(),
    )?);

    let mut endpoints = config.discovery_endpoints.clone();
    if let Some(path) = &config.config_path {
        let file = config::load_static_services(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        let loaded = registry.register_static(file.services);
        tracing::info!(path = %path.display(), services = loaded, "static services loaded");
        endpoints.extend(file.discovery_endpoints);
    }
    for endpoint in &endpoints {
        registry.add_discovery_endpoint(endpoint);
    }

    if !endpoints.is_empty() {
        registry.refresh().await;
    }
    if config.auto_refresh {
        registry.start_auto_refresh();
    }

    let backend = BackendClient::new(config.backend_timeout)?;
    let gateway = Arc::new(Gateway::new(registry.clone(), backend, events.clone()));

    let app = router(GatewayState::new(gateway))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(
        addr = %addr,
        services = registry.len(),
        discovery_endpoints = endpoints.len(),
        auto_refresh = config.auto_refresh,
        "MCP gateway listening"
    );
    events.publish(GatewayEvent::Startup {
        component: COMPONENT.into(),
        port: config.port,
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(mcp_gateway::shutdown_signal())
        .await?;

    registry.stop_auto_refresh();
    events.publish(GatewayEvent::Shutdown {
        component: COMPONENT.into(),
    });
    tracing::info!("gateway shutdown complete");
    Ok(())
}
