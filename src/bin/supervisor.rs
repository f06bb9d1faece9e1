//! Development supervisor for custom MCP services.
//!
//! Runs every project under `CUSTOM_MCPS_DIR` as a child process, restarts
//! it when its sources change and registers it with the gateway.
//!
//! # Environment Variables
//!
//! - `PORT`, `HOST`: listen address (default `0.0.0.0:3200`)
//! - `CUSTOM_MCPS_DIR`, `SHARED_DIR_NAME`: where projects live
//! - `GATEWAY_URL`, `SERVICE_HOST`: gateway registration
//! - `BASE_PORT`: first port handed to a service
//! - `INSTALL_COMMAND`: dependency install command (empty disables)
//! - `LOG_DIR`, `LOG_FORMAT`, `RUST_LOG`: logging

use anyhow::Context;
use mcp_gateway::config::SupervisorConfig;
use mcp_gateway::events::{EventBus, GatewayEvent};
use mcp_gateway::supervisor::api::{router, SupervisorState};
use mcp_gateway::supervisor::Supervisor;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

const COMPONENT: &str = "supervisor";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mcp_gateway::init_tracing(COMPONENT)?;

    let config = SupervisorConfig::from_env().context("invalid supervisor configuration")?;
    let events = EventBus::new();
    let supervisor = Supervisor::new(config.clone(), events.clone())?;

    tracing::info!(
        projects_dir = %config.projects_dir.display(),
        gateway_url = %config.gateway_url,
        base_port = config.base_port,
        "starting development supervisor"
    );

    // Loading can take a while (installs, health grace, registration
    // retries); serve the API meanwhile.
    let scanner = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            let report = supervisor.scan().await;
            if !report.failed.is_empty() {
                tracing::warn!(failed = ?report.failed, "some projects failed to load");
            }
        })
    };

    let app = router(SupervisorState::new(supervisor.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(addr = %addr, "development supervisor listening");
    events.publish(GatewayEvent::Startup {
        component: COMPONENT.into(),
        port: config.port,
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(mcp_gateway::shutdown_signal())
        .await?;

    scanner.abort();
    supervisor.shutdown().await;
    events.publish(GatewayEvent::Shutdown {
        component: COMPONENT.into(),
    });
    tracing::info!("supervisor shutdown complete");
    Ok(())
}
