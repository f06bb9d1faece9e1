//! Process-wide event bus for observability.
//!
//! Publishing never blocks and never fails: events go onto a bounded
//! `tokio::sync::broadcast` channel, and a subscriber that falls behind simply
//! loses the oldest events. Subscribers run in their own tasks, so a panicking
//! handler only takes down its own task.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::registry::ServiceOrigin;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Number of events buffered per subscriber before the oldest are dropped.
const DEFAULT_CAPACITY: usize = 256;

// ─── Events ──────────────────────────────────────────────────────────────────

/// Everything the gateway and the supervisor report about themselves.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum GatewayEvent {
    // Registry
    ServiceRegistered {
        service: String,
        origin: ServiceOrigin,
        url: String,
    },
    ServiceRegistrationFailed {
        service: String,
        error: String,
    },
    ServiceUnregistered {
        service: String,
        origin: ServiceOrigin,
    },
    ServiceUnhealthy {
        service: String,
        status: Option<u16>,
        error: Option<String>,
    },
    DiscoveryEndpointAdded {
        endpoint: String,
    },
    DiscoveryRefreshStart {
        endpoint_count: usize,
    },
    DiscoveryEndpointError {
        endpoint: String,
        error: String,
    },
    DiscoveryRefreshComplete {
        service_count: usize,
    },
    AutoRefreshStarted {
        interval_ms: u64,
    },
    AutoRefreshStopped,

    // Gateway router
    Route {
        service: String,
        method: String,
    },
    Notification {
        service: String,
        method: String,
    },
    InitializeStart {
        service: String,
    },
    InitializeComplete {
        service: String,
        capabilities: serde_json::Value,
        tools_count: usize,
    },
    ProxyRequest {
        service: String,
        method: String,
        url: String,
    },
    ProxyResponse {
        service: String,
        method: String,
    },
    RequestFailed {
        service: String,
        method: Option<String>,
        error: String,
    },

    // Supervisor
    ProcessStarting {
        service: String,
        port: u16,
    },
    ProcessHealthy {
        service: String,
        port: u16,
    },
    ProcessUnhealthy {
        service: String,
        port: u16,
        reason: String,
    },
    ProcessExited {
        service: String,
        code: Option<i32>,
    },
    SourceChanged {
        service: String,
        paths: Vec<String>,
    },
    GatewayRegistration {
        service: String,
        success: bool,
        attempts: u32,
    },

    // Lifecycle
    Startup {
        component: String,
        port: u16,
    },
    Shutdown {
        component: String,
    },
}

impl GatewayEvent {
    /// Stable kebab-case name of the event, as used in the serialized form.
    pub fn name(&self) -> &'static str {
        match self {
            GatewayEvent::ServiceRegistered { .. } => "service-registered",
            GatewayEvent::ServiceRegistrationFailed { .. } => "service-registration-failed",
            GatewayEvent::ServiceUnregistered { .. } => "service-unregistered",
            GatewayEvent::ServiceUnhealthy { .. } => "service-unhealthy",
            GatewayEvent::DiscoveryEndpointAdded { .. } => "discovery-endpoint-added",
            GatewayEvent::DiscoveryRefreshStart { .. } => "discovery-refresh-start",
            GatewayEvent::DiscoveryEndpointError { .. } => "discovery-endpoint-error",
            GatewayEvent::DiscoveryRefreshComplete { .. } => "discovery-refresh-complete",
            GatewayEvent::AutoRefreshStarted { .. } => "auto-refresh-started",
            GatewayEvent::AutoRefreshStopped => "auto-refresh-stopped",
            GatewayEvent::Route { .. } => "route",
            GatewayEvent::Notification { .. } => "notification",
            GatewayEvent::InitializeStart { .. } => "initialize-start",
            GatewayEvent::InitializeComplete { .. } => "initialize-complete",
            GatewayEvent::ProxyRequest { .. } => "proxy-request",
            GatewayEvent::ProxyResponse { .. } => "proxy-response",
            GatewayEvent::RequestFailed { .. } => "request-failed",
            GatewayEvent::ProcessStarting { .. } => "process-starting",
            GatewayEvent::ProcessHealthy { .. } => "process-healthy",
            GatewayEvent::ProcessUnhealthy { .. } => "process-unhealthy",
            GatewayEvent::ProcessExited { .. } => "process-exited",
            GatewayEvent::SourceChanged { .. } => "source-changed",
            GatewayEvent::GatewayRegistration { .. } => "gateway-registration",
            GatewayEvent::Startup { .. } => "startup",
            GatewayEvent::Shutdown { .. } => "shutdown",
        }
    }
}

/// An event stamped with the time it was published.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: GatewayEvent,
}

// ─── EventBus ────────────────────────────────────────────────────────────────

/// Cheaply cloneable handle to the shared event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default per-subscriber buffer.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus buffering `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Never blocks; having no subscribers is not an error.
    pub fn publish(&self, event: GatewayEvent) {
        let envelope = EventEnvelope {
            timestamp: Utc::now(),
            event,
        };

        if tracing::enabled!(tracing::Level::DEBUG) {
            match serde_json::to_string(&envelope.event) {
                Ok(payload) => {
                    tracing::debug!(event = envelope.event.name(), %payload, "event published")
                }
                Err(_) => tracing::debug!(
                    event = envelope.event.name(),
                    "event published (unserializable payload)"
                ),
            }
        }

        let _ = self.tx.send(envelope);
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Run `handler` for every event on a dedicated task.
    ///
    /// Lagging is logged and skipped; the task ends when the bus is dropped.
    pub fn spawn_subscriber<F>(&self, name: &'static str, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(&EventEnvelope) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => handler(&envelope),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(subscriber = name, skipped, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(GatewayEvent::AutoRefreshStopped);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_publish_delivers_with_and_without_debug_logging() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(GatewayEvent::AutoRefreshStopped);

        let debug = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish();
        tracing::subscriber::with_default(debug, || {
            bus.publish(GatewayEvent::Shutdown {
                component: "gateway".into(),
            });
        });

        assert_eq!(rx.try_recv().unwrap().event.name(), "auto-refresh-stopped");
        assert_eq!(rx.try_recv().unwrap().event.name(), "shutdown");
    }

    #[test]
    fn test_event_serializes_with_kebab_tag() {
        let event = GatewayEvent::ServiceRegistered {
            service: "calc".into(),
            origin: ServiceOrigin::Dynamic,
            url: "http://localhost:3101".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "service-registered");
        assert_eq!(json["origin"], "dynamic");
        assert_eq!(event.name(), "service-registered");
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(GatewayEvent::InitializeStart {
            service: "calc".into(),
        });
        bus.publish(GatewayEvent::AutoRefreshStopped);

        assert_eq!(rx.recv().await.unwrap().event.name(), "initialize-start");
        assert_eq!(rx.recv().await.unwrap().event.name(), "auto-refresh-stopped");
    }

    #[tokio::test]
    async fn test_panicking_subscriber_does_not_affect_publisher() {
        let bus = EventBus::new();
        let crashing = bus.spawn_subscriber("crashing", |_| panic!("subscriber bug"));
        let mut healthy = bus.subscribe();

        bus.publish(GatewayEvent::AutoRefreshStopped);
        assert!(crashing.await.is_err(), "task should have panicked");

        bus.publish(GatewayEvent::Shutdown {
            component: "gateway".into(),
        });
        assert_eq!(healthy.recv().await.unwrap().event.name(), "auto-refresh-stopped");
        assert_eq!(healthy.recv().await.unwrap().event.name(), "shutdown");
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();

        for _ in 0..5 {
            bus.publish(GatewayEvent::AutoRefreshStopped);
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
