//! Discovery endpoint polling.
//!
//! A discovery endpoint answers `GET` with `{"services": [{name, url,
//! description?, capabilities?}, …]}`. Every listed service goes through the
//! same health-gated dynamic registration as an API registration.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};

use super::errors::RegistryError;
use super::types::{ServiceConfig, DEFAULT_DISCOVERED_DESCRIPTION};
use super::ServiceRegistry;
use crate::events::GatewayEvent;

/// What a call to [`ServiceRegistry::refresh`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The previous refresh is younger than the refresh interval.
    Skipped,
    Completed {
        registered: usize,
        failed_endpoints: usize,
    },
}

impl ServiceRegistry {
    /// Add a discovery endpoint. Returns `false` if it was already known.
    pub fn add_discovery_endpoint(&self, url: &str) -> bool {
        let url = url.trim().to_string();
        let inserted = self.endpoints_mut().insert(url.clone());
        if inserted {
            tracing::info!(endpoint = %url, "added discovery endpoint");
            self.events
                .publish(GatewayEvent::DiscoveryEndpointAdded { endpoint: url });
        }
        inserted
    }

    pub fn discovery_endpoints(&self) -> Vec<String> {
        self.endpoints_ref().iter().cloned().collect()
    }

    /// Poll every discovery endpoint and register what they announce.
    ///
    /// A no-op if the last completed refresh is younger than the refresh
    /// interval. Concurrent calls run one after another, so the age check
    /// sees the result of the refresh that was in flight.
    pub async fn refresh(&self) -> RefreshOutcome {
        let mut last_completed = self.refresh_gate.lock().await;
        if let Some(at) = *last_completed {
            if at.elapsed() < self.settings.refresh_interval {
                tracing::debug!("discovery refresh skipped, last refresh is recent");
                return RefreshOutcome::Skipped;
            }
        }
        let outcome = self.poll_endpoints().await;
        *last_completed = Some(Instant::now());
        outcome
    }

    /// Refresh regardless of the age of the last refresh.
    ///
    /// Used by the auto-refresh task, which paces itself.
    pub async fn force_refresh(&self) -> RefreshOutcome {
        let mut last_completed = self.refresh_gate.lock().await;
        let outcome = self.poll_endpoints().await;
        *last_completed = Some(Instant::now());
        outcome
    }

    async fn poll_endpoints(&self) -> RefreshOutcome {
        let endpoints = self.discovery_endpoints();
        tracing::info!(endpoints = endpoints.len(), "refreshing discovery");
        self.events.publish(GatewayEvent::DiscoveryRefreshStart {
            endpoint_count: endpoints.len(),
        });

        let mut registered = 0;
        let mut failed_endpoints = 0;
        for endpoint in &endpoints {
            match self.fetch_endpoint(endpoint).await {
                Ok(entries) => {
                    for (name, config) in entries {
                        if self.register_dynamic(&name, config).await {
                            registered += 1;
                        }
                    }
                }
                Err(e) => {
                    failed_endpoints += 1;
                    tracing::warn!(endpoint = %endpoint, error = %e, "discovery endpoint failed");
                    self.events.publish(GatewayEvent::DiscoveryEndpointError {
                        endpoint: endpoint.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        *self
            .last_refresh
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());

        let service_count = self.len();
        tracing::info!(
            registered,
            failed_endpoints,
            services = service_count,
            "discovery refresh complete"
        );
        self.events
            .publish(GatewayEvent::DiscoveryRefreshComplete { service_count });

        RefreshOutcome::Completed {
            registered,
            failed_endpoints,
        }
    }

    async fn fetch_endpoint(
        &self,
        endpoint: &str,
    ) -> Result<Vec<(String, ServiceConfig)>, RegistryError> {
        let endpoint_error = |reason: String| RegistryError::Endpoint {
            endpoint: endpoint.to_string(),
            reason,
        };

        let response = self
            .http
            .get(endpoint)
            .timeout(self.settings.discovery_timeout)
            .send()
            .await
            .map_err(|e| endpoint_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(endpoint_error(format!("HTTP {status}")));
        }

        let document: Value = response
            .json()
            .await
            .map_err(|e| endpoint_error(format!("invalid discovery document: {e}")))?;

        Ok(parse_discovery_document(&document))
    }

    // ─── Auto refresh ────────────────────────────────────────────────────

    /// Refresh every `refresh_interval` on a background task, replacing any
    /// task already running.
    pub fn start_auto_refresh(self: &Arc<Self>) {
        let period = self.settings.refresh_interval;
        if period.is_zero() {
            tracing::warn!("auto refresh not started, refresh interval is zero");
            return;
        }

        let registry = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.force_refresh().await;
            }
        });

        if let Some(previous) = self.auto_refresh_slot().replace(handle) {
            previous.abort();
        }

        let interval_ms = duration_millis(period);
        tracing::info!(interval_ms, "auto refresh started");
        self.events
            .publish(GatewayEvent::AutoRefreshStarted { interval_ms });
    }

    /// Stop the auto-refresh task, if any.
    pub fn stop_auto_refresh(&self) {
        if let Some(handle) = self.auto_refresh_slot().take() {
            handle.abort();
            tracing::info!("auto refresh stopped");
            self.events.publish(GatewayEvent::AutoRefreshStopped);
        }
    }

    pub fn is_auto_refreshing(&self) -> bool {
        self.auto_refresh_slot()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

/// Extract `(name, config)` pairs from a discovery document, skipping entries
/// without a non-empty `name` and `url`.
pub fn parse_discovery_document(document: &Value) -> Vec<(String, ServiceConfig)> {
    let Some(services) = document.get("services").and_then(Value::as_array) else {
        return Vec::new();
    };

    services
        .iter()
        .filter_map(|entry| {
            let name = entry.get("name")?.as_str()?.trim();
            let url = entry.get("url")?.as_str()?.trim();
            if name.is_empty() || url.is_empty() {
                return None;
            }
            let description = entry
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_DISCOVERED_DESCRIPTION)
                .to_string();
            let capabilities = entry
                .get("capabilities")
                .filter(|c| !c.is_null())
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            Some((
                name.to_string(),
                ServiceConfig {
                    url: url.to_string(),
                    description: Some(description),
                    capabilities: Some(capabilities),
                },
            ))
        })
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

/// Whole milliseconds of `d`, saturating at `u64::MAX`.
fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::registry::RegistrySettings;
    use crate::testing;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn registry_with_interval(refresh_interval: Duration) -> Arc<ServiceRegistry> {
        let settings = RegistrySettings {
            refresh_interval,
            health_timeout: Duration::from_secs(2),
            discovery_timeout: Duration::from_secs(2),
        };
        Arc::new(ServiceRegistry::new(settings, EventBus::new()).unwrap())
    }

    /// A backend that is both healthy and its own discovery endpoint,
    /// counting how often the discovery document is fetched.
    async fn counting_discovery_backend() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let counter = hits.clone();
        let self_url = base.clone();
        let router = Router::new()
            .route("/health", get(|| async { Json(json!({"status": "ok"})) }))
            .route(
                "/services",
                get(move || {
                    let counter = counter.clone();
                    let url = self_url.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Json(json!({
                            "services": [
                                {"name": "calc", "url": url, "description": "Calculator"},
                                {"name": "broken"}
                            ]
                        }))
                    }
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (base, hits)
    }

    #[test]
    fn test_parse_discovery_document_skips_invalid_entries() {
        let doc = json!({
            "services": [
                {"name": "calc", "url": "http://calc:3000"},
                {"name": "", "url": "http://x"},
                {"url": "http://nameless"},
                {"name": "weather", "url": "http://weather", "description": "Weather",
                 "capabilities": {"tools": true}},
                "not an object"
            ]
        });
        let parsed = parse_discovery_document(&doc);
        assert_eq!(parsed.len(), 2);

        let (name, calc) = &parsed[0];
        assert_eq!(name, "calc");
        assert_eq!(
            calc.description.as_deref(),
            Some(DEFAULT_DISCOVERED_DESCRIPTION)
        );
        assert_eq!(calc.capabilities, Some(json!({})));

        assert_eq!(parsed[1].1.capabilities, Some(json!({"tools": true})));
    }

    #[test]
    fn test_parse_discovery_document_without_services_array() {
        assert!(parse_discovery_document(&json!({})).is_empty());
        assert!(parse_discovery_document(&json!({"services": {"a": 1}})).is_empty());
    }

    #[test]
    fn test_add_discovery_endpoint_deduplicates() {
        let registry = registry_with_interval(Duration::from_secs(30));
        assert!(registry.add_discovery_endpoint("http://a/services"));
        assert!(!registry.add_discovery_endpoint("http://a/services"));
        assert!(registry.add_discovery_endpoint("http://b/services"));
        assert_eq!(registry.discovery_endpoints().len(), 2);
        assert_eq!(registry.stats().discovery_endpoints, 2);
    }

    #[tokio::test]
    async fn test_refresh_registers_announced_services() {
        let (base, _) = counting_discovery_backend().await;
        let registry = registry_with_interval(Duration::from_secs(30));
        registry.add_discovery_endpoint(&format!("{base}/services"));

        let outcome = registry.refresh().await;
        assert_eq!(
            outcome,
            RefreshOutcome::Completed {
                registered: 1,
                failed_endpoints: 0
            }
        );
        let calc = registry.get("calc").unwrap();
        assert_eq!(calc.description, "Calculator");
        assert!(registry.get("broken").is_none());
        assert!(registry.stats().last_refresh.is_some());
    }

    #[tokio::test]
    async fn test_refresh_twice_within_interval_hits_network_once() {
        let (base, hits) = counting_discovery_backend().await;
        let registry = registry_with_interval(Duration::from_secs(60));
        registry.add_discovery_endpoint(&format!("{base}/services"));

        let first = registry.refresh().await;
        let second = registry.refresh().await;

        assert!(matches!(first, RefreshOutcome::Completed { .. }));
        assert_eq!(second, RefreshOutcome::Skipped);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_are_serialized() {
        let (base, hits) = counting_discovery_backend().await;
        let registry = registry_with_interval(Duration::from_secs(60));
        registry.add_discovery_endpoint(&format!("{base}/services"));

        let (a, b) = tokio::join!(registry.refresh(), registry.refresh());
        let skipped = [a, b]
            .iter()
            .filter(|o| **o == RefreshOutcome::Skipped)
            .count();
        assert_eq!(skipped, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_endpoint_is_isolated() {
        let (base, _) = counting_discovery_backend().await;
        let down = testing::closed_port_url().await;
        let registry = registry_with_interval(Duration::from_secs(30));
        registry.add_discovery_endpoint(&format!("{down}/services"));
        registry.add_discovery_endpoint(&format!("{base}/services"));

        let outcome = registry.refresh().await;
        assert_eq!(
            outcome,
            RefreshOutcome::Completed {
                registered: 1,
                failed_endpoints: 1
            }
        );
        assert!(registry.get("calc").is_some());
    }

    #[tokio::test]
    async fn test_auto_refresh_polls_and_stops() {
        let (base, hits) = counting_discovery_backend().await;
        let registry = registry_with_interval(Duration::from_millis(50));
        registry.add_discovery_endpoint(&format!("{base}/services"));

        registry.start_auto_refresh();
        assert!(registry.is_auto_refreshing());
        tokio::time::sleep(Duration::from_millis(400)).await;
        registry.stop_auto_refresh();
        assert!(!registry.is_auto_refreshing());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let polled = hits.load(Ordering::SeqCst);
        assert!(polled >= 2, "expected repeated polls, got {polled}");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), polled);
    }

    #[tokio::test]
    async fn test_start_auto_refresh_replaces_running_task() {
        let registry = registry_with_interval(Duration::from_secs(60));
        registry.start_auto_refresh();
        registry.start_auto_refresh();
        assert!(registry.is_auto_refreshing());
        registry.stop_auto_refresh();
        assert!(!registry.is_auto_refreshing());
    }

    #[test]
    fn test_duration_millis_saturates() {
        assert_eq!(duration_millis(Duration::from_millis(30_000)), 30_000);
        assert_eq!(duration_millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_auto_refresh_event_reports_interval() {
        let registry = registry_with_interval(Duration::from_millis(1_500));
        let mut rx = registry.events.subscribe();
        registry.start_auto_refresh();
        registry.stop_auto_refresh();

        match rx.recv().await.unwrap().event {
            GatewayEvent::AutoRefreshStarted { interval_ms } => assert_eq!(interval_ms, 1_500),
            other => panic!("unexpected event {}", other.name()),
        }
    }
}
