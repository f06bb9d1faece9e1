//! In-memory service registry.
//!
//! Maps service names to [`ServiceDescriptor`]s. Static services are loaded
//! once at startup; dynamic services are admitted at runtime only after a
//! passing health probe, either through the registration API or by polling
//! discovery endpoints (see [`discovery`]).
//!
//! The registry is not persisted: it is rebuilt from configuration and
//! discovery on every start.

pub mod discovery;
pub mod errors;
pub mod types;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::events::{EventBus, GatewayEvent};
use crate::health;

pub use discovery::{parse_discovery_document, RefreshOutcome};
pub use errors::RegistryError;
pub use types::{
    DiscoveryStats, HealthReport, RegistrySettings, ServiceConfig, ServiceDescriptor,
    ServiceOrigin, DEFAULT_DISCOVERED_DESCRIPTION,
};

/// Connect timeout for every outbound registry call.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── ServiceRegistry ─────────────────────────────────────────────────────────

pub struct ServiceRegistry {
    services: RwLock<HashMap<String, ServiceDescriptor>>,
    endpoints: RwLock<BTreeSet<String>>,
    /// Held for the whole of a refresh; stores when the last one completed.
    refresh_gate: tokio::sync::Mutex<Option<tokio::time::Instant>>,
    last_refresh: RwLock<Option<DateTime<Utc>>>,
    auto_refresh: Mutex<Option<JoinHandle<()>>>,
    settings: RegistrySettings,
    http: reqwest::Client,
    events: EventBus,
}

impl ServiceRegistry {
    pub fn new(settings: RegistrySettings, events: EventBus) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| RegistryError::Client {
                reason: e.to_string(),
            })?;

        Ok(Self {
            services: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(BTreeSet::new()),
            refresh_gate: tokio::sync::Mutex::new(None),
            last_refresh: RwLock::new(None),
            auto_refresh: Mutex::new(None),
            settings,
            http,
            events,
        })
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Bulk-load static services, overwriting any existing entry by name.
    ///
    /// Returns the number of services loaded.
    pub fn register_static<I>(&self, services: I) -> usize
    where
        I: IntoIterator<Item = (String, ServiceConfig)>,
    {
        let mut count = 0;
        for (name, config) in services {
            let descriptor =
                ServiceDescriptor::from_config(&name, config, ServiceOrigin::Static, "");
            let url = descriptor.url.clone();
            self.services_mut().insert(name.clone(), descriptor);
            tracing::info!(service = %name, url = %url, "registered static service");
            self.events.publish(GatewayEvent::ServiceRegistered {
                service: name,
                origin: ServiceOrigin::Static,
                url,
            });
            count += 1;
        }
        count
    }

    /// Register a service at runtime. Returns `false` when the health probe
    /// fails, in which case the registry is left untouched.
    pub async fn register_dynamic(&self, name: &str, config: ServiceConfig) -> bool {
        self.try_register_dynamic(name, config).await.is_ok()
    }

    /// Like [`register_dynamic`](Self::register_dynamic) but reports why the
    /// registration was rejected.
    pub async fn try_register_dynamic(
        &self,
        name: &str,
        config: ServiceConfig,
    ) -> Result<ServiceDescriptor, RegistryError> {
        if let Err(source) =
            health::probe(&self.http, &config.url, self.settings.health_timeout).await
        {
            tracing::warn!(
                service = %name,
                url = %config.url,
                error = %source,
                "dynamic registration rejected"
            );
            self.events.publish(GatewayEvent::ServiceRegistrationFailed {
                service: name.to_string(),
                error: source.to_string(),
            });
            return Err(RegistryError::HealthCheckFailed {
                service: name.to_string(),
                source,
            });
        }

        let descriptor = ServiceDescriptor::from_config(
            name,
            config,
            ServiceOrigin::Dynamic,
            DEFAULT_DISCOVERED_DESCRIPTION,
        );
        self.services_mut()
            .insert(name.to_string(), descriptor.clone());

        tracing::info!(service = %name, url = %descriptor.url, "registered dynamic service");
        self.events.publish(GatewayEvent::ServiceRegistered {
            service: name.to_string(),
            origin: ServiceOrigin::Dynamic,
            url: descriptor.url.clone(),
        });
        Ok(descriptor)
    }

    /// Remove a service. Returns whether it existed.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.services_mut().remove(name);
        match removed {
            Some(descriptor) => {
                tracing::info!(service = %name, origin = %descriptor.origin, "unregistered service");
                self.events.publish(GatewayEvent::ServiceUnregistered {
                    service: name.to_string(),
                    origin: descriptor.origin,
                });
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<ServiceDescriptor> {
        self.services().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services().contains_key(name)
    }

    /// All services, ordered by name.
    pub fn list(&self) -> Vec<ServiceDescriptor> {
        let mut all: Vec<_> = self.services().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn list_by_origin(&self, origin: ServiceOrigin) -> Vec<ServiceDescriptor> {
        self.list()
            .into_iter()
            .filter(|s| s.origin == origin)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services().is_empty()
    }

    /// Probe every registered service concurrently. Never mutates the registry.
    pub async fn health_check_all(&self) -> BTreeMap<String, HealthReport> {
        let timeout = self.settings.health_timeout;
        let checks = self.list().into_iter().map(|service| async move {
            let outcome = health::probe(&self.http, &service.url, timeout).await;
            (service, outcome)
        });

        let mut reports = BTreeMap::new();
        for (service, outcome) in futures::future::join_all(checks).await {
            let report = match outcome {
                Ok(status) => HealthReport {
                    healthy: true,
                    status: Some(status),
                    error: None,
                    origin: service.origin,
                    last_check: Utc::now(),
                },
                Err(e) => {
                    let status = match &e {
                        health::ProbeError::Status { status } => Some(*status),
                        _ => None,
                    };
                    let error = if status.is_none() {
                        Some(e.to_string())
                    } else {
                        None
                    };
                    tracing::warn!(service = %service.name, error = %e, "service unhealthy");
                    self.events.publish(GatewayEvent::ServiceUnhealthy {
                        service: service.name.clone(),
                        status,
                        error: error.clone(),
                    });
                    HealthReport {
                        healthy: false,
                        status,
                        error,
                        origin: service.origin,
                        last_check: Utc::now(),
                    }
                }
            };
            reports.insert(service.name, report);
        }
        reports
    }

    pub fn stats(&self) -> DiscoveryStats {
        let services = self.services();
        let static_services = services
            .values()
            .filter(|s| s.origin == ServiceOrigin::Static)
            .count();
        DiscoveryStats {
            total_services: services.len(),
            static_services,
            dynamic_services: services.len() - static_services,
            discovery_endpoints: self.endpoints_ref().len(),
            last_refresh: *self
                .last_refresh
                .read()
                .unwrap_or_else(|e| e.into_inner()),
        }
    }

    // ─── Lock helpers ────────────────────────────────────────────────────

    fn services(&self) -> RwLockReadGuard<'_, HashMap<String, ServiceDescriptor>> {
        self.services.read().unwrap_or_else(|e| e.into_inner())
    }

    fn services_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, ServiceDescriptor>> {
        self.services.write().unwrap_or_else(|e| e.into_inner())
    }

    fn endpoints_ref(&self) -> RwLockReadGuard<'_, BTreeSet<String>> {
        self.endpoints.read().unwrap_or_else(|e| e.into_inner())
    }

    fn endpoints_mut(&self) -> RwLockWriteGuard<'_, BTreeSet<String>> {
        self.endpoints.write().unwrap_or_else(|e| e.into_inner())
    }

    fn auto_refresh_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.auto_refresh.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.auto_refresh_slot().take() {
            handle.abort();
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
