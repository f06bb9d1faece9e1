//! Registry data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Description used when a discovered service does not provide one.
pub const DEFAULT_DISCOVERED_DESCRIPTION: &str = "Dynamically discovered service";

/// How a service entered the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceOrigin {
    /// Bootstrapped from configuration at startup.
    Static,
    /// Registered at runtime through the API or a discovery poll.
    Dynamic,
}

impl std::fmt::Display for ServiceOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceOrigin::Static => write!(f, "static"),
            ServiceOrigin::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Where to find a service and what it claims to offer.
///
/// Used both in the static configuration file and in registration requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Self-declared capabilities. Opaque to the gateway, which negotiates
    /// the real set during `initialize`.
    #[serde(default)]
    pub capabilities: Option<Value>,
}

impl ServiceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            description: None,
            capabilities: None,
        }
    }
}

/// A registered service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub url: String,
    #[serde(rename = "type")]
    pub origin: ServiceOrigin,
    pub description: String,
    pub capabilities: Value,
    #[serde(rename = "registered")]
    pub registered_at: DateTime<Utc>,
}

impl ServiceDescriptor {
    pub(crate) fn from_config(
        name: &str,
        config: ServiceConfig,
        origin: ServiceOrigin,
        default_description: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            url: config.url,
            origin,
            description: config
                .description
                .unwrap_or_else(|| default_description.to_string()),
            capabilities: config
                .capabilities
                .unwrap_or_else(|| Value::Object(Default::default())),
            registered_at: Utc::now(),
        }
    }
}

/// Result of probing one service's `/health` endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "type")]
    pub origin: ServiceOrigin,
    pub last_check: DateTime<Utc>,
}

/// Registry counters exposed on `/discovery/stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryStats {
    pub total_services: usize,
    pub static_services: usize,
    pub dynamic_services: usize,
    pub discovery_endpoints: usize,
    pub last_refresh: Option<DateTime<Utc>>,
}

/// Tunables of the registry's outbound calls.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Minimum age of the last refresh before another one hits the network.
    pub refresh_interval: std::time::Duration,
    pub health_timeout: std::time::Duration,
    pub discovery_timeout: std::time::Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            refresh_interval: std::time::Duration::from_secs(30),
            health_timeout: std::time::Duration::from_secs(5),
            discovery_timeout: std::time::Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_descriptor_defaults() {
        let desc = ServiceDescriptor::from_config(
            "calc",
            ServiceConfig::new("http://calc:3000"),
            ServiceOrigin::Static,
            "fallback",
        );
        assert_eq!(desc.description, "fallback");
        assert_eq!(desc.capabilities, json!({}));
    }

    #[test]
    fn test_descriptor_serialization_uses_wire_names() {
        let desc = ServiceDescriptor::from_config(
            "calc",
            ServiceConfig {
                url: "http://calc:3000".into(),
                description: Some("Calculator".into()),
                capabilities: Some(json!({"tools": true})),
            },
            ServiceOrigin::Dynamic,
            "fallback",
        );
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["type"], "dynamic");
        assert_eq!(json["description"], "Calculator");
        assert!(json.get("registered").is_some());
        assert!(json.get("origin").is_none());
    }

    #[test]
    fn test_health_report_omits_absent_fields() {
        let report = HealthReport {
            healthy: false,
            status: None,
            error: Some("connection refused".into()),
            origin: ServiceOrigin::Static,
            last_check: Utc::now(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("status").is_none());
        assert_eq!(json["error"], "connection refused");
        assert!(json.get("lastCheck").is_some());
    }
}
