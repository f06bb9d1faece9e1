//! Runtime configuration for the gateway and the supervisor.
//!
//! Both binaries are configured through environment variables. The gateway can
//! additionally read a YAML file (`GATEWAY_CONFIG`) declaring static services
//! and discovery endpoints; string values in that file may reference
//! environment variables as `${VAR}` or `${VAR:-default}`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::registry::{RegistrySettings, ServiceConfig};

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}

// ─── Gateway ─────────────────────────────────────────────────────────────────

/// Settings of the `mcp-gateway-server` binary.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Optional YAML file with static services and discovery endpoints.
    pub config_path: Option<PathBuf>,
    pub discovery_endpoints: Vec<String>,
    pub refresh_interval: Duration,
    pub auto_refresh: bool,
    pub health_timeout: Duration,
    pub discovery_timeout: Duration,
    /// Timeout for JSON-RPC calls forwarded to backends.
    pub backend_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            config_path: None,
            discovery_endpoints: Vec::new(),
            refresh_interval: Duration::from_millis(30_000),
            auto_refresh: true,
            health_timeout: Duration::from_millis(5_000),
            discovery_timeout: Duration::from_millis(10_000),
            backend_timeout: Duration::from_millis(30_000),
        }
    }
}

impl GatewayConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            host: lookup("HOST")
                .filter(|h| !h.trim().is_empty())
                .unwrap_or(defaults.host),
            port: parse_var(&lookup, "PORT", defaults.port)?,
            config_path: lookup("GATEWAY_CONFIG")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            discovery_endpoints: lookup("DISCOVERY_ENDPOINTS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            refresh_interval: parse_millis(
                &lookup,
                "DISCOVERY_REFRESH_INTERVAL_MS",
                defaults.refresh_interval,
            )?,
            auto_refresh: parse_bool(&lookup, "AUTO_REFRESH", defaults.auto_refresh)?,
            health_timeout: parse_millis(&lookup, "HEALTH_TIMEOUT_MS", defaults.health_timeout)?,
            discovery_timeout: parse_millis(
                &lookup,
                "DISCOVERY_TIMEOUT_MS",
                defaults.discovery_timeout,
            )?,
            backend_timeout: parse_millis(
                &lookup,
                "BACKEND_TIMEOUT_MS",
                defaults.backend_timeout,
            )?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            refresh_interval: self.refresh_interval,
            health_timeout: self.health_timeout,
            discovery_timeout: self.discovery_timeout,
        }
    }
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// Settings of the `mcp-dev-supervisor` binary.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub host: String,
    pub port: u16,
    /// Directory whose subdirectories are candidate projects.
    pub projects_dir: PathBuf,
    /// Subdirectory reserved for code shared between projects.
    pub shared_dir_name: String,
    pub gateway_url: String,
    /// Hostname the gateway uses to reach supervised services.
    pub service_host: String,
    pub base_port: u16,
    pub registration_attempts: u32,
    pub registration_delay: Duration,
    /// How long a freshly spawned service has to pass its health probe.
    pub health_grace: Duration,
    pub health_poll_interval: Duration,
    pub restart_delay: Duration,
    /// Program and arguments run in a project before its first start.
    /// Empty disables installation.
    pub install_command: Vec<String>,
    pub max_error_entries: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3200,
            projects_dir: PathBuf::from("/app/custom-mcps"),
            shared_dir_name: "shared".into(),
            gateway_url: "http://mcp-gateway:8080".into(),
            service_host: "dev-mcp-service".into(),
            base_port: 3100,
            registration_attempts: 5,
            registration_delay: Duration::from_millis(2_000),
            health_grace: Duration::from_millis(2_000),
            health_poll_interval: Duration::from_millis(250),
            restart_delay: Duration::from_millis(1_000),
            install_command: vec!["npm".into(), "install".into()],
            max_error_entries: 100,
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let registration_attempts: u32 =
            parse_var(&lookup, "REGISTRATION_RETRIES", defaults.registration_attempts)?;
        if registration_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "REGISTRATION_RETRIES".into(),
                value: "0".into(),
                reason: "at least one attempt is required".into(),
            });
        }

        Ok(Self {
            host: lookup("HOST")
                .filter(|h| !h.trim().is_empty())
                .unwrap_or(defaults.host),
            port: parse_var(&lookup, "PORT", defaults.port)?,
            projects_dir: lookup("CUSTOM_MCPS_DIR")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.projects_dir),
            shared_dir_name: lookup("SHARED_DIR_NAME")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.shared_dir_name),
            gateway_url: lookup("GATEWAY_URL")
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(defaults.gateway_url),
            service_host: lookup("SERVICE_HOST")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.service_host),
            base_port: parse_var(&lookup, "BASE_PORT", defaults.base_port)?,
            registration_attempts,
            registration_delay: parse_millis(
                &lookup,
                "REGISTRATION_RETRY_DELAY_MS",
                defaults.registration_delay,
            )?,
            health_grace: parse_millis(&lookup, "HEALTH_GRACE_MS", defaults.health_grace)?,
            health_poll_interval: parse_millis(
                &lookup,
                "HEALTH_POLL_INTERVAL_MS",
                defaults.health_poll_interval,
            )?,
            restart_delay: parse_millis(&lookup, "RESTART_DELAY_MS", defaults.restart_delay)?,
            install_command: lookup("INSTALL_COMMAND")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or(defaults.install_command),
            max_error_entries: parse_var(
                &lookup,
                "MAX_ERROR_ENTRIES",
                defaults.max_error_entries,
            )?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ─── Static services file ────────────────────────────────────────────────────

/// Contents of the optional gateway YAML file.
///
/// ```yaml
/// services:
///   calc:
///     url: ${CALC_URL:-http://calc:3000}
///     description: Calculator
/// discovery_endpoints:
///   - http://registry.internal/services
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticServicesFile {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub discovery_endpoints: Vec<String>,
}

/// Load and parse the static services file, interpolating environment
/// variables first.
pub fn load_static_services(path: &Path) -> Result<StaticServicesFile, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    parse_static_services(&raw, |key| std::env::var(key).ok()).map_err(|reason| {
        ConfigError::Parse {
            path: path.display().to_string(),
            reason,
        }
    })
}

fn parse_static_services<F>(raw: &str, lookup: F) -> Result<StaticServicesFile, String>
where
    F: Fn(&str) -> Option<String>,
{
    let interpolated = interpolate_vars(raw, &lookup);
    if interpolated.trim().is_empty() {
        return Ok(StaticServicesFile::default());
    }
    serde_yaml::from_str(&interpolated).map_err(|e| e.to_string())
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_vars<F>(input: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                expr.push(c);
            }
            result.push_str(&resolve_var_expr(&expr, lookup));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. Unset variables without a default expand
/// to the empty string.
fn resolve_var_expr<F>(expr: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match expr.split_once(":-") {
        Some((name, default)) => lookup(name).unwrap_or_else(|| default.to_string()),
        None => lookup(expr).unwrap_or_default(),
    }
}

// ─── Parsing helpers ─────────────────────────────────────────────────────────

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

fn parse_millis<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_var(lookup, key, default_ms).map(Duration::from_millis)
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
            reason: "expected a boolean".into(),
        }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
