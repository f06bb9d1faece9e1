//! Development process supervisor.
//!
//! Discovers service projects in a directory, installs their dependencies,
//! runs each one as a child process on its own port, restarts it when its
//! sources change, and registers it with the gateway.
//!
//! Operations on one service (`start`, `restart`, `stop`) are serialized by a
//! per-name async lock, so a restart requested while another is in flight
//! queues behind it and never overlaps two processes of the same record.

pub mod api;
pub mod errors;
pub mod install;
pub mod lifecycle;
pub mod ports;
pub mod projects;
pub mod registration;
pub mod types;
pub mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;

use crate::config::SupervisorConfig;
use crate::events::{EventBus, GatewayEvent};
use lifecycle::{LifecycleContext, ServiceEntry};
use ports::PortAllocator;
use projects::SkippedProject;
use watcher::ServiceWatcher;

pub use errors::SupervisorError;
pub use types::{ErrorEntry, ProcessRecord, ProcessStatus, ServerManifest};

/// Connect timeout for outbound supervisor calls.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of scanning the projects directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    /// Services that were loaded, whatever their health.
    pub loaded: Vec<String>,
    /// Projects whose load failed, e.g. on dependency install.
    pub failed: Vec<SkippedProject>,
    /// Directories without a valid service declaration.
    pub skipped: Vec<SkippedProject>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    http: reqwest::Client,
    ports: PortAllocator,
    ctx: LifecycleContext,
    watchers: Mutex<HashMap<String, ServiceWatcher>>,
    op_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    generation: AtomicU64,
    /// Handed to watcher callbacks so they can schedule restarts.
    this: Weak<Supervisor>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, events: EventBus) -> Result<Arc<Self>, SupervisorError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SupervisorError::Client {
                reason: e.to_string(),
            })?;

        Ok(Arc::new_cyclic(|this| Self {
            ports: PortAllocator::new(config.base_port),
            ctx: LifecycleContext {
                table: Arc::default(),
                events,
                max_error_entries: config.max_error_entries,
            },
            config,
            http,
            watchers: Mutex::new(HashMap::new()),
            op_locks: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            this: this.clone(),
        }))
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    // ── Discovery ────────────────────────────────────────────────────────

    /// Scan the configured projects directory and load every service found.
    pub async fn scan(&self) -> ScanReport {
        let dir = self.config.projects_dir.clone();
        self.scan_dir(&dir).await
    }

    /// Scan `dir` and load every service found. No single project failure
    /// aborts the scan.
    pub async fn scan_dir(&self, dir: &Path) -> ScanReport {
        let scan = projects::scan_projects(dir, &self.config.shared_dir_name);
        let mut report = ScanReport {
            skipped: scan.skipped,
            ..ScanReport::default()
        };

        for candidate in scan.candidates {
            match self
                .load(&candidate.name, candidate.path, candidate.manifest)
                .await
            {
                Ok(_) => report.loaded.push(candidate.name),
                Err(e) => {
                    tracing::error!(service = %candidate.name, error = %e, "failed to load service");
                    report.failed.push(SkippedProject {
                        name: candidate.name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            dir = %dir.display(),
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "project scan complete"
        );
        report
    }

    /// Bring up one project: port, install, start, watch, register.
    ///
    /// Only port allocation and dependency install can fail the load; the
    /// returned status is the health outcome of the first start.
    pub async fn load(
        &self,
        name: &str,
        path: PathBuf,
        manifest: ServerManifest,
    ) -> Result<ProcessStatus, SupervisorError> {
        let port = self.ports.allocate()?;
        tracing::info!(service = name, port, path = %path.display(), "loading service");

        install::install_dependencies(name, &path, &self.config.install_command).await?;

        let status = self.start(name, path.clone(), port, manifest.clone()).await;
        self.setup_watcher(name, &path);
        self.register_with_gateway(name, port, &manifest).await;
        Ok(status)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Start the service and wait for its health outcome.
    ///
    /// Any process still running for the record is terminated first.
    pub async fn start(
        &self,
        name: &str,
        path: PathBuf,
        port: u16,
        manifest: ServerManifest,
    ) -> ProcessStatus {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;
        self.start_locked(name, path, port, manifest).await
    }

    async fn start_locked(
        &self,
        name: &str,
        path: PathBuf,
        port: u16,
        manifest: ServerManifest,
    ) -> ProcessStatus {
        let previous = {
            let mut table = self.ctx.table.lock().await;
            table.get_mut(name).and_then(|entry| entry.process.take())
        };
        if let Some(process) = previous {
            process.terminate().await;
        }

        self.ctx.events.publish(GatewayEvent::ProcessStarting {
            service: name.to_string(),
            port,
        });

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut record = ProcessRecord::new(name, path, port, manifest, generation);

        {
            let mut table = self.ctx.table.lock().await;
            match lifecycle::spawn_process(&self.ctx, &record) {
                Ok(process) => {
                    record.pid = process.pid();
                    table.insert(
                        name.to_string(),
                        ServiceEntry {
                            record,
                            process: Some(process),
                        },
                    );
                }
                Err(e) => {
                    tracing::error!(service = name, error = %e, "failed to start service");
                    record.status = ProcessStatus::Error;
                    record.push_error(e.to_string(), self.ctx.max_error_entries);
                    table.insert(
                        name.to_string(),
                        ServiceEntry {
                            record,
                            process: None,
                        },
                    );
                    drop(table);
                    self.ctx.events.publish(GatewayEvent::ProcessUnhealthy {
                        service: name.to_string(),
                        port,
                        reason: e.to_string(),
                    });
                    return ProcessStatus::Error;
                }
            }
        }

        let outcome = lifecycle::wait_until_healthy(
            &self.http,
            port,
            self.config.health_grace,
            self.config.health_poll_interval,
        )
        .await;

        let status = {
            let mut table = self.ctx.table.lock().await;
            let Some(entry) = table
                .get_mut(name)
                .filter(|entry| entry.record.generation == generation)
            else {
                // Stopped or replaced while probing.
                return ProcessStatus::Stopped;
            };

            match &outcome {
                Ok(()) if entry.record.status == ProcessStatus::Starting => {
                    entry.record.status = ProcessStatus::Running;
                }
                Ok(()) => {}
                Err(e) => {
                    entry.record.status = ProcessStatus::Error;
                    entry
                        .record
                        .push_error(e.to_string(), self.ctx.max_error_entries);
                }
            }
            entry.record.status
        };

        match outcome {
            Ok(()) => {
                tracing::info!(service = name, port, %status, "service healthy");
                self.ctx.events.publish(GatewayEvent::ProcessHealthy {
                    service: name.to_string(),
                    port,
                });
            }
            Err(e) => {
                tracing::warn!(service = name, port, error = %e, "service failed its health check");
                self.ctx.events.publish(GatewayEvent::ProcessUnhealthy {
                    service: name.to_string(),
                    port,
                    reason: e.to_string(),
                });
            }
        }
        status
    }

    /// Kill and start the service again on the same port, then re-register.
    ///
    /// Returns `None` for an unknown service.
    pub async fn restart(&self, name: &str) -> Option<ProcessStatus> {
        let lock = self.op_lock(name);
        let guard = lock.lock().await;

        let (path, port, manifest, process) = {
            let mut table = self.ctx.table.lock().await;
            let entry = table.get_mut(name)?;
            (
                entry.record.project_path.clone(),
                entry.record.port,
                entry.record.manifest.clone(),
                entry.process.take(),
            )
        };

        tracing::info!(service = name, port, "restarting service");
        if let Some(process) = process {
            process.terminate().await;
        }
        tokio::time::sleep(self.config.restart_delay).await;

        let status = self
            .start_locked(name, path, port, manifest.clone())
            .await;
        drop(guard);

        self.register_with_gateway(name, port, &manifest).await;
        Some(status)
    }

    /// Stop the service and forget it. Returns `false` if it was unknown.
    pub async fn stop(&self, name: &str) -> bool {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;

        let watcher = self.lock_watchers().remove(name);
        if let Some(watcher) = watcher {
            watcher.close();
        }

        let entry = self.ctx.table.lock().await.remove(name);
        match entry {
            Some(entry) => {
                if let Some(process) = entry.process {
                    process.terminate().await;
                }
                tracing::info!(service = name, "service stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every service.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.ctx.table.lock().await.keys().cloned().collect();
        tracing::info!(services = names.len(), "stopping all services");
        for name in names {
            self.stop(&name).await;
        }
        let remaining: Vec<ServiceWatcher> = self.lock_watchers().drain().map(|(_, w)| w).collect();
        for watcher in remaining {
            watcher.close();
        }
    }

    // ── Watching & registration ──────────────────────────────────────────

    /// Watch the project sources and restart the service on change.
    ///
    /// Returns `false` if the watch could not be established.
    pub fn setup_watcher(&self, name: &str, path: &Path) -> bool {
        let this = self.this.clone();
        let events = self.ctx.events.clone();
        let service = name.to_string();

        let result = watcher::watch_project(name, path, move |paths| {
            tracing::info!(service = %service, files = paths.len(), "sources changed, restarting");
            events.publish(GatewayEvent::SourceChanged {
                service: service.clone(),
                paths: paths.iter().map(|p| p.display().to_string()).collect(),
            });

            let Some(supervisor) = this.upgrade() else {
                return;
            };
            let service = service.clone();
            tokio::spawn(async move {
                supervisor.restart(&service).await;
            });
        });

        match result {
            Ok(watcher) => {
                let previous = self.lock_watchers().insert(name.to_string(), watcher);
                if let Some(previous) = previous {
                    previous.close();
                }
                true
            }
            Err(e) => {
                tracing::warn!(service = name, error = %e, "failed to watch sources");
                false
            }
        }
    }

    /// Announce the service to the gateway. Never fails; returns success.
    pub async fn register_with_gateway(
        &self,
        name: &str,
        port: u16,
        manifest: &ServerManifest,
    ) -> bool {
        let payload =
            registration::registration_payload(name, port, manifest, &self.config.service_host);
        let (success, attempts) = registration::register_with_retry(
            &self.http,
            &self.config.gateway_url,
            &payload,
            self.config.registration_attempts,
            self.config.registration_delay,
        )
        .await;

        self.ctx.events.publish(GatewayEvent::GatewayRegistration {
            service: name.to_string(),
            success,
            attempts,
        });
        success
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// All records, sorted by name.
    pub async fn list(&self) -> Vec<ProcessRecord> {
        let table = self.ctx.table.lock().await;
        let mut records: Vec<_> = table.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub async fn get(&self, name: &str) -> Option<ProcessRecord> {
        self.ctx
            .table
            .lock()
            .await
            .get(name)
            .map(|e| e.record.clone())
    }

    /// Port of the service if it is currently `running`.
    pub async fn running_port(&self, name: &str) -> Option<u16> {
        self.ctx
            .table
            .lock()
            .await
            .get(name)
            .filter(|e| e.record.status == ProcessStatus::Running)
            .map(|e| e.record.port)
    }

    pub fn is_watching(&self, name: &str) -> bool {
        self.lock_watchers().contains_key(name)
    }

    // ── Private helpers ──────────────────────────────────────────────────

    fn op_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.op_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn lock_watchers(&self) -> MutexGuard<'_, HashMap<String, ServiceWatcher>> {
        self.watchers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn port_of(base_url: &str) -> u16 {
        base_url.rsplit(':').next().unwrap().parse().unwrap()
    }

    async fn test_config(base_port: u16) -> SupervisorConfig {
        SupervisorConfig {
            gateway_url: testing::closed_port_url().await,
            base_port,
            registration_attempts: 1,
            registration_delay: Duration::from_millis(10),
            health_grace: Duration::from_millis(300),
            health_poll_interval: Duration::from_millis(50),
            restart_delay: Duration::from_millis(10),
            install_command: Vec::new(),
            ..SupervisorConfig::default()
        }
    }

    fn sleeper() -> ServerManifest {
        ServerManifest {
            command: Some("sleep".into()),
            args: Some(vec!["30".into()]),
            ..ServerManifest::default()
        }
    }

    fn write_project(root: &Path, name: &str, server: serde_json::Value) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("package.json"),
            json!({"name": name, "mcpServer": server}).to_string(),
        )
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_unhealthy_service_is_error_and_keeps_running() {
        let port = port_of(&testing::closed_port_url().await);
        let supervisor = Supervisor::new(test_config(port).await, EventBus::new()).unwrap();
        let tmp = TempDir::new().unwrap();

        let status = supervisor
            .load("calc", tmp.path().to_path_buf(), sleeper())
            .await
            .unwrap();
        assert_eq!(status, ProcessStatus::Error);

        let record = supervisor.get("calc").await.unwrap();
        assert_eq!(record.port, port);
        assert!(record.pid.is_some());
        assert!(record
            .errors
            .iter()
            .any(|e| e.message.contains("Health check")));
        assert!(supervisor.running_port("calc").await.is_none());

        supervisor.shutdown().await;
        assert!(supervisor.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_healthy_service_is_running() {
        // The probe only looks at the port, so a mock health server stands in
        // for the child's HTTP listener.
        let health = testing::serve(testing::healthy_router()).await;
        let port = port_of(&health);
        let supervisor = Supervisor::new(test_config(port).await, EventBus::new()).unwrap();
        let tmp = TempDir::new().unwrap();

        let status = supervisor
            .start("calc", tmp.path().to_path_buf(), port, sleeper())
            .await;
        assert_eq!(status, ProcessStatus::Running);
        assert_eq!(supervisor.running_port("calc").await, Some(port));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_preserves_port() {
        let port = port_of(&testing::closed_port_url().await);
        let supervisor = Supervisor::new(test_config(port).await, EventBus::new()).unwrap();
        let tmp = TempDir::new().unwrap();

        supervisor
            .load("calc", tmp.path().to_path_buf(), sleeper())
            .await
            .unwrap();
        let before = supervisor.get("calc").await.unwrap();

        supervisor.restart("calc").await.unwrap();
        let after = supervisor.get("calc").await.unwrap();

        assert_eq!(after.port, before.port);
        assert_ne!(after.pid, before.pid);
        assert!(after.last_started >= before.last_started);

        supervisor.shutdown().await;
    }

    fn is_alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_concurrent_restarts_are_serialized() {
        let port = port_of(&testing::closed_port_url().await);
        let events = EventBus::new();
        let supervisor = Supervisor::new(test_config(port).await, events.clone()).unwrap();
        let tmp = TempDir::new().unwrap();

        supervisor
            .load("calc", tmp.path().to_path_buf(), sleeper())
            .await
            .unwrap();
        let original = supervisor.get("calc").await.unwrap().pid.unwrap();
        let mut rx = events.subscribe();

        let (first, second) = tokio::join!(supervisor.restart("calc"), supervisor.restart("calc"));
        assert!(first.is_some());
        assert!(second.is_some());

        let record = supervisor.get("calc").await.unwrap();
        assert_eq!(record.port, port);
        let current = record.pid.unwrap();
        assert_ne!(current, original);
        assert!(is_alive(current));
        assert!(!is_alive(original));

        // Two spawns, and each was preceded by the exit of the process it
        // replaced: the original and the first replacement.
        let mut order = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            match envelope.event {
                GatewayEvent::ProcessStarting { .. } => order.push("starting"),
                GatewayEvent::ProcessExited { .. } => order.push("exited"),
                _ => {}
            }
        }
        assert_eq!(order, vec!["exited", "starting", "exited", "starting"]);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_unknown_is_noop() {
        let supervisor = Supervisor::new(test_config(3100).await, EventBus::new()).unwrap();
        assert!(supervisor.restart("ghost").await.is_none());
        assert!(supervisor.get("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let port = port_of(&testing::closed_port_url().await);
        let supervisor = Supervisor::new(test_config(port).await, EventBus::new()).unwrap();
        let tmp = TempDir::new().unwrap();

        supervisor
            .load("calc", tmp.path().to_path_buf(), sleeper())
            .await
            .unwrap();
        assert!(supervisor.is_watching("calc"));

        assert!(supervisor.stop("calc").await);
        assert!(!supervisor.stop("calc").await);
        assert!(supervisor.get("calc").await.is_none());
        assert!(!supervisor.is_watching("calc"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_recorded() {
        let port = port_of(&testing::closed_port_url().await);
        let supervisor = Supervisor::new(test_config(port).await, EventBus::new()).unwrap();
        let tmp = TempDir::new().unwrap();
        let manifest = ServerManifest {
            command: Some("sh".into()),
            args: Some(vec!["-c".into(), "echo boom >&2; exit 3".into()]),
            ..ServerManifest::default()
        };

        supervisor
            .start("calc", tmp.path().to_path_buf(), port, manifest)
            .await;
        let record = supervisor.get("calc").await.unwrap();

        assert!(record.pid.is_none());
        let messages: Vec<_> = record.errors.iter().map(|e| e.message.as_str()).collect();
        assert!(messages.contains(&"Process exited with code 3"), "{messages:?}");
        assert!(messages.contains(&"boom"), "{messages:?}");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error_status() {
        let supervisor = Supervisor::new(test_config(3100).await, EventBus::new()).unwrap();
        let tmp = TempDir::new().unwrap();
        let manifest = ServerManifest {
            command: Some("definitely-not-a-real-binary-xyz".into()),
            ..ServerManifest::default()
        };

        let status = supervisor
            .start("calc", tmp.path().to_path_buf(), 3100, manifest)
            .await;
        assert_eq!(status, ProcessStatus::Error);
        let record = supervisor.get("calc").await.unwrap();
        assert!(record.errors[0].message.contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_scan_loads_declared_projects() {
        let port = port_of(&testing::closed_port_url().await);
        let supervisor = Supervisor::new(test_config(port).await, EventBus::new()).unwrap();
        let tmp = TempDir::new().unwrap();
        write_project(tmp.path(), "calc", json!({"command": "sleep", "args": ["30"]}));
        write_project(tmp.path(), "shared", json!({"command": "sleep", "args": ["30"]}));
        fs::create_dir_all(tmp.path().join("notes")).unwrap();

        let report = supervisor.scan_dir(tmp.path()).await;
        assert_eq!(report.loaded, vec!["calc"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].name, "notes");

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_install_failure_fails_only_that_project() {
        let port = port_of(&testing::closed_port_url().await);
        let mut config = test_config(port).await;
        config.install_command = vec!["false".into()];
        let supervisor = Supervisor::new(config, EventBus::new()).unwrap();
        let tmp = TempDir::new().unwrap();
        write_project(tmp.path(), "calc", json!({"command": "sleep", "args": ["30"]}));

        let report = supervisor.scan_dir(tmp.path()).await;
        assert!(report.loaded.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert!(supervisor.get("calc").await.is_none());
    }

    #[tokio::test]
    async fn test_source_change_triggers_restart() {
        let port = port_of(&testing::closed_port_url().await);
        let supervisor = Supervisor::new(test_config(port).await, EventBus::new()).unwrap();
        let tmp = TempDir::new().unwrap();
        let dir = write_project(tmp.path(), "calc", json!({"command": "sleep", "args": ["30"]}));

        supervisor
            .load("calc", dir.clone(), sleeper())
            .await
            .unwrap();
        let before = supervisor.get("calc").await.unwrap().pid;

        fs::write(dir.join("index.js"), "// edited").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let mut after = before;
        while (after.is_none() || after == before) && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
            after = supervisor.get("calc").await.and_then(|r| r.pid);
        }
        assert!(after.is_some());
        assert_ne!(after, before);

        supervisor.shutdown().await;
    }
}
