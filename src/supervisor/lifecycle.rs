//! Service process lifecycle: spawning, output capture, exit monitoring and
//! health polling.
//!
//! Each spawned process gets a monitor task that owns the `Child`. Stopping a
//! process goes through that task, which kills the child and reaps it, so a
//! caller that awaits [`ProcessHandle::terminate`] knows the old process is
//! gone before starting a new one on the same port.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::errors::SupervisorError;
use super::types::{ProcessRecord, ProcessStatus};
use crate::events::{EventBus, GatewayEvent};
use crate::health::{self, ProbeError};

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long to wait for a killed process to be reaped.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounds of a single health probe's timeout.
const MIN_PROBE_TIMEOUT: Duration = Duration::from_millis(250);
const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

// ─── Process table ───────────────────────────────────────────────────────────

/// A record and, while one is alive, its process.
pub(crate) struct ServiceEntry {
    pub record: ProcessRecord,
    pub process: Option<ProcessHandle>,
}

pub(crate) type ProcessTable = Arc<Mutex<HashMap<String, ServiceEntry>>>;

/// Handle to a spawned process, owned by the table entry.
pub(crate) struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Kill the process and wait until it has been reaped.
    ///
    /// Must not be called while holding the table lock: the monitor takes it
    /// to record the exit.
    pub async fn terminate(mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut self.monitor)
            .await
            .is_err()
        {
            tracing::warn!(pid = ?self.pid, "process did not exit in time, abandoning monitor");
            self.monitor.abort();
        }
    }
}

/// Everything a spawned process reports back into.
#[derive(Clone)]
pub(crate) struct LifecycleContext {
    pub table: ProcessTable,
    pub events: EventBus,
    pub max_error_entries: usize,
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn the process for `record`, wiring output capture and exit monitoring.
///
/// Call while holding the table lock and insert the returned handle before
/// releasing it, so the monitor cannot observe a missing entry.
pub(crate) fn spawn_process(
    ctx: &LifecycleContext,
    record: &ProcessRecord,
) -> Result<ProcessHandle, SupervisorError> {
    let name = record.name.as_str();
    let (program, args) = record.manifest.command_line();

    let mut cmd = Command::new(&program);
    cmd.args(&args);
    cmd.current_dir(&record.project_path);
    cmd.env("PORT", record.port.to_string());
    cmd.env("NODE_ENV", "development");
    for (key, value) in &record.manifest.env {
        cmd.env(key, value);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
        service: name.to_string(),
        reason: format!("{program}: {e}"),
    })?;

    let pid = child.id();
    tracing::info!(service = name, pid = ?pid, port = record.port, command = %program, "process spawned");

    if let Some(stdout) = child.stdout.take() {
        capture_stdout(name.to_string(), stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        capture_stderr(ctx.clone(), name.to_string(), record.generation, stderr);
    }

    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
    let monitor_ctx = ctx.clone();
    let service = name.to_string();
    let generation = record.generation;

    let monitor = tokio::spawn(async move {
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = &mut kill_rx => None,
        };

        let killed = exited.is_none();
        let status = match exited {
            Some(status) => status,
            None => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!(service = %service, error = %e, "kill failed, process likely gone");
                }
                child.wait().await
            }
        };

        let code = status.as_ref().ok().and_then(|s| s.code());
        record_exit(&monitor_ctx, &service, generation, code, killed).await;
    });

    Ok(ProcessHandle {
        pid,
        kill_tx: Some(kill_tx),
        monitor,
    })
}

fn capture_stdout(service: String, stdout: ChildStdout) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(service = %service, stream = "stdout", "{line}");
        }
    });
}

fn capture_stderr(ctx: LifecycleContext, service: String, generation: u64, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::warn!(service = %service, stream = "stderr", "{line}");
            let mut table = ctx.table.lock().await;
            if let Some(entry) = table.get_mut(&service) {
                if entry.record.generation == generation {
                    entry.record.push_error(line, ctx.max_error_entries);
                }
            }
        }
    });
}

async fn record_exit(
    ctx: &LifecycleContext,
    service: &str,
    generation: u64,
    code: Option<i32>,
    killed: bool,
) {
    {
        let mut table = ctx.table.lock().await;
        if let Some(entry) = table.get_mut(service) {
            if entry.record.generation == generation {
                entry.record.status = ProcessStatus::Stopped;
                entry.record.pid = None;
                entry.process = None;
                if !killed {
                    match code {
                        Some(0) => {}
                        Some(code) => entry.record.push_error(
                            format!("Process exited with code {code}"),
                            ctx.max_error_entries,
                        ),
                        None => entry.record.push_error(
                            "Process terminated by signal",
                            ctx.max_error_entries,
                        ),
                    }
                }
            }
        }
    }

    if killed {
        tracing::info!(service, "process stopped");
    } else {
        tracing::warn!(service, code = ?code, "process exited");
    }
    ctx.events.publish(GatewayEvent::ProcessExited {
        service: service.to_string(),
        code,
    });
}

// ─── Health ──────────────────────────────────────────────────────────────────

/// Poll `http://localhost:<port>/health` until it passes or `grace` elapses.
///
/// Probes at least once; the error of the last probe is returned on failure.
pub(crate) async fn wait_until_healthy(
    http: &reqwest::Client,
    port: u16,
    grace: Duration,
    poll_interval: Duration,
) -> Result<(), ProbeError> {
    let base_url = format!("http://localhost:{port}");
    let deadline = Instant::now() + grace;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let timeout = remaining.clamp(MIN_PROBE_TIMEOUT, MAX_PROBE_TIMEOUT);

        match health::probe(http, &base_url, timeout).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(e);
                }
                tracing::trace!(port, error = %e, "service not healthy yet");
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(poll_interval.min(remaining)).await;
    }
}
