pub mod config;
pub mod events;
pub mod gateway;
pub mod health;
pub mod registry;
pub mod supervisor;

#[cfg(test)]
mod testing;

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "mcp_gateway=info,tower_http=info,warn";

/// Rotated log files kept next to the current one.
const KEPT_LOG_FILES: u32 = 3;

/// Initialize the tracing subscriber for a binary.
///
/// Console output goes to stderr, as JSON when `LOG_FORMAT=json`. When
/// `LOG_DIR` is set, logs are also written to `<LOG_DIR>/<component>.log`,
/// which is rotated on every startup (`.log` → `.log.1` → … keeps the last 3)
/// and flushed after every line.
///
/// Returns the log file path, if any.
pub fn init_tracing(component: &str) -> anyhow::Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if json {
        layers.push(fmt::layer().json().with_writer(std::io::stderr).boxed());
    } else {
        layers.push(fmt::layer().with_writer(std::io::stderr).boxed());
    }

    let log_path = match std::env::var_os("LOG_DIR").filter(|d| !d.is_empty()) {
        Some(dir) => {
            let dir = PathBuf::from(dir);
            let (path, writer) = open_log_file(&dir, component)?;
            layers.push(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .boxed(),
            );
            Some(path)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("failed to install tracing subscriber")?;

    // Startup banner, makes it easy to find the right log file
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        component,
        log_file = ?log_path,
        pid = std::process::id(),
        "=== {component} starting ==="
    );

    Ok(log_path)
}

fn open_log_file(dir: &Path, component: &str) -> anyhow::Result<(PathBuf, FlushingWriter)> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let path = dir.join(format!("{component}.log"));
    rotate_log_file(&path, KEPT_LOG_FILES);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    Ok((path, FlushingWriter::new(file)))
}

/// Rotate log files: `{base}.{keep-1}` → `{base}.{keep}`, …, `{base}` → `{base}.1`.
///
/// The oldest file (`{base}.{keep}`) is deleted.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Keeps each log line on disk immediately, so the tail of the log survives
/// a crash or a container kill.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_rotate_keeps_last_three() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("gateway.log");

        for generation in 0..5 {
            rotate_log_file(&base, 3);
            std::fs::write(&base, format!("run {generation}")).unwrap();
        }

        let read = |suffix: &str| {
            std::fs::read_to_string(format!("{}{suffix}", base.display())).unwrap()
        };
        assert_eq!(read(""), "run 4");
        assert_eq!(read(".1"), "run 3");
        assert_eq!(read(".2"), "run 2");
        assert_eq!(read(".3"), "run 1");
        assert!(!tmp.path().join("gateway.log.4").exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let tmp = TempDir::new().unwrap();
        let (path, mut writer) = open_log_file(tmp.path(), "supervisor").unwrap();
        writer.write_all(b"hello\n").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hello\n");
    }
}
