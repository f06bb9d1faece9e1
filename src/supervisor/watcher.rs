//! Source watching for supervised projects.
//!
//! Watches a project directory recursively and reports batches of changed
//! source files. Bursts of events (an editor writing several files, a
//! `git checkout`) are coalesced into one batch.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::errors::SupervisorError;

/// Quiet period after the first event before a batch is reported.
const DEBOUNCE: Duration = Duration::from_millis(150);

/// Directory segments whose contents never trigger a restart.
const SKIP_SEGMENTS: &[&str] = &["node_modules", ".git"];

/// File extensions treated as service source.
const SOURCE_EXTENSIONS: &[&str] = &["js", "mjs", "cjs", "ts", "json"];

/// Returns `true` if any component of the path is a skipped directory.
fn is_ignored(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(|s| SKIP_SEGMENTS.contains(&s))
            .unwrap_or(false)
    })
}

fn is_watched_source(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SOURCE_EXTENSIONS.contains(&e))
        .unwrap_or(false)
}

/// Paths of `event` that should trigger a restart.
fn relevant_paths(event: &Event) -> Vec<PathBuf> {
    let relevant_kind = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    );
    if !relevant_kind {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|p| !is_ignored(p) && is_watched_source(p))
        .cloned()
        .collect()
}

/// A live watch on one project. Dropping it stops the watch.
pub struct ServiceWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ServiceWatcher {
    /// Stop watching. Pending changes are discarded.
    pub fn close(self) {
        self.task.abort();
    }
}

impl Drop for ServiceWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start watching `path` for the service `name`.
///
/// `on_change` receives each coalesced batch of changed source files, sorted
/// and deduplicated. Must be called from within a tokio runtime.
pub fn watch_project<F>(
    name: &str,
    path: &Path,
    on_change: F,
) -> Result<ServiceWatcher, SupervisorError>
where
    F: Fn(Vec<PathBuf>) + Send + 'static,
{
    let watch_error = |reason: String| SupervisorError::Watch {
        path: path.display().to_string(),
        reason,
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();

    let service = name.to_string();
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        match res {
            Ok(event) => {
                let paths = relevant_paths(&event);
                if !paths.is_empty() {
                    let _ = tx.send(paths);
                }
            }
            Err(e) => tracing::error!(service = %service, error = %e, "file watcher error"),
        }
    })
    .map_err(|e| watch_error(e.to_string()))?;

    watcher
        .watch(path, RecursiveMode::Recursive)
        .map_err(|e| watch_error(e.to_string()))?;

    let service = name.to_string();
    let task = tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut batch: BTreeSet<PathBuf> = first.into_iter().collect();

            tokio::time::sleep(DEBOUNCE).await;
            while let Ok(more) = rx.try_recv() {
                batch.extend(more);
            }

            tracing::debug!(service = %service, files = batch.len(), "source change detected");
            on_change(batch.into_iter().collect());
        }
    });

    tracing::info!(service = name, path = %path.display(), "watching project sources");
    Ok(ServiceWatcher {
        _watcher: watcher,
        task,
    })
}
