//! Supervisor data types.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Entry file used when `package.json` has no `main`.
pub const DEFAULT_ENTRY: &str = "index.js";

/// Lifecycle status of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Spawned, health not yet established.
    Starting,
    /// Passed its health probe.
    Running,
    /// Failed to spawn or failed its health probe.
    Error,
    /// The process exited.
    Stopped,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Error => "error",
            ProcessStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// The `mcpServer` block of a project's `package.json`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerManifest {
    #[serde(default)]
    pub description: Option<String>,
    /// Declared capabilities forwarded to the gateway on registration.
    #[serde(default)]
    pub capabilities: Option<Value>,
    /// Program to run instead of `node`.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    /// Extra environment for the process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Entry file, taken from `package.json` `main`.
    #[serde(skip)]
    pub entry: Option<String>,
}

impl ServerManifest {
    /// Program and arguments that launch the service.
    pub fn command_line(&self) -> (String, Vec<String>) {
        let program = self.command.clone().unwrap_or_else(|| "node".to_string());
        let args = self.args.clone().unwrap_or_else(|| {
            vec![self
                .entry
                .clone()
                .unwrap_or_else(|| DEFAULT_ENTRY.to_string())]
        });
        (program, args)
    }
}

/// State of one supervised service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub name: String,
    pub project_path: PathBuf,
    /// Fixed for the lifetime of the record, kept across restarts.
    pub port: u16,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub last_started: DateTime<Utc>,
    /// Oldest first, bounded.
    pub errors: VecDeque<ErrorEntry>,
    #[serde(skip)]
    pub manifest: ServerManifest,
    /// Distinguishes successive processes of the same record.
    #[serde(skip)]
    pub(crate) generation: u64,
}

impl ProcessRecord {
    pub(crate) fn new(
        name: &str,
        project_path: PathBuf,
        port: u16,
        manifest: ServerManifest,
        generation: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            project_path,
            port,
            pid: None,
            status: ProcessStatus::Starting,
            last_started: Utc::now(),
            errors: VecDeque::new(),
            manifest,
            generation,
        }
    }

    /// Append an error entry, dropping the oldest beyond `max`.
    pub fn push_error(&mut self, message: impl Into<String>, max: usize) {
        self.errors.push_back(ErrorEntry {
            timestamp: Utc::now(),
            message: message.into(),
        });
        while self.errors.len() > max.max(1) {
            self.errors.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_line_uses_node_and_entry() {
        let manifest = ServerManifest::default();
        assert_eq!(
            manifest.command_line(),
            ("node".to_string(), vec!["index.js".to_string()])
        );

        let manifest = ServerManifest {
            entry: Some("server.js".into()),
            ..ServerManifest::default()
        };
        assert_eq!(manifest.command_line().1, vec!["server.js"]);
    }

    #[test]
    fn test_command_override() {
        let manifest: ServerManifest = serde_json::from_value(serde_json::json!({
            "command": "deno",
            "args": ["run", "main.ts"],
            "env": {"LOG_LEVEL": "debug"}
        }))
        .unwrap();
        let (program, args) = manifest.command_line();
        assert_eq!(program, "deno");
        assert_eq!(args, vec!["run", "main.ts"]);
        assert_eq!(manifest.env["LOG_LEVEL"], "debug");
    }

    #[test]
    fn test_error_history_is_bounded() {
        let mut record =
            ProcessRecord::new("calc", PathBuf::from("/tmp/calc"), 3100, ServerManifest::default(), 1);
        for i in 0..5 {
            record.push_error(format!("line {i}"), 3);
        }
        let messages: Vec<_> = record.errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_record_serialization() {
        let record =
            ProcessRecord::new("calc", PathBuf::from("/tmp/calc"), 3100, ServerManifest::default(), 1);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "starting");
        assert_eq!(json["port"], 3100);
        assert!(json["pid"].is_null());
        assert!(json.get("lastStarted").is_some());
        assert!(json.get("manifest").is_none());
        assert!(json.get("generation").is_none());
    }
}
