//! Project discovery: scan the projects directory for service manifests.
//!
//! A project is a subdirectory whose `package.json` carries an `mcpServer`
//! block. The shared-code directory and hidden directories are never
//! projects.

use std::path::{Path, PathBuf};

use serde_json::Value;

use super::errors::SupervisorError;
use super::types::ServerManifest;

/// A directory that declares a service.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectCandidate {
    pub name: String,
    pub path: PathBuf,
    pub manifest: ServerManifest,
}

/// A directory that was looked at and passed over.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SkippedProject {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectScan {
    pub candidates: Vec<ProjectCandidate>,
    pub skipped: Vec<SkippedProject>,
}

/// Scan `projects_dir` for service projects, sorted by name.
///
/// Returns an empty scan if the directory doesn't exist.
pub fn scan_projects(projects_dir: &Path, shared_dir_name: &str) -> ProjectScan {
    let mut scan = ProjectScan::default();

    let entries = match std::fs::read_dir(projects_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(
                path = %projects_dir.display(),
                error = %e,
                "projects directory not readable, nothing to supervise"
            );
            return scan;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if name == shared_dir_name || name.starts_with('.') {
            continue;
        }

        match read_manifest(&path) {
            Ok(Some(manifest)) => scan.candidates.push(ProjectCandidate {
                name,
                path,
                manifest,
            }),
            Ok(None) => {
                tracing::warn!(project = %name, "no mcpServer declaration, skipping");
                scan.skipped.push(SkippedProject {
                    name,
                    reason: "no mcpServer declaration in package.json".into(),
                });
            }
            Err(e) => {
                tracing::warn!(project = %name, error = %e, "invalid project, skipping");
                scan.skipped.push(SkippedProject {
                    name,
                    reason: e.to_string(),
                });
            }
        }
    }

    scan.candidates.sort_by(|a, b| a.name.cmp(&b.name));
    scan.skipped.sort_by(|a, b| a.name.cmp(&b.name));
    scan
}

/// Read the service manifest of one project.
///
/// `Ok(None)` means the directory has no `package.json` or the package does
/// not declare itself a service.
pub fn read_manifest(project_dir: &Path) -> Result<Option<ServerManifest>, SupervisorError> {
    let package_json = project_dir.join("package.json");
    if !package_json.exists() {
        return Ok(None);
    }

    let invalid = |reason: String| SupervisorError::InvalidManifest {
        path: package_json.display().to_string(),
        reason,
    };

    let raw = std::fs::read_to_string(&package_json).map_err(|e| invalid(e.to_string()))?;
    let package: Value = serde_json::from_str(&raw).map_err(|e| invalid(e.to_string()))?;

    let mut manifest = match package.get("mcpServer") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => return Ok(None),
        Some(block @ Value::Object(_)) => serde_json::from_value::<ServerManifest>(block.clone())
            .map_err(|e| invalid(format!("mcpServer: {e}")))?,
        // `"mcpServer": true` and the like: a service with all defaults.
        Some(_) => ServerManifest::default(),
    };

    manifest.entry = package
        .get("main")
        .and_then(Value::as_str)
        .filter(|m| !m.trim().is_empty())
        .map(str::to_string);

    Ok(Some(manifest))
}
