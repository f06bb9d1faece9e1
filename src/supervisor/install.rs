//! Dependency installation for supervised projects.

use std::path::Path;

use tokio::process::Command;

use super::errors::SupervisorError;

/// Longest stderr excerpt kept in an install error.
const MAX_STDERR_CHARS: usize = 2000;

/// Platform-correct npm command.
///
/// Windows requires `npm.cmd` because `npm` is a batch script.
fn resolve_program(program: &str) -> &str {
    if cfg!(target_os = "windows") && program == "npm" {
        "npm.cmd"
    } else {
        program
    }
}

/// Run the install command inside `project_dir`.
///
/// An empty command disables installation. A non-zero exit is an error
/// carrying the command's stderr.
pub async fn install_dependencies(
    service: &str,
    project_dir: &Path,
    command: &[String],
) -> Result<(), SupervisorError> {
    let Some((program, args)) = command.split_first() else {
        tracing::debug!(service, "dependency install disabled");
        return Ok(());
    };

    tracing::info!(
        service,
        command = %command.join(" "),
        dir = %project_dir.display(),
        "installing dependencies"
    );

    let output = Command::new(resolve_program(program))
        .args(args)
        .current_dir(project_dir)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| SupervisorError::DependencyInstall {
            service: service.to_string(),
            reason: format!("failed to run {program}: {e}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let excerpt: String = stderr.trim().chars().take(MAX_STDERR_CHARS).collect();
        return Err(SupervisorError::DependencyInstall {
            service: service.to_string(),
            reason: format!("{} exited with {}: {excerpt}", command.join(" "), output.status),
        });
    }

    tracing::info!(service, "dependencies installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_empty_command_is_noop() {
        let tmp = TempDir::new().unwrap();
        install_dependencies("calc", tmp.path(), &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_program_is_install_error() {
        let tmp = TempDir::new().unwrap();
        let err = install_dependencies(
            "calc",
            tmp.path(),
            &["definitely-not-a-real-installer-xyz".to_string()],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SupervisorError::DependencyInstall { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_reports_stderr() {
        let tmp = TempDir::new().unwrap();
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo broken lockfile >&2; exit 3".to_string(),
        ];
        let err = install_dependencies("calc", tmp.path(), &command)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken lockfile"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_command_runs_in_project_dir() {
        let tmp = TempDir::new().unwrap();
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "touch installed.marker".to_string(),
        ];
        install_dependencies("calc", tmp.path(), &command)
            .await
            .unwrap();
        assert!(tmp.path().join("installed.marker").exists());
    }
}
