use thiserror::Error;

/// Errors from supervising development services.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The project's `package.json` could not be read or parsed.
    #[error("invalid manifest in '{path}': {reason}")]
    InvalidManifest { path: String, reason: String },

    /// Installing the project's dependencies failed. Fatal to that project.
    #[error("dependency install failed for '{service}': {reason}")]
    DependencyInstall { service: String, reason: String },

    /// The service process could not be started.
    #[error("failed to spawn service '{service}': {reason}")]
    SpawnFailed { service: String, reason: String },

    /// No more local ports can be handed out.
    #[error("port range exhausted (next candidate {next})")]
    PortsExhausted { next: u32 },

    /// The project directory could not be watched.
    #[error("failed to watch '{path}': {reason}")]
    Watch { path: String, reason: String },

    #[error("failed to build HTTP client: {reason}")]
    Client { reason: String },
}
