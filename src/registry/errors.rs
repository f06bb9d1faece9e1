use thiserror::Error;

use crate::health::ProbeError;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A dynamic registration was rejected because the service is not healthy.
    #[error("service '{service}' failed its health check: {source}")]
    HealthCheckFailed {
        service: String,
        #[source]
        source: ProbeError,
    },

    /// A discovery endpoint could not be polled.
    #[error("discovery endpoint '{endpoint}' failed: {reason}")]
    Endpoint { endpoint: String, reason: String },

    /// The outbound HTTP client could not be constructed.
    #[error("failed to build HTTP client: {reason}")]
    Client { reason: String },
}
