//! `GET <base>/health` probing shared by the registry and the supervisor.

use std::time::Duration;

use thiserror::Error;

/// Why a health probe did not pass.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The service answered with a non-2xx status.
    #[error("Health check failed: {status}")]
    Status { status: u16 },

    /// The service did not answer within the probe timeout.
    #[error("Health check timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Connection refused, DNS failure, malformed URL, …
    #[error("Health check failed: {reason}")]
    Transport { reason: String },
}

/// Build the health URL for a service base URL.
pub fn health_url(base_url: &str) -> String {
    format!("{}/health", base_url.trim_end_matches('/'))
}

/// Probe `<base_url>/health` and return the status code on a 2xx answer.
pub async fn probe(
    http: &reqwest::Client,
    base_url: &str,
    timeout: Duration,
) -> Result<u16, ProbeError> {
    let response = http
        .get(health_url(base_url))
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }
            } else {
                ProbeError::Transport {
                    reason: e.to_string(),
                }
            }
        })?;

    let status = response.status();
    if status.is_success() {
        Ok(status.as_u16())
    } else {
        Err(ProbeError::Status {
            status: status.as_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_url_trims_trailing_slash() {
        assert_eq!(health_url("http://svc:3000/"), "http://svc:3000/health");
        assert_eq!(health_url("http://svc:3000"), "http://svc:3000/health");
    }

    #[tokio::test]
    async fn test_probe_unreachable_is_transport_error() {
        // Port 9 (discard) on localhost is not expected to speak HTTP.
        let http = reqwest::Client::new();
        let err = probe(&http, "http://127.0.0.1:9", Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProbeError::Transport { .. } | ProbeError::Timeout { .. }
        ));
    }
}
