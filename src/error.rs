//! Error types shared across the synchronization engine
//!
//! `FetchError` is cloneable because a single failed fetch is handed to every
//! caller that joined it through in-flight deduplication.

use thiserror::Error;

/// Errors that can occur while fetching a remote resource
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Timeout, refused connection or server-side failure
    #[error("Network error: {0}")]
    Transient(String),

    /// The endpoint answered with something that could not be decoded
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The wallet identity passed to a user-scoped fetch is not usable
    #[error("Invalid wallet identity: {0}")]
    IdentityInvalid(String),

    /// Every configured endpoint failed its last probe
    #[error("All endpoints are unreachable")]
    NoHealthyEndpoint,

    /// The session was stopped before the fetch could complete
    #[error("Fetch cancelled because the session stopped")]
    Cancelled,
}

impl FetchError {
    /// Whether another attempt may succeed
    ///
    /// Malformed responses are only retried after a failover picks a
    /// different endpoint; the coordinator enforces that part.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::MalformedResponse(_))
    }

    /// Whether the failure should count against the endpoint that served it
    pub fn affects_endpoint(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::MalformedResponse(_))
    }

    /// Whether the failure implies every following fetch will fail too
    pub fn is_connection_wide(&self) -> bool {
        matches!(self, Self::NoHealthyEndpoint)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::MalformedResponse(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_client_error() => {
                Self::MalformedResponse(format!("endpoint rejected request: {}", status))
            }
            _ => Self::Transient(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedResponse(err.to_string())
    }
}

/// Errors that can occur when loading or saving configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing the config file failed
    #[error("Config file error: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid JSON for `EngineConfig`
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is present but unusable
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_and_malformed_are_retryable() {
        assert!(FetchError::Transient("timeout".to_string()).is_retryable());
        assert!(FetchError::MalformedResponse("bad json".to_string()).is_retryable());
        assert!(!FetchError::IdentityInvalid("xyz".to_string()).is_retryable());
        assert!(!FetchError::NoHealthyEndpoint.is_retryable());
        assert!(!FetchError::Cancelled.is_retryable());
    }

    #[test]
    fn test_identity_errors_do_not_affect_endpoints() {
        assert!(!FetchError::IdentityInvalid("xyz".to_string()).affects_endpoint());
        assert!(FetchError::Transient("refused".to_string()).affects_endpoint());
    }

    #[test]
    fn test_only_exhausted_endpoints_are_connection_wide() {
        assert!(FetchError::NoHealthyEndpoint.is_connection_wide());
        assert!(!FetchError::Transient("503".to_string()).is_connection_wide());
    }

    #[test]
    fn test_json_error_is_malformed() {
        let err = serde_json::from_str::<u64>("not a number").unwrap_err();
        assert!(matches!(
            FetchError::from(err),
            FetchError::MalformedResponse(_)
        ));
    }
}
