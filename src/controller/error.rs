//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.

use std::time::Duration;
use thiserror::Error;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Validation error in resource spec or component topology
    #[error("Validation error: {0}")]
    Validation(String),

    /// Dependency install error, surfaced for standard retry/backoff
    #[error("Dependency install error: {0}")]
    Install(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Install(_) => true,
            Error::Validation(_) | Error::MissingField(_) => false,
            Error::Serialization(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(30)
        } else {
            // Don't requeue aggressively for non-retryable errors
            Duration::from_secs(3600)
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::Install("chart failed".to_string()).is_retryable());
        assert!(!Error::Validation("bad spec".to_string()).is_retryable());
        assert!(!Error::MissingField("uid".to_string()).is_retryable());
    }

    #[test]
    fn test_requeue_after() {
        assert_eq!(
            Error::Install("x".to_string()).requeue_after(),
            Duration::from_secs(30)
        );
        assert_eq!(
            Error::Validation("x".to_string()).requeue_after(),
            Duration::from_secs(3600)
        );
    }
}
