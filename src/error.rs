//! Controller error types

use std::time::Duration;

use thiserror::Error;

use crate::validation::ValidationErrors;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{0}")]
    Validation(#[from] ValidationErrors),

    #[error("ConfigMap rejected: {0}")]
    ConfigMapRejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("proxy reload failed: {0}")]
    ReloadFailed(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Permanent(String),
}

impl Error {
    /// Create a permanent error with the given message
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Category label used for metrics and log fields
    pub fn category(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube_api",
            Error::Validation(_) => "validation",
            Error::ConfigMapRejected(_) => "config",
            Error::Io(_) => "io",
            Error::ReloadFailed(_) => "reload",
            Error::Json(_) => "serialization",
            Error::Permanent(_) => "permanent",
        }
    }

    /// Permanent errors are not requeued; the operator must submit a
    /// corrected resource to trigger the next reconciliation.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::ConfigMapRejected(_)
                | Error::ReloadFailed(_)
                | Error::Permanent(_)
        )
    }

    /// Requeue delay for recoverable errors
    pub fn retry_delay(&self) -> Duration {
        match self {
            Error::Kube(_) => Duration::from_secs(10),
            Error::Io(_) | Error::Json(_) => Duration::from_secs(30),
            _ => Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(Error::permanent("no name").category(), "permanent");
        assert_eq!(
            Error::ReloadFailed("config test failed".to_string()).category(),
            "reload"
        );
        assert_eq!(
            Error::ConfigMapRejected("bad keepalive".to_string()).category(),
            "config"
        );
    }

    #[test]
    fn test_permanence() {
        assert!(Error::ReloadFailed("boom".to_string()).is_permanent());
        assert!(Error::permanent("unnamed object").is_permanent());
        assert!(!Error::Io(std::io::Error::other("disk full")).is_permanent());
    }

    #[test]
    fn test_retry_delay_for_recoverable() {
        let err = Error::Io(std::io::Error::other("transient"));
        assert_eq!(err.retry_delay(), Duration::from_secs(30));
    }
}
