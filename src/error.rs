//! Error types for the Viaduct operator

use thiserror::Error;

/// Main error type for Viaduct operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Cron schedule parsing or evaluation error
    #[error("schedule error: {0}")]
    Schedule(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A required object field (name, namespace, uid) is missing
    #[error("missing object key: {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a schedule error with the given message
    pub fn schedule(msg: impl Into<String>) -> Self {
        Self::Schedule(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether the error policy should retry with backoff.
    ///
    /// Kubernetes API errors (conflicts, network) may recover on their own;
    /// everything else requires a spec change to fix and retrying would only
    /// produce log noise until one arrives.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Kube(_))
    }
}
