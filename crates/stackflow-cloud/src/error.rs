//! Connector error types

use thiserror::Error;

/// Errors raised by cloud connectors and the components around them.
///
/// The variants follow the error taxonomy the connectors branch on:
/// transient errors are retried, not-found is an expected outcome the
/// callers treat as "already gone", rejected/unsupported fail fast.
#[derive(Error, Debug)]
pub enum CloudError {
    /// The provider no longer reports the entity. Expected during
    /// out-of-band deletion; callers drop the entity from the working set.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transport or rate-limit level failure. Safe to retry.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The request itself is invalid (bad resource type, malformed input).
    /// Never retried.
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Generic connector failure carrying the stack and operation for
    /// diagnosis. Fatal to the current call.
    #[error("connector failure in stack '{stack}' during {operation}: {message}")]
    Connector {
        stack: String,
        operation: String,
        message: String,
    },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    /// Classification predicate used by the retry wrapper: only transient
    /// (transport-level) failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CloudError::Transient(_))
    }

    /// Wrap an unexpected provider failure with stack and operation context.
    pub fn connector(
        stack: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CloudError::Connector {
            stack: stack.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
