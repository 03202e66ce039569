use thiserror::Error;

/// Errors surfaced by cloud adapter calls.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CloudError {
    /// The call may succeed if retried.
    #[error("transient cloud error: {0}")]
    Transient(String),

    /// The referenced cloud object does not exist. Treated as success when
    /// the caller was deleting it.
    #[error("{0} not found")]
    NotFound(String),

    /// The request is malformed or references an unknown provider; retrying
    /// cannot help.
    #[error("validation error: {0}")]
    Validation(String),
}

impl CloudError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
