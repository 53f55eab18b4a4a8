use thiserror::Error;

/// Result alias used across the crate
pub type HelmResult<T> = std::result::Result<T, HelmError>;

/// Error kinds surfaced by every subsystem
#[derive(Debug, Error)]
pub enum HelmError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("corrupt state: {0}")]
    CorruptState(String),
    #[error("exhausted: {0}")]
    Exhausted(String),
    #[error("policy protocol error: {0}")]
    PolicyProtocol(String),
    #[error("cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HelmError {
    /// Transient failures are worth a single retry at the call site.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HelmError::BackendUnavailable(_) | HelmError::Timeout(_)
        )
    }

    /// Process exit code for CLI entry points.
    pub fn exit_code(&self) -> i32 {
        match self {
            HelmError::BackendUnavailable(_) | HelmError::Timeout(_) => 75,
            _ => 70,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        HelmError::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        HelmError::Conflict(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        HelmError::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        HelmError::Internal(msg.into())
    }
}
