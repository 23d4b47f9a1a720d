//! Error types for the synchronization layer

/// Why a lock capacity could not be resolved
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    /// The named config or key does not exist; retrying will not help
    #[error("{0}")]
    NotFound(String),

    /// Backend trouble (throttling, network); worth retrying
    #[error("{0}")]
    Transient(String),

    /// The configured value is not a usable capacity
    #[error("invalid lock capacity: {0}")]
    Invalid(String),
}

impl ResolveError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Synchronization errors
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Invalid lock name: {0}")]
    InvalidLockName(String),

    /// Requires a config fix; not retried automatically
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Failed to resolve lock capacity for {lock}: {reason}")]
    Backend { lock: String, reason: String },
}

impl From<(String, ResolveError)> for SyncError {
    fn from((lock, err): (String, ResolveError)) -> Self {
        match err {
            ResolveError::NotFound(msg) | ResolveError::Invalid(msg) => SyncError::BadRequest(msg),
            ResolveError::Transient(reason) => SyncError::Backend { lock, reason },
        }
    }
}

/// Result type for synchronization operations
pub type SyncResult<T> = Result<T, SyncError>;
