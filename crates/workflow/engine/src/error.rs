//! Error types for the reconciliation engine

use workflow_sync::SyncError;
use workflow_types::WorkflowError;

/// Errors raised while operating on a workflow
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Maximum recursion depth exceeded")]
    MaxDepthExceeded,

    #[error("unable to resolve references: {0}")]
    UnresolvedReference(String),

    #[error("Invalid expression '{expression}': {reason}")]
    Expression { expression: String, reason: String },

    #[error("Offload error: {0}")]
    Offload(String),

    #[error("Task backend error: {0}")]
    Backend(String),

    /// Temporary backend trouble; the pass should be retried later
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether retrying the same pass later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Sync(SyncError::Backend { .. }) => true,
            _ => false,
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
