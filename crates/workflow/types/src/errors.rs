//! Error types for the workflow data model

/// Errors raised while reading or interpreting workflow objects
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Invalid workflow key: {0}")]
    InvalidKey(String),

    #[error("Cannot unmarshal workflow: {0}")]
    Unmarshal(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Workflow validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for workflow model operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;
