//! Error types for the workflow controller

use thiserror::Error;
use workflow_engine::EngineError;
use workflow_sync::SyncError;

/// Controller-level errors
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Object store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Reconciliation engine error
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Lock manager error
    #[error("Synchronization error: {0}")]
    Sync(#[from] SyncError),

    /// Garbage collection error
    #[error("Garbage collection error: {0}")]
    Gc(String),

    /// Archiving error
    #[error("Archive error: {0}")]
    Archive(String),

    /// Metrics registration or export error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Errors raised by the object, archive and offload backends
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Object not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write raced with another writer
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Backend temporarily unavailable
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be interpreted
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl StoreError {
    /// Whether retrying later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for controller operations
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
