//! Error types for processors

use nucleus_core::{EngineError, EventError, SinkError};
use nucleus_storage::StorageError;
use thiserror::Error;

/// Errors that can occur in a processor
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Durable queue error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Rule engine error
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Malformed event
    #[error("Event error: {0}")]
    Event(#[from] EventError),

    /// Downstream sink error
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Processor not running
    #[error("Processor '{0}' is not running")]
    Stopped(String),

    /// A shard worker terminated abnormally
    #[error("Worker error: {0}")]
    Worker(String),
}

impl ProcessorError {
    /// Create a new Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Result type alias for processor operations
pub type ProcessorResult<T> = Result<T, ProcessorError>;
