//! Errors returned by the pipeline.
use std::sync::Arc;

use thiserror::Error;

use crate::exporter::ExportError;

/// Result type used throughout the pipeline.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the event log, delivery tasks, and the pipeline manager.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An operation referenced a consumer that was never registered.
    #[error("consumer with name {0} not found")]
    UnknownConsumer(String),

    /// An acknowledge tried to move a consumer outside of the valid offset range.
    #[error("invalid offset: offset {offset} is outside of the log range (last offset {last_offset})")]
    InvalidOffset { offset: i64, last_offset: i64 },

    /// A consumer with the same name is already registered.
    #[error("consumer with name {0} is already registered")]
    DuplicateConsumer(String),

    /// Consumers can only be registered before the event log is started.
    #[error("cannot register consumer {0}: the event log has already been started")]
    RegistrationClosed(String),

    /// A background loop was started twice.
    #[error("already started")]
    AlreadyStarted,

    /// The pipeline has been closed.
    #[error("pipeline is closed")]
    Closed,

    /// A destination failed to receive a batch. Logged by delivery tasks, never retried.
    #[error("error while exporting data: {0}")]
    ExportFailure(Arc<ExportError>),

    /// A delivery thread panicked. This should normally never happen.
    #[error("delivery thread panicked")]
    DeliveryThreadPanicked,

    /// The compaction thread panicked. This should normally never happen.
    #[error("compaction thread panicked")]
    CompactionThreadPanicked,

    /// Invalid event template.
    #[error("invalid template: {0}")]
    Template(String),

    /// Event could not be serialized.
    #[error(transparent)]
    Serialization(Arc<serde_json::Error>),

    /// An I/O error, typically failing to spawn a background thread.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(value))
    }
}

impl From<ExportError> for Error {
    fn from(value: ExportError) -> Self {
        Self::ExportFailure(Arc::new(value))
    }
}
