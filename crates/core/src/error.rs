//! Batching error model.

use thiserror::Error;

/// Result type used across the batching layer.
pub type BatchResult<T> = Result<T, BatchError>;

/// Producer-facing error.
///
/// These are raised synchronously to whoever called the runner. A callback
/// reporting failure for a batch is not an error value: the worker records it
/// as a [`crate::FlushOutcome::Failed`] and persists the batch instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// The shared configuration could not be attached, locked, or serialized.
    #[error("configuration storage error: {0}")]
    ConfigurationStorage(String),

    /// A job could not be registered (bad identifier, bad options, or a
    /// function that cannot be reconstructed in another process).
    #[error("registration error: {0}")]
    Registration(String),

    /// An item was submitted for an identifier that was never registered.
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// An item could not be enqueued, not even through the file fallback.
    #[error("delivery error: {0}")]
    Delivery(String),
}

impl BatchError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::ConfigurationStorage(msg.into())
    }

    pub fn registration(msg: impl Into<String>) -> Self {
        Self::Registration(msg.into())
    }

    pub fn unknown_job(identifier: impl Into<String>) -> Self {
        Self::UnknownJob(identifier.into())
    }

    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery(msg.into())
    }
}
