//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Source error: {0}")]
    Source(#[from] crate::source::SourceError),

    #[error("Task registry error: {0}")]
    Registry(#[from] crate::tasks::RegistryError),

    #[error("Queue error: {0}")]
    Queue(#[from] frame_queue::QueueError),

    #[error("Segment storage error: {0}")]
    Storage(#[from] crate::recorder::StorageError),

    #[error("Session already active for client {client_id}")]
    SessionAlreadyActive { client_id: String },

    #[error("No active session for client {client_id}")]
    SessionNotFound { client_id: String },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            from: from.into(),
            to: to.into(),
        }
    }
}
