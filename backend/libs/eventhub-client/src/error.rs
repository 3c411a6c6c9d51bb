//! Error types for the event hub client

use thiserror::Error;

/// Result type for event hub operations
pub type EventHubResult<T> = Result<T, EventHubError>;

/// Errors that can occur while publishing, subscribing to, or processing events
#[derive(Error, Debug)]
pub enum EventHubError {
    /// Database operation failed (connection, query execution, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Required environment variable missing or a config value could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// A Programmatic/Managed subscription was registered without a resolvable callback
    #[error("No callback available for subscription {subscriber}/{publisher}.{event_type}")]
    MissingCallback {
        subscriber: String,
        publisher: String,
        event_type: String,
    },

    /// A Managed subscription referenced a processing module that isn't registered
    #[error("Processing module '{0}' is not registered")]
    ProcessingModule(String),

    /// JSON (de)serialization of an event payload or processing result failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context, used to surface a callback's own error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl EventHubError {
    /// True for errors the caller should treat as transient and safe to retry
    pub fn is_transient(&self) -> bool {
        match self {
            EventHubError::Database(sqlx_err) => !matches!(
                sqlx_err,
                sqlx::Error::ColumnNotFound(_) | sqlx::Error::TypeNotFound { .. }
            ),
            _ => false,
        }
    }
}
