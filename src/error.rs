//! Error types for Cogniflux

use thiserror::Error;

/// Errors surfaced to callers of the telemetry engine.
///
/// None of these are fatal to the host: validation failures reject a single
/// record, lifecycle failures are recoverable by the caller, and persistence
/// failures are retried in the background before degrading to local storage.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Invalid event: {0}")]
    Validation(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already closed: {0}")]
    SessionClosed(String),

    #[error("Active session {session_id} already exists for user {user_id} on activity {activity_id}")]
    DuplicateActiveSession {
        user_id: String,
        activity_id: String,
        session_id: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl TelemetryError {
    /// Whether this error belongs to the session lifecycle family
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            TelemetryError::SessionNotFound(_)
                | TelemetryError::SessionClosed(_)
                | TelemetryError::DuplicateActiveSession { .. }
        )
    }

    /// Whether this error rejected a malformed record
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TelemetryError::Validation(_) | TelemetryError::MissingField(_)
        )
    }
}

/// Errors reported by a persistence gateway
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage rejected record: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PersistenceError {
    /// Transient failures are retried with backoff; the rest go straight to the fallback.
    pub fn is_transient(&self) -> bool {
        matches!(self, PersistenceError::Unavailable(_) | PersistenceError::Io(_))
    }
}
