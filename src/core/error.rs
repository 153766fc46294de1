use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Lease for '{0}' is held by a live owner")]
    LeaseHeld(String),

    #[error("Session '{0}' not found")]
    SessionNotFound(String),

    #[error("Session '{0}' is already open")]
    SessionExists(String),

    #[error("Version conflict on '{key}': stored {stored}, attempted {attempted}")]
    VersionConflict {
        key: String,
        stored: i64,
        attempted: i64,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid key path: {0}")]
    InvalidPath(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
