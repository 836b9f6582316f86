/// Error types for the chat synchronization core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Invalid participant: {0}")]
    InvalidParticipant(String),

    #[error("Message text is empty")]
    EmptyMessage,

    #[error("User {user_id} is not a participant of room {room_id}")]
    NotAParticipant { room_id: String, user_id: String },

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Transient upstream error: {0}")]
    TransientUpstream(String),

    #[error("Permanent upstream error: {0}")]
    PermanentUpstream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(String),
}

impl SyncError {
    /// Whether a caller may retry the failed operation as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientUpstream(_) | SyncError::Io(_))
    }

    /// Validation errors are the caller's fault and never retried
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidParticipant(_)
                | SyncError::EmptyMessage
                | SyncError::NotAParticipant { .. }
        )
    }
}

/// Map a sled failure onto the upstream taxonomy: I/O hiccups are retryable,
/// anything else (corruption, unsupported, bugs) is not.
pub(crate) fn storage_error(context: &str, err: sled::Error) -> SyncError {
    match err {
        sled::Error::Io(e) => SyncError::TransientUpstream(format!("{}: {}", context, e)),
        other => SyncError::PermanentUpstream(format!("{}: {}", context, other)),
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
