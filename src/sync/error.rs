//! Sync channel error types.

use thiserror::Error;

/// Errors from the backend sync channel.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The backend URL or handshake request is unusable.
    #[error("Invalid backend request: {0}")]
    InvalidRequest(String),

    /// The token cannot be sent as a header value.
    #[error("User token contains characters not allowed in a header")]
    InvalidToken,

    /// No open connection; messages are not queued.
    #[error("Not connected to the backend")]
    NotConnected,

    /// Message could not be encoded.
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
