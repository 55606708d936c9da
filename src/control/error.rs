//! Control channel error types.

use std::io;
use thiserror::Error;

/// Errors surfaced by control-channel calls.
///
/// This is a closed set. Everything except [`ControlError::FilterNotInstalled`]
/// is recovered by dropping the connection and establishing a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    /// No live connection to the filter.
    #[error("No connection to the filter")]
    ConnectionMissing,

    /// The transport to the filter failed.
    #[error("Filter connection failed: {0}")]
    RemoteProxyError(String),

    /// The filter answered with an error.
    #[error("Filter rejected the request: {0}")]
    ReplyError(String),

    /// No reply within the call budget.
    #[error("Timed out waiting for the filter")]
    Timeout,

    /// A request could not be encoded.
    #[error("Failed to encode request: {0}")]
    Encode(String),

    /// A reply could not be decoded.
    #[error("Failed to decode reply: {0}")]
    Decode(String),

    /// The filter is not installed (no control socket).
    #[error("Filter is not installed")]
    FilterNotInstalled,

    /// The health probe came back with a different nonce.
    #[error("Health probe returned nonce {received}, expected {expected}")]
    UnexpectedIncorrectAck {
        /// Nonce that was sent.
        expected: u64,
        /// Nonce that came back.
        received: u64,
    },
}

impl ControlError {
    /// Whether reconnecting can fix this.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ControlError::FilterNotInstalled)
    }

    /// Map a socket connect failure.
    pub(crate) fn from_connect(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => ControlError::FilterNotInstalled,
            io::ErrorKind::ConnectionRefused => ControlError::ConnectionMissing,
            _ => ControlError::RemoteProxyError(e.to_string()),
        }
    }
}

/// Result type for control channel operations.
pub type ControlResult<T> = Result<T, ControlError>;
