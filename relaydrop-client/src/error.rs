//! Client error types

use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use relaydrop_common::chunk::ChunkError;
use relaydrop_common::validators::{FileNameError, TransferCodeError};

use crate::racer::RaceError;

/// Errors raised by the send/receive drivers
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid transfer code: {0:?}")]
    InvalidCode(TransferCodeError),

    #[error("invalid file name: {0:?}")]
    InvalidFileName(FileNameError),

    #[error(transparent)]
    Race(#[from] RaceError),

    /// Rejection carried by a relay `error` message
    #[error("relay rejected the request: {0}")]
    Rejected(String),

    #[error("unexpected {0} message from relay")]
    UnexpectedMessage(&'static str),

    #[error("malformed message from relay: {0}")]
    Malformed(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("transfer failed: {0}")]
    Failed(String),

    #[error("connection closed unexpectedly")]
    TransportClosedUnexpectedly,

    #[error("output file already exists: {0}")]
    OutputExists(String),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<TransferCodeError> for TransferError {
    fn from(e: TransferCodeError) -> Self {
        Self::InvalidCode(e)
    }
}

impl From<FileNameError> for TransferError {
    fn from(e: FileNameError) -> Self {
        Self::InvalidFileName(e)
    }
}

/// Discovery failures; never fatal, only logged
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery unavailable: {0}")]
    DiscoveryUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(TransferError::Cancelled.to_string(), "transfer cancelled");
        assert_eq!(
            TransferError::Rejected("CodeAlreadyInUse: 123456".to_string()).to_string(),
            "relay rejected the request: CodeAlreadyInUse: 123456"
        );
        assert_eq!(
            TransferError::Timeout("peerConnected").to_string(),
            "timed out waiting for peerConnected"
        );
    }

    #[test]
    fn test_validator_errors_convert() {
        let err: TransferError = FileNameError::ContainsPathSeparator.into();
        assert!(matches!(
            err,
            TransferError::InvalidFileName(FileNameError::ContainsPathSeparator)
        ));
    }
}
