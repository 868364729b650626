//! Relay error types

use relaydrop_common::chunk::ChunkError;
use relaydrop_common::protocol::Role;
use relaydrop_common::validators::{FileNameError, TransferCodeError};
use strum::AsRefStr;
use thiserror::Error;

use crate::registry::SessionStatus;

/// Errors produced by the session registry
///
/// The variant name (via `AsRef<str>`) is used as the machine-readable prefix
/// of `error` messages sent to clients.
#[derive(Debug, Error, AsRefStr)]
pub enum RegistryError {
    #[error("transfer code {0} is already in use")]
    CodeAlreadyInUse(String),

    #[error("no session for transfer code {0}")]
    InvalidCode(String),

    #[error("session {code} is {actual}, expected {expected}")]
    InvalidState {
        code: String,
        actual: SessionStatus,
        expected: SessionStatus,
    },

    #[error("transport is closed")]
    TransportClosed,

    #[error("transport queue is full")]
    OutboxFull,

    #[error("failed to send chunk {index} for {code}: {reason}")]
    IoErrorDuringChunkSend {
        code: String,
        index: u32,
        reason: String,
    },

    #[error("{role} transport for {code} closed unexpectedly")]
    TransportClosedUnexpectedly { code: String, role: Role },

    #[error("invalid chunk frame: {0}")]
    MalformedChunk(#[from] ChunkError),

    #[error("failed to encode control message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RegistryError {
    /// Message for an `error` control frame: `"<Kind>: <description>"`
    pub fn wire_message(&self) -> String {
        format!("{}: {}", self.as_ref(), self)
    }
}

/// A client broke the relay protocol on its connection
///
/// Sent back as an `error` message; registration failures also close the
/// connection.
#[derive(Debug, Error, AsRefStr)]
pub enum ProtocolError {
    #[error("could not parse control message: {0}")]
    MalformedMessage(String),

    #[error("{0} is not valid here")]
    UnexpectedMessage(&'static str),

    #[error("connection is already registered")]
    AlreadyRegistered,

    #[error("register does not match the transfer code and role of the connection")]
    RegistrationMismatch,

    #[error("invalid transfer code: {0:?}")]
    InvalidTransferCode(TransferCodeError),

    #[error("invalid file name: {0:?}")]
    InvalidFileName(FileNameError),

    #[error("sender must announce the file size")]
    MissingFileSize,

    #[error("no register message within {0} seconds")]
    RegisterTimeout(u64),
}

impl ProtocolError {
    pub fn wire_message(&self) -> String {
        format!("{}: {}", self.as_ref(), self)
    }
}
