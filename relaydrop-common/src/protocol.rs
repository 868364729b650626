//! Protocol definitions for RelayDrop
//!
//! Control messages travel as JSON text frames over a WebSocket; chunk payloads
//! travel as binary frames (see [`crate::chunk`]). Every control message is an
//! internally tagged object (`{"type": "register", ...}`) with camelCase fields.
//!
//! The connection itself is parameterised by the `transferCode` and `role`
//! query parameters of the upgrade request, so a relay knows which session a
//! socket belongs to before any frame is exchanged.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::time::now_millis;

/// Query parameter carrying the transfer code on the upgrade request
pub const QUERY_TRANSFER_CODE: &str = "transferCode";

/// Query parameter carrying the role on the upgrade request
pub const QUERY_ROLE: &str = "role";

/// Which end of a transfer a connection represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    /// Wire representation (`"sender"` / `"receiver"`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sender => "sender",
            Self::Receiver => "receiver",
        }
    }

    /// The opposite end of the transfer
    pub fn peer(&self) -> Self {
        match self {
            Self::Sender => Self::Receiver,
            Self::Receiver => Self::Sender,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sender" => Ok(Self::Sender),
            "receiver" => Ok(Self::Receiver),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Control messages exchanged between clients and the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Client announces itself for a transfer code (sent by the race winner only)
    Register {
        transfer_code: String,
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        timestamp: i64,
    },
    /// Relay acknowledges a registration
    Connected {
        transfer_code: String,
        role: Role,
        timestamp: i64,
    },
    /// Both ends are attached; carries the other side's observed address
    PeerConnected {
        transfer_code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_address: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_size: Option<u64>,
        timestamp: i64,
    },
    /// Receiver is ready for chunks
    Ready { transfer_code: String, timestamp: i64 },
    /// Transfer progress in `[0.0, 1.0]`
    Progress {
        transfer_code: String,
        progress: f64,
        bytes_transferred: u64,
        total_bytes: u64,
        timestamp: i64,
    },
    /// The next binary frame is the final one
    FinalChunk {
        transfer_code: String,
        total_chunks: u32,
        timestamp: i64,
    },
    /// Terminal outcome of the session
    Complete {
        transfer_code: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        timestamp: i64,
    },
    /// Abort the transfer
    Cancel { transfer_code: String, timestamp: i64 },
    /// Request rejected by the relay
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transfer_code: Option<String>,
        error_message: String,
        timestamp: i64,
    },
}

impl ControlMessage {
    /// Build a `register` message for the given role
    pub fn register(transfer_code: &str, role: Role) -> Self {
        Self::Register {
            transfer_code: transfer_code.to_string(),
            role,
            file_name: None,
            file_size: None,
            device_id: None,
            username: None,
            session_id: None,
            timestamp: now_millis(),
        }
    }

    /// Build a sender `register` message announcing the file
    pub fn register_sender(transfer_code: &str, file_name: Option<String>, file_size: u64) -> Self {
        Self::Register {
            transfer_code: transfer_code.to_string(),
            role: Role::Sender,
            file_name,
            file_size: Some(file_size),
            device_id: None,
            username: None,
            session_id: None,
            timestamp: now_millis(),
        }
    }

    pub fn connected(transfer_code: &str, role: Role) -> Self {
        Self::Connected {
            transfer_code: transfer_code.to_string(),
            role,
            timestamp: now_millis(),
        }
    }

    pub fn ready(transfer_code: &str) -> Self {
        Self::Ready {
            transfer_code: transfer_code.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn progress(transfer_code: &str, progress: f64, bytes: u64, total: u64) -> Self {
        Self::Progress {
            transfer_code: transfer_code.to_string(),
            progress,
            bytes_transferred: bytes,
            total_bytes: total,
            timestamp: now_millis(),
        }
    }

    pub fn final_chunk(transfer_code: &str, total_chunks: u32) -> Self {
        Self::FinalChunk {
            transfer_code: transfer_code.to_string(),
            total_chunks,
            timestamp: now_millis(),
        }
    }

    pub fn complete(transfer_code: &str, success: bool, error_message: Option<String>) -> Self {
        Self::Complete {
            transfer_code: transfer_code.to_string(),
            success,
            error_message,
            timestamp: now_millis(),
        }
    }

    pub fn cancel(transfer_code: &str) -> Self {
        Self::Cancel {
            transfer_code: transfer_code.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn error(transfer_code: Option<&str>, message: impl Into<String>) -> Self {
        Self::Error {
            transfer_code: transfer_code.map(str::to_string),
            error_message: message.into(),
            timestamp: now_millis(),
        }
    }

    /// Wire name of the message type (the `type` field)
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Connected { .. } => "connected",
            Self::PeerConnected { .. } => "peerConnected",
            Self::Ready { .. } => "ready",
            Self::Progress { .. } => "progress",
            Self::FinalChunk { .. } => "finalChunk",
            Self::Complete { .. } => "complete",
            Self::Cancel { .. } => "cancel",
            Self::Error { .. } => "error",
        }
    }

    /// Transfer code the message refers to, if any
    pub fn transfer_code(&self) -> Option<&str> {
        match self {
            Self::Register { transfer_code, .. }
            | Self::Connected { transfer_code, .. }
            | Self::PeerConnected { transfer_code, .. }
            | Self::Ready { transfer_code, .. }
            | Self::Progress { transfer_code, .. }
            | Self::FinalChunk { transfer_code, .. }
            | Self::Complete { transfer_code, .. }
            | Self::Cancel { transfer_code, .. } => Some(transfer_code),
            Self::Error { transfer_code, .. } => transfer_code.as_deref(),
        }
    }

    /// Serialize to the JSON text carried in a WebSocket text frame
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails (not expected for these types).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a WebSocket text frame
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a known control message.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
