//! Per-code transfer session state

use std::sync::Arc;

use relaydrop_common::protocol::Role;
use strum::{AsRefStr, Display};
use tokio::time::Instant;
use uuid::Uuid;

use super::transport::TransportHandle;

/// Lifecycle of a transfer session
///
/// `CONNECTING -> CONNECTED -> TRANSFERRING -> {COMPLETED | FAILED | CANCELLED}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Identity a client supplies when registering
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub device_id: Option<String>,
    pub username: Option<String>,
    pub session_id: Option<String>,
}

/// Server-side state for one transfer code
///
/// Transport handles are references only: the underlying connection may close
/// at any time, and callers check [`TransportHandle::is_open`] rather than
/// assuming liveness.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub transfer_code: String,
    /// `None` while the session is a placeholder created by an early attach
    pub sender_info: Option<PeerInfo>,
    pub receiver_info: Option<PeerInfo>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub status: SessionStatus,
    pub start_time: Instant,
    pub last_activity: Instant,
    /// Payload bytes forwarded to the receiver so far
    pub bytes_forwarded: u64,
    sender_transport: Option<Arc<TransportHandle>>,
    receiver_transport: Option<Arc<TransportHandle>>,
}

impl TransferSession {
    pub(crate) fn new(transfer_code: &str, now: Instant) -> Self {
        Self {
            transfer_code: transfer_code.to_string(),
            sender_info: None,
            receiver_info: None,
            file_name: None,
            file_size: None,
            status: SessionStatus::Connecting,
            start_time: now,
            last_activity: now,
            bytes_forwarded: 0,
            sender_transport: None,
            receiver_transport: None,
        }
    }

    /// Transport bound to the given role, if any
    pub fn transport(&self, role: Role) -> Option<&Arc<TransportHandle>> {
        match role {
            Role::Sender => self.sender_transport.as_ref(),
            Role::Receiver => self.receiver_transport.as_ref(),
        }
    }

    pub(crate) fn set_transport(&mut self, role: Role, transport: Arc<TransportHandle>) {
        match role {
            Role::Sender => self.sender_transport = Some(transport),
            Role::Receiver => self.receiver_transport = Some(transport),
        }
    }

    pub(crate) fn clear_transport(&mut self, role: Role) {
        match role {
            Role::Sender => self.sender_transport = None,
            Role::Receiver => self.receiver_transport = None,
        }
    }

    /// Role whose slot holds the connection `id`
    pub fn role_of(&self, id: Uuid) -> Option<Role> {
        [Role::Sender, Role::Receiver]
            .into_iter()
            .find(|role| self.transport(*role).is_some_and(|t| t.id() == id))
    }

    /// Both slots hold a transport
    pub fn both_attached(&self) -> bool {
        self.sender_transport.is_some() && self.receiver_transport.is_some()
    }

    /// Neither slot holds a transport
    pub fn is_detached(&self) -> bool {
        self.sender_transport.is_none() && self.receiver_transport.is_none()
    }

    /// Both transports currently attached, for broadcasting
    pub(crate) fn transports(&self) -> Vec<Arc<TransportHandle>> {
        self.sender_transport
            .iter()
            .chain(self.receiver_transport.iter())
            .cloned()
            .collect()
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }
}
