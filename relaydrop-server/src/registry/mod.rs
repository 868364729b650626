//! Relay session registry
//!
//! Maps transfer codes to [`TransferSession`]s and brokers everything that
//! happens to them: registration, transport attachment, the `peerConnected`
//! handshake, chunk forwarding and terminal transitions.
//!
//! ## Concurrency
//!
//! Sessions live in a `DashMap`, so operations on different codes never
//! contend and operations on the same code are atomic per key. No map guard is
//! ever held across an `.await`: transport handles are cloned out first and
//! frames are queued afterwards.
//!
//! ## Terminal transitions
//!
//! A terminal transition removes the session from the map with `remove_if`.
//! Whichever caller wins that removal emits the one and only completion event
//! for the code; everyone else finds no session and drops their event. The
//! terminal status is kept in a tombstone table so late arrivals can be logged
//! and inspected.

mod events;
mod session;
mod sweeper;
mod transport;

pub use events::{CompletionEvent, CompletionObserver, ProgressEvent, ProgressObserver};
pub use session::{PeerInfo, SessionStatus, TransferSession};
pub use sweeper::spawn_sweeper;
pub use transport::{TransportHandle, TransportOutbox};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use relaydrop_common::chunk::{ChunkHeader, progress_fraction};
use relaydrop_common::protocol::{ControlMessage, Role};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RegistryError;
use events::ObserverList;

/// Error message attached to cancelled sessions
const CANCELLED_MESSAGE: &str = "transfer cancelled";

/// How long a `complete` notice may wait for room in a busy outbox
const COMPLETION_NOTICE_GRACE: Duration = Duration::from_secs(5);

/// What happened to a chunk handed to [`SessionRegistry::relay_chunk`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDisposition {
    /// Queued for the receiver
    Forwarded,
    /// Final chunk queued; the session is now COMPLETED
    Completed,
    /// Discarded (unknown, cancelled, finished or not yet transferring)
    Dropped,
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    status: SessionStatus,
    at: Instant,
}

struct Inner {
    sessions: DashMap<String, TransferSession>,
    tombstones: DashMap<String, Tombstone>,
    progress_observers: DashMap<String, ObserverList<ProgressObserver>>,
    completion_observers: DashMap<String, ObserverList<CompletionObserver>>,
    idle_timeout: Duration,
}

/// Shared registry of relay sessions
///
/// Cheap to clone; all clones refer to the same sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    /// Create an empty registry whose sweeper evicts sessions idle for `idle_timeout`
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                tombstones: DashMap::new(),
                progress_observers: DashMap::new(),
                completion_observers: DashMap::new(),
                idle_timeout,
            }),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.inner.idle_timeout
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Whether a live session exists for `code`
    pub fn contains(&self, code: &str) -> bool {
        self.inner.sessions.contains_key(code)
    }

    /// Live status, or the terminal status of a recently finished session
    pub fn status(&self, code: &str) -> Option<SessionStatus> {
        if let Some(session) = self.inner.sessions.get(code) {
            return Some(session.status);
        }
        self.inner.tombstones.get(code).map(|t| t.status)
    }

    /// Snapshot of a live session
    pub fn session(&self, code: &str) -> Option<TransferSession> {
        self.inner.sessions.get(code).map(|s| s.value().clone())
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register the sending side of a transfer
    ///
    /// Creates the session in CONNECTING, or fills in a placeholder left by an
    /// earlier [`attach`](Self::attach).
    ///
    /// # Errors
    ///
    /// Returns `CodeAlreadyInUse` if a sender already registered this code.
    pub fn register_sender(
        &self,
        code: &str,
        info: PeerInfo,
        file_name: Option<String>,
        file_size: u64,
    ) -> Result<(), RegistryError> {
        let now = Instant::now();
        match self.inner.sessions.entry(code.to_string()) {
            Entry::Occupied(mut entry) => {
                let session = entry.get_mut();
                if session.sender_info.is_some() {
                    return Err(RegistryError::CodeAlreadyInUse(code.to_string()));
                }
                session.sender_info = Some(info);
                session.file_name = file_name;
                session.file_size = Some(file_size);
                session.touch(now);
            }
            Entry::Vacant(entry) => {
                let mut session = TransferSession::new(code, now);
                session.sender_info = Some(info);
                session.file_name = file_name;
                session.file_size = Some(file_size);
                entry.insert(session);
            }
        }
        self.inner.tombstones.remove(code);
        info!(code = %code, size = file_size, "sender registered");
        Ok(())
    }

    /// Register the receiving side of a transfer
    ///
    /// Never creates a session.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCode` if no session exists for `code`, or
    /// `CodeAlreadyInUse` if a receiver already registered.
    pub fn register_receiver(&self, code: &str, info: PeerInfo) -> Result<(), RegistryError> {
        let Some(mut session) = self.inner.sessions.get_mut(code) else {
            debug!(code = %code, "receiver registration for unknown code");
            return Err(RegistryError::InvalidCode(code.to_string()));
        };
        if session.receiver_info.is_some() {
            return Err(RegistryError::CodeAlreadyInUse(code.to_string()));
        }
        session.receiver_info = Some(info);
        session.touch(Instant::now());
        drop(session);

        info!(code = %code, "receiver registered");
        Ok(())
    }

    /// Bind a transport to the sender or receiver slot of `code`
    ///
    /// A placeholder session is created if none exists, which tolerates a
    /// transport arriving before formal registration. When both slots become
    /// populated the session moves CONNECTING -> CONNECTED and each side is
    /// sent `peerConnected` carrying the other side's observed address. That
    /// notification happens once per session.
    ///
    /// # Errors
    ///
    /// Returns `CodeAlreadyInUse` if the slot holds a different transport that
    /// is still open.
    pub async fn attach(
        &self,
        code: &str,
        role: Role,
        transport: Arc<TransportHandle>,
    ) -> Result<(), RegistryError> {
        let now = Instant::now();
        let paired = {
            let mut session = self
                .inner
                .sessions
                .entry(code.to_string())
                .or_insert_with(|| {
                    debug!(code = %code, role = %role, "placeholder session created by attach");
                    TransferSession::new(code, now)
                });

            if let Some(existing) = session.transport(role)
                && existing.id() != transport.id()
                && existing.is_open()
            {
                return Err(RegistryError::CodeAlreadyInUse(code.to_string()));
            }

            session.set_transport(role, transport.clone());
            session.touch(now);

            if session.status == SessionStatus::Connecting && session.both_attached() {
                session.status = SessionStatus::Connected;
                session
                    .transport(Role::Sender)
                    .cloned()
                    .zip(session.transport(Role::Receiver).cloned())
                    .map(|pair| (pair, session.file_name.clone(), session.file_size))
            } else {
                None
            }
        };
        self.inner.tombstones.remove(code);
        debug!(code = %code, role = %role, peer = %transport.peer_addr(), "transport attached");

        if let Some(((sender, receiver), file_name, file_size)) = paired {
            info!(code = %code, sender = %sender.peer_addr(), receiver = %receiver.peer_addr(), "peers connected");
            for (to, other) in [(&sender, &receiver), (&receiver, &sender)] {
                let message = ControlMessage::PeerConnected {
                    transfer_code: code.to_string(),
                    peer_address: Some(other.peer_addr().to_string()),
                    file_name: file_name.clone(),
                    file_size,
                    timestamp: relaydrop_common::time::now_millis(),
                };
                // A dead transport here is noticed by its own connection task
                if let Err(e) = to.send_control(&message).await {
                    warn!(code = %code, peer = %to.peer_addr(), error = %e, "failed to deliver peerConnected");
                }
            }
        }
        Ok(())
    }

    /// Move a CONNECTED session to TRANSFERRING
    ///
    /// # Errors
    ///
    /// Returns `InvalidCode` if there is no session, or `InvalidState` if it is
    /// not CONNECTED.
    pub fn begin_transfer(&self, code: &str) -> Result<(), RegistryError> {
        let Some(mut session) = self.inner.sessions.get_mut(code) else {
            return Err(RegistryError::InvalidCode(code.to_string()));
        };
        if session.status != SessionStatus::Connected {
            return Err(RegistryError::InvalidState {
                code: code.to_string(),
                actual: session.status,
                expected: SessionStatus::Connected,
            });
        }
        session.status = SessionStatus::Transferring;
        session.touch(Instant::now());
        drop(session);

        info!(code = %code, "transfer started");
        Ok(())
    }

    // =========================================================================
    // Forwarding
    // =========================================================================

    /// Forward a control message from connection `from` to the other side
    ///
    /// # Errors
    ///
    /// Returns `InvalidCode` if `from` is not attached to a live session for
    /// `code`, or a transport error if the other side is closed.
    pub async fn relay_control(
        &self,
        code: &str,
        from: Uuid,
        message: &ControlMessage,
    ) -> Result<(), RegistryError> {
        let target = {
            let Some(mut session) = self.inner.sessions.get_mut(code) else {
                return Err(RegistryError::InvalidCode(code.to_string()));
            };
            let Some(role) = session.role_of(from) else {
                return Err(RegistryError::InvalidCode(code.to_string()));
            };
            session.touch(Instant::now());
            session.transport(role.peer()).cloned()
        };

        match target {
            Some(target) => target.send_control(message).await,
            None => Ok(()),
        }
    }

    /// Forward one binary chunk frame from the sender to the receiver
    ///
    /// Frames are forwarded in arrival order through the receiver's bounded
    /// queue. Chunks for unknown, cancelled, finished or not-yet-transferring
    /// sessions are dropped and never create or reopen a session. The final
    /// frame completes the session.
    ///
    /// # Errors
    ///
    /// Returns `MalformedChunk` for an invalid header, or
    /// `IoErrorDuringChunkSend` if the receiver's transport fails, in which
    /// case the session has already been moved to FAILED.
    pub async fn relay_chunk(
        &self,
        code: &str,
        from: Uuid,
        frame: Bytes,
    ) -> Result<ChunkDisposition, RegistryError> {
        let header = ChunkHeader::parse(&frame)?;

        let receiver = {
            let Some(mut session) = self.inner.sessions.get_mut(code) else {
                debug!(code = %code, index = header.index, status = ?self.status(code), "chunk for inactive session dropped");
                return Ok(ChunkDisposition::Dropped);
            };
            if session.role_of(from) != Some(Role::Sender) {
                warn!(code = %code, "chunk from a connection that is not the sender dropped");
                return Ok(ChunkDisposition::Dropped);
            }
            if session.status != SessionStatus::Transferring {
                debug!(code = %code, status = %session.status, "chunk before transfer start dropped");
                return Ok(ChunkDisposition::Dropped);
            }
            let Some(receiver) = session.transport(Role::Receiver).cloned() else {
                return Ok(ChunkDisposition::Dropped);
            };
            session.touch(Instant::now());
            receiver
        };

        if let Err(e) = receiver.send(Message::Binary(frame)).await {
            let err = RegistryError::IoErrorDuringChunkSend {
                code: code.to_string(),
                index: header.index,
                reason: e.to_string(),
            };
            // A cancel may have closed the receiver first; then the session is
            // already terminal and this chunk is simply late.
            if !self
                .finish(code, SessionStatus::Failed, Some(err.to_string()), |s| {
                    s.status == SessionStatus::Transferring
                })
                .await
            {
                return Ok(ChunkDisposition::Dropped);
            }
            return Err(err);
        }

        let (bytes, total) = {
            let Some(mut session) = self.inner.sessions.get_mut(code) else {
                return Ok(ChunkDisposition::Dropped);
            };
            session.bytes_forwarded += u64::from(header.length);
            (session.bytes_forwarded, session.file_size.unwrap_or(0))
        };

        let progress = ProgressEvent {
            transfer_code: code.to_string(),
            progress: progress_fraction(bytes, total, header.is_final),
            bytes_transferred: bytes,
        };
        if !header.is_final {
            self.emit_progress(progress);
            return Ok(ChunkDisposition::Forwarded);
        }

        // Full progress is only reported by the call that completes the session
        let completed = self
            .finish_reporting(
                code,
                SessionStatus::Completed,
                None,
                Some(progress),
                |s| s.status == SessionStatus::Transferring,
            )
            .await;
        Ok(if completed {
            ChunkDisposition::Completed
        } else {
            ChunkDisposition::Dropped
        })
    }

    // =========================================================================
    // Termination
    // =========================================================================

    /// Cancel a session: CANCELLED, both sides told, both transports closed
    ///
    /// # Errors
    ///
    /// Returns `InvalidCode` if there is no live session for `code`.
    pub async fn cancel(&self, code: &str) -> Result<(), RegistryError> {
        if self
            .finish(code, SessionStatus::Cancelled, Some(CANCELLED_MESSAGE.to_string()), |_| true)
            .await
        {
            Ok(())
        } else {
            Err(RegistryError::InvalidCode(code.to_string()))
        }
    }

    /// Cancel on behalf of connection `from`, which must belong to the session
    ///
    /// # Errors
    ///
    /// Returns `InvalidCode` if `from` is not attached to a live session for `code`.
    pub async fn cancel_from(&self, code: &str, from: Uuid) -> Result<(), RegistryError> {
        if self
            .finish(
                code,
                SessionStatus::Cancelled,
                Some(CANCELLED_MESSAGE.to_string()),
                |s| s.role_of(from).is_some(),
            )
            .await
        {
            Ok(())
        } else {
            Err(RegistryError::InvalidCode(code.to_string()))
        }
    }

    /// Note that connection `from` has ended
    ///
    /// In CONNECTING the slot is cleared; a session left with no transport at
    /// all fails. Losing either side once CONNECTED fails the session with
    /// `TransportClosedUnexpectedly` and closes the surviving side.
    pub async fn detach(&self, code: &str, from: Uuid) {
        let lost = {
            let Some(mut session) = self.inner.sessions.get_mut(code) else {
                debug!(code = %code, status = ?self.status(code), "detach after session ended");
                return;
            };
            let Some(role) = session.role_of(from) else {
                return;
            };
            if session.status == SessionStatus::Connecting {
                session.clear_transport(role);
                session.touch(Instant::now());
                session.is_detached().then_some(role)
            } else {
                Some(role)
            }
        };

        let Some(role) = lost else {
            return;
        };
        let err = RegistryError::TransportClosedUnexpectedly {
            code: code.to_string(),
            role,
        };
        self.finish(code, SessionStatus::Failed, Some(err.to_string()), |s| {
            if s.status == SessionStatus::Connecting {
                s.is_detached()
            } else {
                s.role_of(from).is_some()
            }
        })
        .await;
    }

    /// Perform a terminal transition if `guard` accepts the current session
    ///
    /// Returns `true` if this call performed the transition.
    async fn finish<F>(
        &self,
        code: &str,
        status: SessionStatus,
        error_message: Option<String>,
        guard: F,
    ) -> bool
    where
        F: FnOnce(&TransferSession) -> bool,
    {
        self.finish_reporting(code, status, error_message, None, guard)
            .await
    }

    /// [`finish`](Self::finish) that emits `progress` just before the
    /// completion event, and only if this call performed the transition
    async fn finish_reporting<F>(
        &self,
        code: &str,
        status: SessionStatus,
        error_message: Option<String>,
        progress: Option<ProgressEvent>,
        guard: F,
    ) -> bool
    where
        F: FnOnce(&TransferSession) -> bool,
    {
        let Some((_, session)) = self.inner.sessions.remove_if(code, |_, s| guard(s)) else {
            return false;
        };
        let now = Instant::now();
        self.inner
            .tombstones
            .insert(code.to_string(), Tombstone { status, at: now });

        match &error_message {
            Some(reason) if status != SessionStatus::Completed => {
                info!(code = %code, status = %status, reason = %reason, "session finished")
            }
            _ => info!(code = %code, status = %status, bytes = session.bytes_forwarded, "session finished"),
        }

        let notice = match status {
            SessionStatus::Cancelled => ControlMessage::cancel(code),
            _ => ControlMessage::complete(
                code,
                status == SessionStatus::Completed,
                error_message.clone(),
            ),
        };
        for transport in session.transports() {
            match transport.try_send_control(&notice) {
                Err(RegistryError::OutboxFull) if status == SessionStatus::Completed => {
                    deliver_then_close(transport, notice.clone());
                }
                Err(e) => {
                    debug!(code = %code, peer = %transport.peer_addr(), error = %e, "terminal notice dropped");
                    transport.close();
                }
                Ok(()) => transport.close(),
            }
        }

        if let Some(progress) = progress {
            self.emit_progress(progress);
        }
        self.emit_completion(CompletionEvent {
            transfer_code: code.to_string(),
            success: status == SessionStatus::Completed,
            error_message,
            status,
        });
        true
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// Register a progress observer for `code`
    pub fn on_progress<F>(&self, code: &str, observer: F)
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.inner
            .progress_observers
            .entry(code.to_string())
            .or_insert_with(|| ObserverList::new(Instant::now()))
            .observers
            .push(Arc::new(observer));
    }

    /// Register a completion observer for `code`
    pub fn on_complete<F>(&self, code: &str, observer: F)
    where
        F: Fn(&CompletionEvent) + Send + Sync + 'static,
    {
        self.inner
            .completion_observers
            .entry(code.to_string())
            .or_insert_with(|| ObserverList::new(Instant::now()))
            .observers
            .push(Arc::new(observer));
    }

    fn emit_progress(&self, event: ProgressEvent) {
        let observers = self
            .inner
            .progress_observers
            .get(&event.transfer_code)
            .map(|list| list.snapshot())
            .unwrap_or_default();
        for observer in observers {
            observer(&event);
        }
    }

    fn emit_completion(&self, event: CompletionEvent) {
        self.inner.progress_observers.remove(&event.transfer_code);
        let observers = self
            .inner
            .completion_observers
            .remove(&event.transfer_code)
            .map(|(_, list)| list.observers)
            .unwrap_or_default();
        for observer in observers {
            observer(&event);
        }
    }
}

/// Queue `notice` once the outbox has room, then close the transport
///
/// Used when a completed transfer's receiver still has frames in flight. The
/// wait is bounded and runs on its own task so the terminal transition never
/// blocks on a peer.
fn deliver_then_close(transport: Arc<TransportHandle>, notice: ControlMessage) {
    tokio::spawn(async move {
        match tokio::time::timeout(COMPLETION_NOTICE_GRACE, transport.send_control(&notice)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %transport.peer_addr(), error = %e, "completion notice dropped"),
            Err(_) => debug!(peer = %transport.peer_addr(), "peer stalled, completion notice dropped"),
        }
        transport.close();
    });
}
