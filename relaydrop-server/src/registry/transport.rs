//! Handles to connected client transports
//!
//! A `TransportHandle` is what the registry stores in a session slot. It does
//! not own the socket: the connection task does. The handle only feeds the
//! connection's writer task through a bounded queue and can ask the task to
//! close. Both operations work without holding any registry lock, and closing
//! never waits on the queue: a send blocked on a full queue wakes with
//! `TransportClosed` as soon as the transport closes.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;

use relaydrop_common::protocol::ControlMessage;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::RegistryError;

/// Receiving half of a transport, owned by the connection's writer task
pub struct TransportOutbox {
    /// Frames queued for the socket, in order
    pub messages: mpsc::Receiver<Message>,
    /// Fires once when the registry closes the transport
    pub close: oneshot::Receiver<()>,
}

/// Registry-side reference to a client connection
pub struct TransportHandle {
    id: Uuid,
    peer_addr: SocketAddr,
    tx: mpsc::Sender<Message>,
    closed: watch::Sender<bool>,
    /// Wrapped in Mutex<Option<>> since the close signal is taken once
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl TransportHandle {
    /// Create a handle and the outbox its connection task drains
    ///
    /// `capacity` bounds the number of frames queued for the socket; senders
    /// wait when it is full, which is what propagates backpressure from a slow
    /// receiver back to the sender's connection.
    pub fn new(peer_addr: SocketAddr, capacity: usize) -> (Self, TransportOutbox) {
        let (tx, messages) = mpsc::channel(capacity.max(1));
        let (close_tx, close) = oneshot::channel();
        let handle = Self {
            id: Uuid::new_v4(),
            peer_addr,
            tx,
            closed: watch::Sender::new(false),
            close_tx: Mutex::new(Some(close_tx)),
        };
        (handle, TransportOutbox { messages, close })
    }

    /// Unique connection id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Address of the client as observed by the relay
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether frames can still be queued
    pub fn is_open(&self) -> bool {
        !self.is_closed() && !self.tx.is_closed()
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once `close` has been called
    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Queue a frame for the socket
    ///
    /// Waits while the queue is full. Fails immediately once the transport has
    /// been closed, and wakes with an error if it closes while waiting.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::TransportClosed` if the transport is closed.
    pub async fn send(&self, message: Message) -> Result<(), RegistryError> {
        if self.is_closed() {
            return Err(RegistryError::TransportClosed);
        }
        tokio::select! {
            biased;
            _ = self.closed() => Err(RegistryError::TransportClosed),
            sent = self.tx.send(message) => sent.map_err(|_| RegistryError::TransportClosed),
        }
    }

    /// Queue a control message without waiting for room
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::OutboxFull` if the queue has no free slot and
    /// `RegistryError::TransportClosed` if the transport is closed.
    pub fn try_send_control(&self, message: &ControlMessage) -> Result<(), RegistryError> {
        if self.is_closed() {
            return Err(RegistryError::TransportClosed);
        }
        let text = message.to_json()?;
        self.tx
            .try_send(Message::Text(text.into()))
            .map_err(|e| match e {
                TrySendError::Full(_) => RegistryError::OutboxFull,
                TrySendError::Closed(_) => RegistryError::TransportClosed,
            })
    }

    /// Serialize and queue a control message
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the transport is closed.
    pub async fn send_control(&self, message: &ControlMessage) -> Result<(), RegistryError> {
        let text = message.to_json()?;
        self.send(Message::Text(text.into())).await
    }

    /// Close the transport
    ///
    /// Further sends fail fast and sends waiting for room wake with an error.
    /// Frames already queued are still written by the connection task before
    /// it sends a close frame.
    pub fn close(&self) {
        self.closed.send_replace(true);
        if let Some(tx) = self
            .close_tx
            .lock()
            .expect("transport close lock poisoned")
            .take()
        {
            let _ = tx.send(());
        }
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "192.0.2.10:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_send_reaches_outbox() {
        let (handle, mut outbox) = TransportHandle::new(addr(), 4);
        handle
            .send_control(&ControlMessage::ready("123456"))
            .await
            .unwrap();
        match outbox.messages.recv().await {
            Some(Message::Text(text)) => assert!(text.as_str().contains("\"ready\"")),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_after_close_fails_fast() {
        let (handle, mut outbox) = TransportHandle::new(addr(), 1);
        handle.close();
        assert!(!handle.is_open());
        assert!(matches!(
            handle.send(Message::Binary(vec![1u8].into())).await,
            Err(RegistryError::TransportClosed)
        ));
        // The close signal fired exactly once
        assert!(outbox.close.try_recv().is_ok());
        // Closing twice is harmless
        handle.close();
    }

    #[tokio::test]
    async fn test_send_fails_when_outbox_dropped() {
        let (handle, outbox) = TransportHandle::new(addr(), 1);
        drop(outbox);
        assert!(!handle.is_open());
        assert!(handle.send(Message::Binary(vec![].into())).await.is_err());
    }

    #[tokio::test]
    async fn test_blocked_send_wakes_on_outbox_drop() {
        let (handle, outbox) = TransportHandle::new(addr(), 1);
        handle.send(Message::Binary(vec![0u8].into())).await.unwrap();

        let handle = std::sync::Arc::new(handle);
        let blocked = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.send(Message::Binary(vec![1u8].into())).await })
        };
        tokio::task::yield_now().await;
        drop(outbox);
        assert!(blocked.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_blocked_send_wakes_on_close() {
        // Outbox stays alive and undrained, like a peer that stopped reading
        let (handle, _outbox) = TransportHandle::new(addr(), 1);
        handle.send(Message::Binary(vec![0u8].into())).await.unwrap();

        let handle = std::sync::Arc::new(handle);
        let blocked = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.send(Message::Binary(vec![1u8].into())).await })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        handle.close();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), blocked)
            .await
            .expect("blocked send did not wake on close")
            .unwrap();
        assert!(matches!(result, Err(RegistryError::TransportClosed)));
    }

    #[tokio::test]
    async fn test_try_send_control_reports_full_queue() {
        let (handle, mut outbox) = TransportHandle::new(addr(), 1);
        handle.try_send_control(&ControlMessage::ready("123456")).unwrap();
        assert!(matches!(
            handle.try_send_control(&ControlMessage::ready("123456")),
            Err(RegistryError::OutboxFull)
        ));

        assert!(outbox.messages.recv().await.is_some());
        handle.close();
        assert!(matches!(
            handle.try_send_control(&ControlMessage::ready("123456")),
            Err(RegistryError::TransportClosed)
        ));
    }

    #[test]
    fn test_ids_are_unique() {
        let (a, _oa) = TransportHandle::new(addr(), 1);
        let (b, _ob) = TransportHandle::new(addr(), 1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.peer_addr(), addr());
    }
}
