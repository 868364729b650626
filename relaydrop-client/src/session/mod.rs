//! Send and receive drivers
//!
//! A driver races the candidates, registers on the winning connection, walks
//! the control handshake and runs the chunk engine. Whatever happens, it ends
//! with exactly one [`TransferOutcome`], handed to the configured
//! [`OutcomeSink`] and the completion callback.

mod receiver;
mod sender;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::time::{Instant, timeout_at};
use tokio_tungstenite::tungstenite::{Bytes, Error as WsError, Message};
use tracing::{debug, info};

use relaydrop_common::protocol::ControlMessage;

pub use receiver::{ReceiveRequest, receive_file};
pub use sender::{SendRequest, send_file};

use crate::engine::{
    CancelFlag, ChunkSink, CompletionCallback, ProgressCallback, TransferResult,
};
use crate::error::TransferError;
use crate::outcome::{OutcomeSink, OutcomeStatus, TracingOutcomeSink, TransferOutcome};
use crate::transform::{ByteTransform, Passthrough};

/// Collaborators plugged into a driver
#[derive(Clone)]
pub struct SessionHooks {
    pub transform: Arc<dyn ByteTransform>,
    pub cancel: CancelFlag,
    pub on_progress: Option<ProgressCallback>,
    pub on_complete: Option<CompletionCallback>,
    pub outcomes: Arc<dyn OutcomeSink>,
}

impl Default for SessionHooks {
    fn default() -> Self {
        Self {
            transform: Arc::new(Passthrough),
            cancel: CancelFlag::new(),
            on_progress: None,
            on_complete: None,
            outcomes: Arc::new(TracingOutcomeSink),
        }
    }
}

/// Details collected along the way, kept even when the transfer fails
#[derive(Debug, Default)]
struct Progress {
    file_name: Option<String>,
    size: u64,
    checksum: Option<String>,
    peer_address: Option<String>,
}

/// Turn a driver result into the one outcome reported for the transfer
fn conclude(
    code: &str,
    progress: Progress,
    result: Result<(), TransferError>,
    hooks: &SessionHooks,
) -> TransferOutcome {
    let (status, error) = match &result {
        Ok(()) => (OutcomeStatus::Completed, None),
        Err(e @ TransferError::Cancelled) => (OutcomeStatus::Cancelled, Some(e.to_string())),
        Err(e) => (OutcomeStatus::Failed, Some(e.to_string())),
    };

    let mut outcome = TransferOutcome::new(code, status);
    outcome.file_name = progress.file_name;
    outcome.size = progress.size;
    outcome.checksum = progress.checksum;
    outcome.peer_address = progress.peer_address;
    outcome.error = error;

    hooks.outcomes.record(&outcome);
    if let Some(callback) = &hooks.on_complete {
        callback(&TransferResult {
            transfer_code: code.to_string(),
            success: outcome.is_success(),
            error_message: outcome.error.clone(),
        });
    }
    outcome
}

/// Tell the relay we are giving up, if the user asked for it
///
/// Best effort: the connection may already be gone.
async fn notify_cancel<K: ChunkSink>(
    code: &str,
    result: &Result<(), TransferError>,
    cancel: &CancelFlag,
    sink: &mut K,
) {
    if matches!(result, Err(TransferError::Cancelled)) && cancel.is_cancelled() {
        info!(code = %code, "cancelling transfer");
        if let Err(e) = sink.send_control(&ControlMessage::cancel(code)).await {
            debug!(code = %code, error = %e, "could not deliver cancel");
        }
    }
}

// =============================================================================
// Reading relay traffic
// =============================================================================

/// One decoded item from the relay
#[derive(Debug)]
enum Incoming {
    Control(ControlMessage),
    Chunk(Bytes),
    Closed,
}

/// Read half of a relay connection
struct RelayReader<S> {
    stream: S,
}

impl<S> RelayReader<S>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Next control message or chunk; cancel-safe
    async fn next(&mut self) -> Result<Incoming, TransferError> {
        loop {
            match self.stream.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(Incoming::Closed),
                Some(Ok(Message::Text(text))) => {
                    return ControlMessage::from_json(&text)
                        .map(Incoming::Control)
                        .map_err(|e| TransferError::Malformed(e.to_string()));
                }
                Some(Ok(Message::Binary(data))) => return Ok(Incoming::Chunk(data)),
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Ok(Incoming::Closed);
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Wait for the next control message that moves the handshake along
    ///
    /// Relay rejections, cancellations, failures and a closed connection come
    /// back as errors; `progress` messages are skipped.
    async fn expect(
        &mut self,
        cancel: &CancelFlag,
        limit: Duration,
        what: &'static str,
    ) -> Result<ControlMessage, TransferError> {
        let deadline = Instant::now() + limit;
        loop {
            let incoming = tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                incoming = timeout_at(deadline, self.next()) => {
                    incoming.map_err(|_| TransferError::Timeout(what))?
                }
            };
            match control(incoming)? {
                ControlMessage::Progress { .. } => continue,
                message => return Ok(message),
            }
        }
    }
}

/// Map terminal and error traffic to errors, pass other control messages
fn control(incoming: Result<Incoming, TransferError>) -> Result<ControlMessage, TransferError> {
    match incoming? {
        Incoming::Closed => Err(TransferError::TransportClosedUnexpectedly),
        Incoming::Chunk(_) => Err(TransferError::UnexpectedMessage("chunk")),
        Incoming::Control(ControlMessage::Error { error_message, .. }) => {
            Err(TransferError::Rejected(error_message))
        }
        Incoming::Control(ControlMessage::Cancel { .. }) => Err(TransferError::Cancelled),
        Incoming::Control(ControlMessage::Complete {
            success: false,
            error_message,
            ..
        }) => Err(TransferError::Failed(
            error_message.unwrap_or_else(|| "transfer failed".to_string()),
        )),
        Incoming::Control(message) => Ok(message),
    }
}
