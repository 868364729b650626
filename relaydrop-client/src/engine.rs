//! Chunked transfer engine
//!
//! The sending half splits a byte source into framed chunks and pushes them
//! through a [`ChunkSink`]; each frame is awaited until written, so a slow
//! relay or receiver slows the sender down. The receiving half keeps one
//! [`Reassembler`] per transfer code in a [`ReceiveTable`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::{Sink, SinkExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use relaydrop_common::chunk::{
    DEFAULT_CHUNK_SIZE, Reassembled, Reassembler, chunk_count, encode_frame, progress_fraction,
};
use relaydrop_common::hash::Checksum;
use relaydrop_common::protocol::ControlMessage;

use crate::error::TransferError;

// =============================================================================
// Callbacks
// =============================================================================

/// Progress of one transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub transfer_code: String,
    /// `[0.0, 1.0]`; exactly `1.0` only after the final frame
    pub progress: f64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

/// Final result reported to a completion callback
#[derive(Debug, Clone, PartialEq)]
pub struct TransferResult {
    pub transfer_code: String,
    pub success: bool,
    pub error_message: Option<String>,
}

pub type ProgressCallback = Arc<dyn Fn(&TransferProgress) + Send + Sync>;
pub type CompletionCallback = Arc<dyn Fn(&TransferResult) + Send + Sync>;

// =============================================================================
// Cancellation
// =============================================================================

/// Shared cancellation flag
///
/// Checked by the engine between frames and awaited by the session drivers
/// while they wait for relay messages.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    state: Arc<watch::Sender<bool>>,
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelFlag {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this only returns once set
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

// =============================================================================
// Sink
// =============================================================================

/// Destination of chunk frames and the control messages around them
#[async_trait::async_trait]
pub trait ChunkSink: Send {
    /// Write one binary frame, returning once it has been flushed
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransferError>;

    async fn send_control(&mut self, message: &ControlMessage) -> Result<(), TransferError>;
}

/// [`ChunkSink`] over the write half of a WebSocket
pub struct WsChunkSink<S> {
    inner: S,
}

impl<S> WsChunkSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait::async_trait]
impl<S> ChunkSink for WsChunkSink<S>
where
    S: Sink<Message, Error = WsError> + Unpin + Send,
{
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransferError> {
        self.inner.send(Message::Binary(frame.into())).await?;
        Ok(())
    }

    async fn send_control(&mut self, message: &ControlMessage) -> Result<(), TransferError> {
        let text = message.to_json()?;
        self.inner.send(Message::Text(text.into())).await?;
        Ok(())
    }
}

// =============================================================================
// Sending
// =============================================================================

/// Summary of a completed send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub bytes_sent: u64,
    pub chunks: u32,
    /// Hex SHA-256 of the streamed bytes
    pub checksum: String,
}

/// Streams a byte source as framed chunks
#[derive(Debug, Clone)]
pub struct ChunkEngine {
    chunk_size: usize,
    cancel: CancelFlag,
}

impl ChunkEngine {
    pub fn new(chunk_size: usize, cancel: CancelFlag) -> Self {
        Self { chunk_size, cancel }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Stream `total_size` bytes from `source` as chunk frames
    ///
    /// A `finalChunk` announcement precedes the last frame and a `progress`
    /// message follows every other frame. `on_complete` is invoked exactly
    /// once, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Cancelled`] if the cancel flag is set between
    /// frames, an I/O error if the source ends early, or the sink's error.
    pub async fn send<R, K>(
        &self,
        code: &str,
        source: &mut R,
        total_size: u64,
        sink: &mut K,
        on_progress: Option<&ProgressCallback>,
        on_complete: Option<&CompletionCallback>,
    ) -> Result<SendReport, TransferError>
    where
        R: AsyncRead + Unpin + Send,
        K: ChunkSink,
    {
        let result = self
            .stream(code, source, total_size, sink, on_progress)
            .await;

        match &result {
            Ok(report) => {
                info!(code = %code, bytes = report.bytes_sent, chunks = report.chunks, "chunk stream sent")
            }
            Err(e) => warn!(code = %code, error = %e, "chunk stream aborted"),
        }
        if let Some(callback) = on_complete {
            callback(&TransferResult {
                transfer_code: code.to_string(),
                success: result.is_ok(),
                error_message: result.as_ref().err().map(ToString::to_string),
            });
        }
        result
    }

    async fn stream<R, K>(
        &self,
        code: &str,
        source: &mut R,
        total_size: u64,
        sink: &mut K,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<SendReport, TransferError>
    where
        R: AsyncRead + Unpin + Send,
        K: ChunkSink,
    {
        let total_chunks = chunk_count(total_size, self.chunk_size)?;
        let buffer_len = usize::try_from(total_size)
            .unwrap_or(usize::MAX)
            .min(self.chunk_size);
        let mut buffer = vec![0u8; buffer_len];
        let mut checksum = Checksum::new();
        let mut sent = 0u64;

        for index in 0..total_chunks {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let len = (total_size - sent).min(self.chunk_size as u64) as usize;
            let payload = &mut buffer[..len];
            source.read_exact(payload).await?;
            checksum.update(payload);

            let is_final = index + 1 == total_chunks;
            if is_final {
                sink.send_control(&ControlMessage::final_chunk(code, total_chunks))
                    .await?;
            }
            sink.send_frame(encode_frame(index, total_chunks, payload)?)
                .await?;
            sent += len as u64;

            let progress = progress_fraction(sent, total_size, is_final);
            if !is_final {
                sink.send_control(&ControlMessage::progress(code, progress, sent, total_size))
                    .await?;
            }
            debug!(code = %code, index, total_chunks, bytes = sent, "chunk sent");
            if let Some(callback) = on_progress {
                callback(&TransferProgress {
                    transfer_code: code.to_string(),
                    progress,
                    bytes_transferred: sent,
                    total_bytes: total_size,
                });
            }
        }

        Ok(SendReport {
            bytes_sent: sent,
            chunks: total_chunks,
            checksum: checksum.finish(),
        })
    }
}

impl Default for ChunkEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, CancelFlag::new())
    }
}

// =============================================================================
// Receiving
// =============================================================================

/// Per-code receive accumulators
///
/// An entry is removed when its stream completes or fails, so a code can be
/// received again afterwards.
#[derive(Debug, Default)]
pub struct ReceiveTable {
    streams: Mutex<HashMap<String, Reassembler>>,
}

impl ReceiveTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) accumulating frames for `code`
    pub fn begin(&self, code: &str, expected_size: Option<u64>) {
        let reassembler = match expected_size {
            Some(size) => Reassembler::with_expected_size(size),
            None => Reassembler::new(),
        };
        self.streams
            .lock()
            .expect("receive table lock poisoned")
            .insert(code.to_string(), reassembler);
    }

    /// Record a `finalChunk` announcement; false if `code` has no stream
    pub fn announce_final(&self, code: &str, total_chunks: u32) -> bool {
        match self
            .streams
            .lock()
            .expect("receive table lock poisoned")
            .get_mut(code)
        {
            Some(reassembler) => {
                reassembler.announce_final(total_chunks);
                true
            }
            None => false,
        }
    }

    /// Feed one frame for `code`
    ///
    /// # Errors
    ///
    /// Returns an error if `code` has no stream or the frame is rejected; a
    /// rejected stream is discarded.
    pub fn push(&self, code: &str, frame: &[u8]) -> Result<Reassembled, TransferError> {
        let mut streams = self.streams.lock().expect("receive table lock poisoned");
        let reassembler = streams
            .get_mut(code)
            .ok_or_else(|| TransferError::Failed(format!("no receive stream for {code}")))?;

        match reassembler.push(frame) {
            Ok(pending @ Reassembled::Pending { .. }) => Ok(pending),
            Ok(complete @ Reassembled::Complete(_)) => {
                streams.remove(code);
                Ok(complete)
            }
            Err(e) => {
                streams.remove(code);
                Err(e.into())
            }
        }
    }

    /// Drop the stream for `code`; true if one existed
    pub fn discard(&self, code: &str) -> bool {
        self.streams
            .lock()
            .expect("receive table lock poisoned")
            .remove(code)
            .is_some()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.streams
            .lock()
            .expect("receive table lock poisoned")
            .contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.streams.lock().expect("receive table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
