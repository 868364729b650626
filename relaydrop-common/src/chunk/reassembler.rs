//! Receive-side accumulator for one chunk stream

use super::error::ChunkError;
use super::frame::decode_frame;
use super::progress_fraction;

/// Result of feeding one frame to a [`Reassembler`]
#[derive(Debug, PartialEq)]
pub enum Reassembled {
    /// More frames are expected
    Pending {
        index: u32,
        total_chunks: u32,
        bytes_received: u64,
        progress: f64,
    },
    /// The final frame arrived; carries the complete byte stream
    Complete(Vec<u8>),
}

/// Accumulates in-order chunk frames into a byte buffer
///
/// Frames must arrive with consecutive indices starting at 0. Once the final
/// frame has been accepted the buffer is handed out and the reassembler
/// refuses further frames.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
    next_index: u32,
    total_chunks: Option<u32>,
    announced_final: Option<u32>,
    expected_size: Option<u64>,
    finished: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a reassembler that verifies the total size on completion
    pub fn with_expected_size(size: u64) -> Self {
        Self {
            expected_size: Some(size),
            buffer: Vec::with_capacity(size.min(64 * 1024 * 1024) as usize),
            ..Self::default()
        }
    }

    /// Bytes accumulated so far
    pub fn bytes_received(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Whether the final frame has been accepted
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Record a `finalChunk` announcement
    ///
    /// The next frame must then be the final one of a `total_chunks` stream.
    pub fn announce_final(&mut self, total_chunks: u32) {
        self.announced_final = Some(total_chunks);
    }

    /// Feed one binary frame
    ///
    /// # Errors
    ///
    /// Returns an error for malformed frames, gaps, duplicates, a changed chunk
    /// count, a final frame that contradicts the announcement, a size that
    /// disagrees with the expected size, or any frame after completion.
    pub fn push(&mut self, frame: &[u8]) -> Result<Reassembled, ChunkError> {
        if self.finished {
            return Err(ChunkError::StreamFinished);
        }

        let (header, payload) = decode_frame(frame)?;

        if let Some(total) = self.total_chunks
            && total != header.total_chunks
        {
            return Err(ChunkError::TotalMismatch {
                expected: total,
                actual: header.total_chunks,
            });
        }
        if header.index != self.next_index {
            return Err(ChunkError::OutOfOrder {
                expected: self.next_index,
                actual: header.index,
            });
        }
        if let Some(total) = self.announced_final
            && (total != header.total_chunks || !header.is_final)
        {
            return Err(ChunkError::FinalFlagMismatch {
                index: header.index,
                total,
            });
        }

        self.total_chunks = Some(header.total_chunks);
        self.buffer.extend_from_slice(payload);
        self.next_index += 1;

        let received = self.buffer.len() as u64;
        if let Some(expected) = self.expected_size
            && (received > expected || (header.is_final && received != expected))
        {
            return Err(ChunkError::SizeMismatch {
                expected,
                actual: received,
            });
        }

        if header.is_final {
            self.finished = true;
            return Ok(Reassembled::Complete(std::mem::take(&mut self.buffer)));
        }

        let total = self.expected_size.unwrap_or(0);
        Ok(Reassembled::Pending {
            index: header.index,
            total_chunks: header.total_chunks,
            bytes_received: received,
            progress: progress_fraction(received, total, false),
        })
    }
}
