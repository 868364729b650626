//! Binary chunk frame encoding and decoding
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! index u32 | total_chunks u32 | length u32 | flags u8 | payload | [FILE_END]
//! ```
//!
//! The sentinel follows the payload of the final frame only. The payload extent
//! is always taken from `length`, never from searching for the sentinel.

use super::error::ChunkError;
use super::{FINAL_FLAG, HEADER_LEN, MAX_CHUNK_SIZE, SENTINEL};

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Zero-based chunk index
    pub index: u32,
    /// Number of chunks in the stream (at least 1)
    pub total_chunks: u32,
    /// Payload length in bytes
    pub length: u32,
    /// Whether this is the last frame of the stream
    pub is_final: bool,
}

impl ChunkHeader {
    fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.index.to_be_bytes());
        out[4..8].copy_from_slice(&self.total_chunks.to_be_bytes());
        out[8..12].copy_from_slice(&self.length.to_be_bytes());
        out[12] = if self.is_final { FINAL_FLAG } else { 0 };
        out
    }

    /// Parse only the fixed header from the front of a frame
    ///
    /// Used by the relay, which forwards frames without copying payloads out.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is shorter than a header or the
    /// index/final-flag combination is inconsistent.
    pub fn parse(frame: &[u8]) -> Result<Self, ChunkError> {
        if frame.len() < HEADER_LEN {
            return Err(ChunkError::Truncated(frame.len()));
        }
        let word = |at: usize| u32::from_be_bytes([frame[at], frame[at + 1], frame[at + 2], frame[at + 3]]);
        let header = Self {
            index: word(0),
            total_chunks: word(4),
            length: word(8),
            is_final: frame[12] & FINAL_FLAG != 0,
        };

        if header.total_chunks == 0 || header.index >= header.total_chunks {
            return Err(ChunkError::IndexOutOfRange {
                index: header.index,
                total: header.total_chunks,
            });
        }
        if header.is_final != (header.index + 1 == header.total_chunks) {
            return Err(ChunkError::FinalFlagMismatch {
                index: header.index,
                total: header.total_chunks,
            });
        }
        Ok(header)
    }
}

/// Encode one chunk as a binary frame
///
/// The final flag is derived from `index + 1 == total_chunks`; the sentinel is
/// appended after the payload of the final frame.
///
/// # Errors
///
/// Returns an error if the payload exceeds [`MAX_CHUNK_SIZE`] or the index is
/// out of range.
pub fn encode_frame(index: u32, total_chunks: u32, payload: &[u8]) -> Result<Vec<u8>, ChunkError> {
    if payload.len() > MAX_CHUNK_SIZE {
        return Err(ChunkError::PayloadTooLarge(payload.len()));
    }
    if total_chunks == 0 || index >= total_chunks {
        return Err(ChunkError::IndexOutOfRange {
            index,
            total: total_chunks,
        });
    }

    let is_final = index + 1 == total_chunks;
    let header = ChunkHeader {
        index,
        total_chunks,
        length: payload.len() as u32,
        is_final,
    };

    let trailer = if is_final { SENTINEL.len() } else { 0 };
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + trailer);
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    if is_final {
        frame.extend_from_slice(SENTINEL);
    }
    Ok(frame)
}

/// Decode a binary frame into its header and payload
///
/// # Errors
///
/// Returns an error if the header is invalid, the byte count disagrees with the
/// declared length, or the final frame does not end with the sentinel.
pub fn decode_frame(frame: &[u8]) -> Result<(ChunkHeader, &[u8]), ChunkError> {
    let header = ChunkHeader::parse(frame)?;
    let body = &frame[HEADER_LEN..];
    let length = header.length as usize;

    let expected = if header.is_final {
        length + SENTINEL.len()
    } else {
        length
    };
    if body.len() != expected {
        if header.is_final && body.len() == length {
            return Err(ChunkError::MissingSentinel);
        }
        return Err(ChunkError::LengthMismatch {
            declared: header.length,
            actual: body.len(),
        });
    }

    let (payload, trailer) = body.split_at(length);
    if header.is_final && trailer != SENTINEL {
        return Err(ChunkError::MissingSentinel);
    }
    Ok((header, payload))
}
