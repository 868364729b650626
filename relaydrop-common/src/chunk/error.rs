//! Chunk framing errors

use thiserror::Error;

/// Errors raised while framing or reassembling chunks
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("declared length {declared} does not match {actual} payload bytes")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("final frame is missing the end-of-stream marker")]
    MissingSentinel,

    #[error("chunk index {index} out of range for {total} chunks")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("final flag does not match index {index} of {total} chunks")]
    FinalFlagMismatch { index: u32, total: u32 },

    #[error("expected chunk {expected}, got {actual}")]
    OutOfOrder { expected: u32, actual: u32 },

    #[error("total chunk count changed from {expected} to {actual}")]
    TotalMismatch { expected: u32, actual: u32 },

    #[error("stream already complete")]
    StreamFinished,

    #[error("payload of {0} bytes exceeds the chunk capacity")]
    PayloadTooLarge(usize),

    #[error("file of {0} bytes needs more chunks than a header can address")]
    TooManyChunks(u64),

    #[error("reassembled {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}
