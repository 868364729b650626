//! Chunk framing for file payloads
//!
//! A file is streamed as `N = max(1, ceil(size / C))` binary frames. Each frame
//! carries a fixed header `{index, total_chunks, length, flags}`; the final
//! frame additionally ends with the 8-byte [`SENTINEL`]. Because the payload
//! extent comes from the header, file contents can never be mistaken for the
//! end-of-stream marker.

mod error;
mod frame;
mod reassembler;

pub use error::ChunkError;
pub use frame::{ChunkHeader, decode_frame, encode_frame};
pub use reassembler::{Reassembled, Reassembler};

/// End-of-stream marker appended after the final payload
pub const SENTINEL: &[u8; 8] = b"FILE_END";

/// Size of the fixed frame header in bytes
pub const HEADER_LEN: usize = 13;

/// Flag bit marking the final frame
pub const FINAL_FLAG: u8 = 0x01;

/// Default chunk capacity (1 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest chunk capacity a frame may carry (16 MiB)
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Largest progress value reported before the final frame
const NON_FINAL_PROGRESS_CEILING: f64 = 1.0 - f64::EPSILON;

/// Largest frame on the wire for a given chunk capacity
pub const fn max_frame_len(capacity: usize) -> usize {
    HEADER_LEN + capacity + SENTINEL.len()
}

/// Number of frames needed for `total_size` bytes at `capacity` bytes per chunk
///
/// Always at least 1: an empty file is sent as a single empty final frame.
///
/// # Errors
///
/// Returns an error if `capacity` is zero or exceeds [`MAX_CHUNK_SIZE`], or
/// if the count does not fit in the header's 32-bit field.
pub fn chunk_count(total_size: u64, capacity: usize) -> Result<u32, ChunkError> {
    if capacity == 0 || capacity > MAX_CHUNK_SIZE {
        return Err(ChunkError::PayloadTooLarge(capacity));
    }
    let count = total_size.div_ceil(capacity as u64).max(1);
    u32::try_from(count).map_err(|_| ChunkError::TooManyChunks(total_size))
}

/// Progress for `bytes` of `total` transferred
///
/// Exactly `1.0` only when `is_final` is set; otherwise the ratio is clamped
/// strictly below `1.0` (and is `0.0` for an empty stream).
pub fn progress_fraction(bytes: u64, total: u64, is_final: bool) -> f64 {
    if is_final {
        return 1.0;
    }
    if total == 0 {
        return 0.0;
    }
    (bytes as f64 / total as f64).min(NON_FINAL_PROGRESS_CEILING)
}
