//! Byte transforms applied around the transfer
//!
//! The sender runs [`ByteTransform::forward`] on the file before it is
//! chunked and the receiver runs [`ByteTransform::reverse`] on the
//! reassembled bytes; the engine and relay only ever see opaque bytes.
//!
//! A transform works on the whole file in memory. Identity transforms report
//! themselves through [`ByteTransform::is_identity`] so the sender can stream
//! the file from disk instead.

use std::io;

pub trait ByteTransform: Send + Sync {
    fn forward(&self, data: Vec<u8>) -> io::Result<Vec<u8>>;

    fn reverse(&self, data: Vec<u8>) -> io::Result<Vec<u8>>;

    /// True if `forward` and `reverse` return their input unchanged
    fn is_identity(&self) -> bool {
        false
    }
}

/// Leaves bytes untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl ByteTransform for Passthrough {
    fn forward(&self, data: Vec<u8>) -> io::Result<Vec<u8>> {
        Ok(data)
    }

    fn reverse(&self, data: Vec<u8>) -> io::Result<Vec<u8>> {
        Ok(data)
    }

    fn is_identity(&self) -> bool {
        true
    }
}
