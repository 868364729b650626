//! SHA-256 checksums for transfer outcomes
//!
//! Both ends hash the plaintext bytes they handled so the outcome recorded by
//! each side can be compared. The sender hashes incrementally while streaming;
//! the receiver hashes the reassembled buffer once.

use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest
pub const SHA256_HEX_LENGTH: usize = 64;

/// Incremental SHA-256 over streamed chunks
#[derive(Clone, Default)]
pub struct Checksum {
    hasher: Sha256,
    bytes: u64,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next slice of the stream
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes hashed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Consume the hasher and return the lowercase hex digest
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Hex-encoded SHA-256 of a complete buffer
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_hash() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_known_hash() {
        // SHA-256 of "hello world"
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut checksum = Checksum::new();
        checksum.update(b"hello");
        checksum.update(b" ");
        checksum.update(b"world");
        assert_eq!(checksum.bytes(), 11);
        let digest = checksum.finish();
        assert_eq!(digest, sha256_hex(b"hello world"));
        assert_eq!(digest.len(), SHA256_HEX_LENGTH);
    }
}
