//! Chunk identity and the fixed-size chunk layout of a file.

use crate::hash::ContentHash;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A chunk hash (SHA-256 of chunk contents).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkHash(ContentHash);

impl ChunkHash {
    pub fn from_content_hash(hash: ContentHash) -> Self {
        Self(hash)
    }

    /// Compute the hash of chunk data.
    pub fn compute(data: &[u8]) -> Self {
        Self(ContentHash::compute(data))
    }

    pub fn content_hash(&self) -> &ContentHash {
        &self.0
    }

    pub fn from_hex(s: &str) -> crate::Result<Self> {
        Ok(Self(ContentHash::from_hex(s)?))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// Object store key for this chunk's blob.
    ///
    /// Fanned out by the first byte so no single directory grows unbounded.
    pub fn to_object_key(&self) -> String {
        let hex = self.to_hex();
        format!("chunks/{}/{}", &hex[..2], hex)
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// One chunk produced by the chunker: its position, hash and bytes.
#[derive(Clone)]
pub struct Chunk {
    /// Position within the file (0-indexed).
    pub index: u64,
    /// The chunk hash (computed from data).
    pub hash: ChunkHash,
    pub data: Bytes,
}

impl Chunk {
    /// Create a chunk from data, computing the hash.
    pub fn new(index: u64, data: Bytes) -> Self {
        let hash = ChunkHash::compute(&data);
        Self { index, hash, data }
    }

    /// Check that `data` hashes to `expected`.
    pub fn verify(data: &[u8], expected: &ChunkHash) -> crate::Result<()> {
        let actual = ChunkHash::compute(data);
        if &actual != expected {
            return Err(crate::Error::HashMismatch {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("index", &self.index)
            .field("hash", &self.hash)
            .field("size", &self.data.len())
            .finish()
    }
}

/// Fixed-size chunk layout of a file of `total_size` bytes.
///
/// Every chunk except the last is exactly `chunk_size` bytes; the last holds the
/// remainder. Byte offsets are therefore derivable from chunk indices alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    pub total_size: u64,
    pub chunk_size: u64,
}

impl ChunkPlan {
    pub fn new(total_size: u64, chunk_size: u64) -> crate::Result<Self> {
        if chunk_size == 0 {
            return Err(crate::Error::BadInput(
                "chunk size must be at least 1 byte".to_string(),
            ));
        }
        Ok(Self {
            total_size,
            chunk_size,
        })
    }

    /// Number of chunks in the file. An empty file has none.
    pub fn chunk_count(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size)
    }

    /// Byte offset where chunk `index` starts.
    pub fn offset(&self, index: u64) -> u64 {
        index.saturating_mul(self.chunk_size).min(self.total_size)
    }

    /// Exact size chunk `index` must have, or `None` past the end.
    pub fn expected_len(&self, index: u64) -> Option<u64> {
        if index >= self.chunk_count() {
            return None;
        }
        let start = self.offset(index);
        Some((self.total_size - start).min(self.chunk_size))
    }

    /// Index of the chunk containing byte `offset`.
    pub fn index_of(&self, offset: u64) -> u64 {
        offset / self.chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_chunk_hash_object_key() {
        let hash = ChunkHash::compute(b"test");
        let key = hash.to_object_key();
        let parts: Vec<_> = key.split('/').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "chunks");
        assert_eq!(parts[1], &hash.to_hex()[..2]);
        assert_eq!(parts[2].len(), 64);
    }

    #[test]
    fn test_verify_reports_both_hashes() {
        let expected = ChunkHash::compute(b"right");
        let err = Chunk::verify(b"wrong", &expected).unwrap_err();
        match err {
            crate::Error::HashMismatch { expected: e, actual } => {
                assert_eq!(e, expected.to_hex());
                assert_eq!(actual, ChunkHash::compute(b"wrong").to_hex());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(Chunk::verify(b"right", &expected).is_ok());
    }

    #[test]
    fn test_plan_three_and_a_half_mib() {
        let plan = ChunkPlan::new(3 * MIB + MIB / 2, MIB).unwrap();
        assert_eq!(plan.chunk_count(), 4);
        assert_eq!(plan.expected_len(0), Some(MIB));
        assert_eq!(plan.expected_len(2), Some(MIB));
        assert_eq!(plan.expected_len(3), Some(MIB / 2));
        assert_eq!(plan.expected_len(4), None);
        assert_eq!(plan.offset(2), 2 * MIB);
        assert_eq!(plan.offset(9), plan.total_size);
        assert_eq!(plan.index_of(1_048_570), 0);
        assert_eq!(plan.index_of(1_048_580), 1);
    }

    #[test]
    fn test_plan_edges() {
        let empty = ChunkPlan::new(0, 64).unwrap();
        assert_eq!(empty.chunk_count(), 0);
        assert_eq!(empty.expected_len(0), None);

        let exact = ChunkPlan::new(128, 64).unwrap();
        assert_eq!(exact.chunk_count(), 2);
        assert_eq!(exact.expected_len(1), Some(64));

        assert!(ChunkPlan::new(10, 0).is_err());
    }
}
