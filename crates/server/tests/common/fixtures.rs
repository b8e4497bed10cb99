//! Test data.

use bytes::Bytes;
use ferry_core::ChunkHash;

/// Deterministic test data: the same seed and length always give the same bytes.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut state = seed ^ 0x9e37_79b9_7f4a_7c15;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 56) as u8
        })
        .collect::<Vec<u8>>()
        .into()
}

/// The `X-Chunk-Hash` value for `data`.
#[allow(dead_code)]
pub fn chunk_hash_hex(data: &[u8]) -> String {
    ChunkHash::compute(data).to_hex()
}
