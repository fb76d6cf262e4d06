//! Hashing primitives
//!
//! Block ids, transaction ids, merkle nodes and spend messages are all
//! double SHA-256 digests; ids are carried around as lowercase hex.

use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Computes SHA-256 hash and returns it as a hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
pub fn double_sha256(data: &[u8]) -> Vec<u8> {
    sha256(&sha256(data))
}

/// Computes double SHA-256 hash and returns it as a hex string
pub fn double_sha256_hex(data: &[u8]) -> String {
    hex::encode(double_sha256(data))
}

/// Checks that the first `zero_bits` bits of `hash` are zero
pub fn has_leading_zero_bits(hash: &[u8], zero_bits: u32) -> bool {
    let full_bytes = zero_bits as usize / 8;
    let remaining_bits = zero_bits as usize % 8;

    if hash.len() < full_bytes {
        return false;
    }
    if hash.iter().take(full_bytes).any(|byte| *byte != 0) {
        return false;
    }

    if remaining_bits > 0 {
        match hash.get(full_bytes) {
            Some(byte) => byte & (0xFFu8 << (8 - remaining_bits)) == 0,
            None => false,
        }
    } else {
        true
    }
}

/// Proof-of-work check: the digest, read as a big-endian integer, must be
/// below `2^(255 - bits)`
pub fn meets_target(hash: &[u8], bits: u8) -> bool {
    has_leading_zero_bits(hash, bits as u32 + 1)
}
