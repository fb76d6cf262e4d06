//! Cryptographic utilities
//!
//! This module provides:
//! - SHA-256 / double SHA-256 digests and the proof-of-work target check
//! - ECDSA key management and addresses (secp256k1)
//! - The merkle commitment over block transactions

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{double_sha256, double_sha256_hex, meets_target, sha256, sha256_hex};
pub use keys::{
    address_from_public_key, public_key_to_address, sign_message, verify_signature, KeyError,
    KeyPair,
};
pub use merkle::{compute_root, MerkleNode};
