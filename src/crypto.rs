//! Digest primitives for KVChain

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub type Sha256Hash = [u8; 32];

/// Number of trailing hex characters shown by [`HashPointer::short`].
pub const SHORT_HASH_LEN: usize = 10;

/// Full SHA-256 digest linking a block to its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HashPointer(pub Sha256Hash);

impl HashPointer {
    pub fn as_bytes(&self) -> &Sha256Hash {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated form for logs and terminal output. Never compare these.
    pub fn short(&self) -> String {
        let full = self.to_hex();
        full[full.len() - SHORT_HASH_LEN..].to_string()
    }

    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let bytes = hex::decode(hex_str).ok()?;
        let hash: Sha256Hash = bytes.try_into().ok()?;
        Some(HashPointer(hash))
    }
}

impl fmt::Display for HashPointer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// SHA-256 over the concatenation of `parts`.
pub fn sha256_concat(parts: &[&[u8]]) -> Sha256Hash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Remainder of the digest, read as a big-endian unsigned integer, modulo `modulus`.
pub fn digest_residue(hash: &Sha256Hash, modulus: u32) -> u32 {
    let modulus = modulus as u64;
    hash.iter()
        .fold(0u64, |acc, byte| (acc * 256 + *byte as u64) % modulus) as u32
}
