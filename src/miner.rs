//! Proof-of-work admission for KVChain blocks
//!
//! A nonce is admitted when `SHA-256(canonical(operation) ‖ nonce)`, read as
//! an unsigned integer, leaves a remainder below `accepted_below` when divided
//! by `modulus`. With the default `{10, 3}` roughly 30% of draws succeed, so
//! this is a pacing knob rather than a security mechanism.
//!
//! The plain [`mine`] loop has no iteration cap. Hosts that need a deadline use
//! [`mine_cancellable`] or [`mine_with_deadline`].

use crate::blockchain::Block;
use crate::crypto::{digest_residue, sha256_concat, HashPointer, Sha256Hash};
use crate::error::{ChainError, Result};
use crate::operation::Operation;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const NONCE_LENGTH: usize = 10;

const NONCE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Admission predicate: `digest mod modulus < accepted_below`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Difficulty {
    pub modulus: u32,
    pub accepted_below: u32,
}

impl Default for Difficulty {
    fn default() -> Self {
        Difficulty {
            modulus: 10,
            accepted_below: 3,
        }
    }
}

impl Difficulty {
    pub fn new(modulus: u32, accepted_below: u32) -> Result<Self> {
        let difficulty = Difficulty {
            modulus,
            accepted_below,
        };
        difficulty.validate()?;
        Ok(difficulty)
    }

    pub fn validate(&self) -> Result<()> {
        if self.modulus == 0 {
            return Err(ChainError::ConfigError("difficulty modulus must be non-zero".to_string()));
        }
        if self.accepted_below == 0 || self.accepted_below > self.modulus {
            return Err(ChainError::ConfigError(format!(
                "accepted_below must be in 1..={}, got {}",
                self.modulus, self.accepted_below
            )));
        }
        Ok(())
    }

    pub fn accepts(&self, hash: &Sha256Hash) -> bool {
        self.modulus != 0 && digest_residue(hash, self.modulus) < self.accepted_below
    }

    /// Expected share of random draws that pass.
    pub fn acceptance_rate(&self) -> f64 {
        self.accepted_below as f64 / self.modulus as f64
    }
}

/// Fresh random token of ASCII letters.
pub fn generate_nonce(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| NONCE_ALPHABET[rng.gen_range(0..NONCE_ALPHABET.len())] as char)
        .collect()
}

pub fn nonce_digest(operation: &Operation, nonce: &str) -> Sha256Hash {
    sha256_concat(&[&operation.canonical_bytes(), nonce.as_bytes()])
}

pub fn is_valid_nonce(operation: &Operation, nonce: &str, difficulty: &Difficulty) -> bool {
    difficulty.accepts(&nonce_digest(operation, nonce))
}

/// `SHA-256(canonical(prev.operation) ‖ prev.nonce ‖ prev.hash_pointer?)`, or
/// `None` when there is no predecessor.
pub fn calculate_hash_pointer(predecessor: Option<&Block>) -> Option<HashPointer> {
    let prev = predecessor?;
    let operation_bytes = prev.operation.canonical_bytes();
    let digest = match &prev.hash_pointer {
        Some(pointer) => sha256_concat(&[&operation_bytes, prev.nonce.as_bytes(), pointer.as_bytes()]),
        None => sha256_concat(&[&operation_bytes, prev.nonce.as_bytes()]),
    };
    Some(HashPointer(digest))
}

/// Mine under the default difficulty.
pub fn mine(operation: &Operation, predecessor: Option<&Block>) -> (String, Option<HashPointer>) {
    mine_with(operation, predecessor, &Difficulty::default())
}

/// Draw nonces until one is admitted. Blocks the calling thread with no upper bound.
pub fn mine_with(
    operation: &Operation,
    predecessor: Option<&Block>,
    difficulty: &Difficulty,
) -> (String, Option<HashPointer>) {
    let encoded = operation.canonical_bytes();
    let mut attempts: u64 = 0;
    let (nonce, digest) = loop {
        attempts += 1;
        if let Some(found) = draw(&encoded, difficulty) {
            break found;
        }
    };
    log_found(operation, &nonce, &digest, attempts);
    (nonce, calculate_hash_pointer(predecessor))
}

/// Like [`mine_with`] but checks `stop` before every draw.
pub fn mine_cancellable(
    operation: &Operation,
    predecessor: Option<&Block>,
    difficulty: &Difficulty,
    stop: &AtomicBool,
) -> Result<(String, Option<HashPointer>)> {
    let encoded = operation.canonical_bytes();
    let mut attempts: u64 = 0;
    let (nonce, digest) = loop {
        if stop.load(Ordering::Relaxed) {
            debug!(attempts, "mining for {} cancelled", operation);
            return Err(ChainError::MiningCancelled);
        }
        attempts += 1;
        if let Some(found) = draw(&encoded, difficulty) {
            break found;
        }
    };
    log_found(operation, &nonce, &digest, attempts);
    Ok((nonce, calculate_hash_pointer(predecessor)))
}

fn draw(encoded_operation: &[u8], difficulty: &Difficulty) -> Option<(String, Sha256Hash)> {
    let nonce = generate_nonce(NONCE_LENGTH);
    let digest = sha256_concat(&[encoded_operation, nonce.as_bytes()]);
    difficulty.accepts(&digest).then_some((nonce, digest))
}

fn log_found(operation: &Operation, nonce: &str, digest: &Sha256Hash, attempts: u64) {
    debug!(
        attempts,
        "calculated nonce {} for {} (digest ..{})",
        nonce,
        operation,
        HashPointer(*digest).short()
    );
}

/// Mine on a blocking worker and give up once `deadline` elapses.
///
/// The worker is told to stop through a shared flag, so no CPU is burned after
/// the timeout is reported.
pub async fn mine_with_deadline(
    operation: Operation,
    predecessor: Option<Block>,
    difficulty: Difficulty,
    deadline: Duration,
) -> Result<(String, Option<HashPointer>)> {
    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = stop.clone();
    let worker = tokio::task::spawn_blocking(move || {
        mine_cancellable(&operation, predecessor.as_ref(), &difficulty, &worker_stop)
    });

    match tokio::time::timeout(deadline, worker).await {
        Ok(joined) => joined.map_err(|e| ChainError::WorkerFailed(e.to_string()))?,
        Err(_) => {
            stop.store(true, Ordering::SeqCst);
            Err(ChainError::MiningTimedOut(deadline))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::RequestId;

    #[test]
    fn test_mined_nonce_satisfies_predicate() {
        let op = Operation::put("x", "42");
        for _ in 0..20 {
            let (nonce, pointer) = mine(&op, None);
            assert_eq!(nonce.len(), NONCE_LENGTH);
            assert!(nonce.chars().all(|c| c.is_ascii_alphabetic()));
            assert!(digest_residue(&nonce_digest(&op, &nonce), 10) <= 2);
            assert!(pointer.is_none());
        }
    }

    #[test]
    fn test_hash_pointer_is_deterministic() {
        let genesis = Block::create(Operation::put("a", "1"), RequestId::new(1, 0), None);
        let first = calculate_hash_pointer(Some(&genesis));
        let second = calculate_hash_pointer(Some(&genesis));
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn test_hash_pointer_covers_predecessor_pointer() {
        let genesis = Block::create(Operation::put("a", "1"), RequestId::new(1, 0), None);
        let child = Block::create(Operation::put("b", "2"), RequestId::new(1, 1), Some(&genesis));

        let mut forged = child.clone();
        forged.hash_pointer = Some(HashPointer([7u8; 32]));
        assert_ne!(calculate_hash_pointer(Some(&child)), calculate_hash_pointer(Some(&forged)));
    }

    #[test]
    fn test_cancelled_before_first_draw() {
        let stop = AtomicBool::new(true);
        let result = mine_cancellable(&Operation::get("k"), None, &Difficulty::default(), &stop);
        assert!(matches!(result, Err(ChainError::MiningCancelled)));
    }

    #[test]
    fn test_difficulty_validation() {
        assert!(Difficulty::new(10, 3).is_ok());
        assert!(Difficulty::new(0, 0).is_err());
        assert!(Difficulty::new(10, 0).is_err());
        assert!(Difficulty::new(10, 11).is_err());
        assert!((Difficulty::default().acceptance_rate() - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_full_acceptance_admits_any_nonce() {
        let always = Difficulty::new(1, 1).unwrap();
        assert!(is_valid_nonce(&Operation::get("k"), "anything", &always));
    }

    #[tokio::test]
    async fn test_deadline_mining_succeeds() {
        let (nonce, _) = mine_with_deadline(
            Operation::put("k", "v"),
            None,
            Difficulty::default(),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert!(is_valid_nonce(&Operation::put("k", "v"), &nonce, &Difficulty::default()));
    }

    #[tokio::test]
    async fn test_deadline_mining_times_out() {
        // A residue below 1 out of u32::MAX is practically unreachable.
        let impossible = Difficulty::new(u32::MAX, 1).unwrap();
        let result = mine_with_deadline(Operation::get("k"), None, impossible, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ChainError::MiningTimedOut(_))));
    }
}
