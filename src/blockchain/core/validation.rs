use crate::crypto::HashPointer;
use crate::error::ChainError;
use crate::miner::calculate_hash_pointer;
use std::collections::HashMap;

use super::chain::{Block, Blockchain};

/// Rebuild the pointer each block should carry from its predecessor.
pub fn recompute_hash_pointers(blocks: &[Block]) -> Vec<Option<HashPointer>> {
    let mut pointers = Vec::with_capacity(blocks.len());
    let mut predecessor: Option<&Block> = None;
    for block in blocks {
        pointers.push(calculate_hash_pointer(predecessor));
        predecessor = Some(block);
    }
    pointers
}

/// Check every nonce, every hash pointer and the decided prefix.
pub fn validate_chain(chain: &Blockchain) -> Result<(), ChainError> {
    let expected = recompute_hash_pointers(chain.blocks());

    for (index, (block, pointer)) in chain.blocks().iter().zip(expected).enumerate() {
        if !block.has_valid_nonce(chain.difficulty()) {
            return Err(ChainError::InvalidProofOfWork(format!(
                "block {} nonce {} fails admission",
                index, block.nonce
            )));
        }
        if block.hash_pointer != pointer {
            return Err(ChainError::InvalidBlockLinkage(format!(
                "block {} hash pointer {} does not match recomputed {}",
                index,
                display_pointer(block.hash_pointer),
                display_pointer(pointer)
            )));
        }
    }

    chain.check_loaded()
}

/// A request id may occupy at most one decided slot.
pub fn validate_no_duplicate_requests(chain: &Blockchain) -> Result<(), ChainError> {
    let mut seen = HashMap::new();
    for (index, block) in chain.blocks().iter().enumerate().filter(|(_, b)| b.is_decided()) {
        if let Some(first) = seen.insert(block.request_id, index) {
            return Err(ChainError::ConsistencyViolation(format!(
                "request {} decided at both index {} and {}",
                block.request_id, first, index
            )));
        }
    }
    Ok(())
}

fn display_pointer(pointer: Option<HashPointer>) -> String {
    pointer.map(|p| p.short()).unwrap_or_else(|| "none".to_string())
}
