use crate::crypto::HashPointer;
use crate::error::{ChainError, Result};
use crate::miner::{calculate_hash_pointer, is_valid_nonce, mine_with, Difficulty};
use crate::operation::Operation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use tracing::{debug, info, warn};

/// Identifier of the client request a block was proposed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId {
    pub client_id: u64,
    pub sequence: u64,
}

impl RequestId {
    pub fn new(client_id: u64, sequence: u64) -> Self {
        RequestId { client_id, sequence }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.client_id, self.sequence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockStatus {
    Tentative,
    Decided,
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockStatus::Tentative => write!(f, "tentative"),
            BlockStatus::Decided => write!(f, "decided"),
        }
    }
}

/// One log entry.
///
/// Equality and hashing cover the operation, hash pointer, nonce and request
/// id, not the status: a tentative block equals its decided copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub operation: Operation,
    pub nonce: String,
    pub hash_pointer: Option<HashPointer>,
    pub request_id: RequestId,
    pub status: BlockStatus,
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.operation == other.operation
            && self.hash_pointer == other.hash_pointer
            && self.nonce == other.nonce
            && self.request_id == other.request_id
    }
}

impl Eq for Block {}

impl Hash for Block {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.operation.hash(state);
        self.hash_pointer.hash(state);
        self.nonce.hash(state);
        self.request_id.hash(state);
    }
}

impl Block {
    /// Mine a tentative block under the default difficulty.
    ///
    /// Runs the unbounded proof-of-work loop on the calling thread.
    pub fn create(operation: Operation, request_id: RequestId, predecessor: Option<&Block>) -> Self {
        Self::create_with(operation, request_id, predecessor, &Difficulty::default())
    }

    pub fn create_with(
        operation: Operation,
        request_id: RequestId,
        predecessor: Option<&Block>,
        difficulty: &Difficulty,
    ) -> Self {
        let (nonce, hash_pointer) = mine_with(&operation, predecessor, difficulty);
        Block::from_parts(operation, nonce, hash_pointer, request_id, BlockStatus::Tentative)
    }

    pub fn from_parts(
        operation: Operation,
        nonce: String,
        hash_pointer: Option<HashPointer>,
        request_id: RequestId,
        status: BlockStatus,
    ) -> Self {
        Block {
            operation,
            nonce,
            hash_pointer,
            request_id,
            status,
        }
    }

    pub fn is_decided(&self) -> bool {
        self.status == BlockStatus::Decided
    }

    pub fn has_valid_nonce(&self, difficulty: &Difficulty) -> bool {
        is_valid_nonce(&self.operation, &self.nonce, difficulty)
    }

    /// Whether this block's hash pointer is the one derived from `predecessor`.
    pub fn links_to(&self, predecessor: Option<&Block>) -> bool {
        self.hash_pointer == calculate_hash_pointer(predecessor)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let pointer = self
            .hash_pointer
            .map(|p| format!("..{}", p.short()))
            .unwrap_or_else(|| "genesis".to_string());
        write!(
            f,
            "Block({}, {}, {}, {}, {})",
            self.operation, self.nonce, pointer, self.request_id, self.status
        )
    }
}

/// Result of an accept or decide call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// The request id was already handled; nothing changed.
    Duplicate,
}

/// Ordered log of blocks with a two-phase accept/decide discipline.
///
/// `depth` counts the contiguous decided prefix. Slots at or beyond `depth`
/// hold tentative blocks that a later accept may replace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blockchain {
    blocks: Vec<Block>,
    depth: usize,
    last_accepted_request_id: Option<RequestId>,
    last_decided_request_id: Option<RequestId>,
    difficulty: Difficulty,
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

impl Blockchain {
    pub fn new() -> Self {
        Self::with_difficulty(Difficulty::default())
    }

    pub fn with_difficulty(difficulty: Difficulty) -> Self {
        Blockchain {
            blocks: Vec::new(),
            depth: 0,
            last_accepted_request_id: None,
            last_decided_request_id: None,
            difficulty,
        }
    }

    /// Rebuild a chain from stored parts, e.g. by a persistence backend.
    pub(crate) fn from_parts(
        blocks: Vec<Block>,
        depth: usize,
        last_accepted_request_id: Option<RequestId>,
        last_decided_request_id: Option<RequestId>,
        difficulty: Difficulty,
    ) -> Self {
        Blockchain {
            blocks,
            depth,
            last_accepted_request_id,
            last_decided_request_id,
            difficulty,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn get(&self, index: usize) -> Option<&Block> {
        self.blocks.get(index)
    }

    /// Last block in the log, decided or not.
    pub fn tip(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn difficulty(&self) -> &Difficulty {
        &self.difficulty
    }

    pub fn last_accepted_request_id(&self) -> Option<RequestId> {
        self.last_accepted_request_id
    }

    pub fn last_decided_request_id(&self) -> Option<RequestId> {
        self.last_decided_request_id
    }

    /// The decided prefix `[0, depth)`.
    pub fn committed(&self) -> Result<&[Block]> {
        self.blocks.get(..self.depth).ok_or_else(|| {
            ChainError::ConsistencyViolation(format!(
                "depth {} exceeds chain length {}",
                self.depth,
                self.blocks.len()
            ))
        })
    }

    /// Slot a new proposal should target: `depth`, provided no undecided
    /// blocks sit after it.
    pub fn next_open_slot(&self) -> Result<usize> {
        if self.blocks.len() != self.depth {
            return Err(ChainError::ConsistencyViolation(format!(
                "chain ends in {} undecided block(s) after depth {}; decide or replace them first",
                self.blocks.len().saturating_sub(self.depth),
                self.depth
            )));
        }
        Ok(self.depth)
    }

    /// Structural checks for a chain that was not built through accept/decide.
    pub(crate) fn check_loaded(&self) -> Result<()> {
        if let Some(index) = self.committed()?.iter().position(|b| !b.is_decided()) {
            return Err(ChainError::ConsistencyViolation(format!(
                "block {} lies below depth {} but is not decided",
                index, self.depth
            )));
        }
        Ok(())
    }

    /// Push a block to the end without duplicate suppression or validation.
    ///
    /// Used when loading or replaying a log. A decided block landing exactly at
    /// `depth` extends the decided prefix.
    pub fn append(&mut self, block: Block) {
        if block.is_decided() && self.blocks.len() == self.depth {
            self.depth += 1;
        }
        self.blocks.push(block);
    }

    /// Record `block` as the provisional occupant of slot `index`.
    pub fn accept(&mut self, block: Block, index: usize) -> Result<Outcome> {
        if Some(block.request_id) == self.last_accepted_request_id
            || Some(block.request_id) == self.last_decided_request_id
        {
            debug!("ignoring accept of already handled request {}", block.request_id);
            return Ok(Outcome::Duplicate);
        }

        if index > self.blocks.len() {
            return Err(self.reject(format!(
                "cannot accept at index {} past the end of a chain of length {}",
                index,
                self.blocks.len()
            )));
        }
        if index < self.depth {
            return Err(self.reject(format!(
                "slot {} is already decided (depth {})",
                index, self.depth
            )));
        }
        self.check_admissible(&block, index)?;

        debug!("accepted {} at index {}", block, index);
        let request_id = block.request_id;
        if index == self.blocks.len() {
            self.blocks.push(block);
        } else {
            self.blocks[index] = block;
        }
        self.last_accepted_request_id = Some(request_id);
        Ok(Outcome::Applied)
    }

    /// Commit `block` at slot `index`, which must be the next undecided slot.
    pub fn decide(&mut self, mut block: Block, index: usize) -> Result<Outcome> {
        if Some(block.request_id) == self.last_decided_request_id {
            debug!("ignoring decide of already decided request {}", block.request_id);
            return Ok(Outcome::Duplicate);
        }

        if index >= self.blocks.len() {
            return Err(self.reject(format!(
                "cannot decide unaccepted slot {} (chain length {})",
                index,
                self.blocks.len()
            )));
        }
        if index != self.depth {
            return Err(self.reject(format!(
                "decide at index {} out of order; next undecided slot is {}",
                index, self.depth
            )));
        }
        self.check_admissible(&block, index)?;

        block.status = BlockStatus::Decided;
        info!("decided {} at index {}", block, index);
        self.last_decided_request_id = Some(block.request_id);
        self.blocks[index] = block;
        self.depth += 1;
        Ok(Outcome::Applied)
    }

    /// Nonce must pass admission and the hash pointer must chain to slot `index - 1`.
    fn check_admissible(&self, block: &Block, index: usize) -> Result<()> {
        if !block.has_valid_nonce(&self.difficulty) {
            warn!("rejecting {}: nonce fails admission", block);
            return Err(ChainError::InvalidProofOfWork(format!(
                "nonce {} does not satisfy the admission predicate for {}",
                block.nonce, block.operation
            )));
        }

        let predecessor = index.checked_sub(1).and_then(|i| self.blocks.get(i));
        if !block.links_to(predecessor) {
            warn!("rejecting {}: hash pointer does not chain to slot {}", block, index);
            return Err(ChainError::InvalidBlockLinkage(format!(
                "hash pointer of block for request {} does not chain to its predecessor at index {}",
                block.request_id, index
            )));
        }
        Ok(())
    }

    fn reject(&self, message: String) -> ChainError {
        warn!("{}", message);
        ChainError::ConsistencyViolation(message)
    }

    /// Load a chain snapshot from `path`; a missing file yields an empty chain.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        crate::persistence::read(path)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        crate::persistence::write(path, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_after(chain: &Blockchain, op: Operation, client: u64, seq: u64) -> Block {
        Block::create(op, RequestId::new(client, seq), chain.tip())
    }

    #[test]
    fn test_accept_then_decide() {
        let mut chain = Blockchain::new();
        let block = block_after(&chain, Operation::put("x", "42"), 1, 1);

        assert_eq!(chain.accept(block.clone(), 0).unwrap(), Outcome::Applied);
        assert_eq!(chain.depth(), 0);
        assert_eq!(chain.get(0).unwrap().status, BlockStatus::Tentative);

        assert_eq!(chain.decide(block, 0).unwrap(), Outcome::Applied);
        assert_eq!(chain.depth(), 1);
        assert!(chain.get(0).unwrap().is_decided());
        assert_eq!(chain.last_decided_request_id(), Some(RequestId::new(1, 1)));
    }

    #[test]
    fn test_duplicate_accept_is_noop() {
        let mut chain = Blockchain::new();
        let block = block_after(&chain, Operation::put("x", "1"), 1, 1);
        chain.accept(block.clone(), 0).unwrap();
        let before = chain.clone();

        assert_eq!(chain.accept(block, 0).unwrap(), Outcome::Duplicate);
        assert_eq!(chain, before);
    }

    #[test]
    fn test_duplicate_decide_is_noop() {
        let mut chain = Blockchain::new();
        let block = block_after(&chain, Operation::put("x", "1"), 1, 1);
        chain.accept(block.clone(), 0).unwrap();
        chain.decide(block.clone(), 0).unwrap();
        let before = chain.clone();

        assert_eq!(chain.decide(block.clone(), 0).unwrap(), Outcome::Duplicate);
        // accept of a decided request id is suppressed too
        assert_eq!(chain.accept(block, 1).unwrap(), Outcome::Duplicate);
        assert_eq!(chain, before);
        assert_eq!(chain.depth(), 1);
    }

    #[test]
    fn test_reproposal_overwrites_tentative_slot() {
        let mut chain = Blockchain::new();
        let first = block_after(&chain, Operation::put("x", "1"), 1, 1);
        let second = Block::create(Operation::put("x", "2"), RequestId::new(2, 1), None);

        chain.accept(first, 0).unwrap();
        chain.accept(second.clone(), 0).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.get(0), Some(&second));
        assert_eq!(chain.last_accepted_request_id(), Some(RequestId::new(2, 1)));
    }

    #[test]
    fn test_decide_unaccepted_slot_fails() {
        let mut chain = Blockchain::new();
        let block = block_after(&chain, Operation::put("x", "1"), 1, 1);
        let err = chain.decide(block, 0).unwrap_err();
        assert!(matches!(err, ChainError::ConsistencyViolation(_)));
        assert_eq!(chain.depth(), 0);
        assert!(chain.is_empty());
    }

    #[test]
    fn test_decide_out_of_order_fails() {
        let mut chain = Blockchain::new();
        let a = block_after(&chain, Operation::put("a", "1"), 1, 1);
        chain.accept(a.clone(), 0).unwrap();
        let b = Block::create(Operation::put("b", "2"), RequestId::new(1, 2), Some(&a));
        chain.accept(b.clone(), 1).unwrap();

        let err = chain.decide(b, 1).unwrap_err();
        assert!(matches!(err, ChainError::ConsistencyViolation(_)));
        assert_eq!(chain.depth(), 0);
        assert_eq!(chain.last_decided_request_id(), None);
    }

    #[test]
    fn test_accept_past_end_fails() {
        let mut chain = Blockchain::new();
        let block = block_after(&chain, Operation::put("x", "1"), 1, 1);
        assert!(matches!(
            chain.accept(block, 3),
            Err(ChainError::ConsistencyViolation(_))
        ));
        assert_eq!(chain.last_accepted_request_id(), None);
    }

    #[test]
    fn test_accept_cannot_overwrite_decided_slot() {
        let mut chain = Blockchain::new();
        let a = block_after(&chain, Operation::put("a", "1"), 1, 1);
        chain.accept(a.clone(), 0).unwrap();
        chain.decide(a, 0).unwrap();

        let intruder = Block::create(Operation::put("a", "evil"), RequestId::new(9, 9), None);
        assert!(matches!(
            chain.accept(intruder, 0),
            Err(ChainError::ConsistencyViolation(_))
        ));
        assert_eq!(chain.get(0).unwrap().operation, Operation::put("a", "1"));
    }

    #[test]
    fn test_accept_rejects_bad_nonce() {
        let mut chain = Blockchain::new();
        let op = Operation::put("x", "1");
        let bad_nonce = (0..)
            .map(|i| format!("n{}", i))
            .find(|n| !is_valid_nonce(&op, n, &Difficulty::default()))
            .unwrap();
        let block = Block::from_parts(op, bad_nonce, None, RequestId::new(1, 1), BlockStatus::Tentative);

        assert!(matches!(chain.accept(block, 0), Err(ChainError::InvalidProofOfWork(_))));
        assert!(chain.is_empty());
    }

    #[test]
    fn test_accept_rejects_broken_linkage() {
        let mut chain = Blockchain::new();
        let a = block_after(&chain, Operation::put("a", "1"), 1, 1);
        chain.accept(a, 0).unwrap();

        // Mined as if it were genesis, so it carries no pointer.
        let orphan = Block::create(Operation::put("b", "2"), RequestId::new(1, 2), None);
        assert!(matches!(chain.accept(orphan, 1), Err(ChainError::InvalidBlockLinkage(_))));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_k_decides_give_depth_k() {
        let mut chain = Blockchain::new();
        for seq in 0..5u64 {
            let block = block_after(&chain, Operation::put(format!("k{}", seq), seq.to_string()), 1, seq);
            let index = chain.len();
            chain.accept(block.clone(), index).unwrap();
            chain.decide(block, index).unwrap();
        }
        assert_eq!(chain.depth(), 5);
        assert!(chain.blocks()[..chain.depth()].iter().all(Block::is_decided));
    }

    #[test]
    fn test_append_tracks_decided_prefix() {
        let mut chain = Blockchain::new();
        let mut a = Block::create(Operation::put("a", "1"), RequestId::new(1, 1), None);
        a.status = BlockStatus::Decided;
        let b = Block::create(Operation::put("b", "2"), RequestId::new(1, 2), Some(&a));
        let mut c = Block::create(Operation::put("c", "3"), RequestId::new(1, 3), Some(&b));
        c.status = BlockStatus::Decided;

        chain.append(a);
        chain.append(b);
        chain.append(c);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.depth(), 1);
        assert_eq!(chain.last_accepted_request_id(), None);
    }

    #[test]
    fn test_next_open_slot_requires_fully_decided_chain() {
        let mut chain = Blockchain::new();
        assert_eq!(chain.next_open_slot().unwrap(), 0);

        let a = block_after(&chain, Operation::put("x", "1"), 1, 1);
        chain.accept(a.clone(), 0).unwrap();
        assert!(matches!(
            chain.next_open_slot(),
            Err(ChainError::ConsistencyViolation(_))
        ));

        chain.decide(a, 0).unwrap();
        assert_eq!(chain.next_open_slot().unwrap(), 1);
    }

    #[test]
    fn test_block_equality_ignores_status() {
        let block = Block::create(Operation::get("k"), RequestId::new(1, 1), None);
        let mut decided = block.clone();
        decided.status = BlockStatus::Decided;
        assert_eq!(block, decided);

        let mut set = std::collections::HashSet::new();
        set.insert(block);
        assert!(set.contains(&decided));
    }
}
