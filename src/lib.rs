//! KVChain - a proof-of-work admitted log backing a replicated key-value store
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Log
//! - [`blockchain`] - Blocks, the accept/decide state machine, derived state and validation
//! - [`operation`] - Operations carried by blocks
//!
//! ## Admission
//! - [`miner`] - Proof-of-work nonce search and hash-pointer chaining
//! - [`crypto`] - Digest helpers
//!
//! ## State Management
//! - [`persistence`] - File, SQLite and in-memory stores
//! - [`node`] - Single-owner actor that serializes chain mutations
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Log
// ============================================================================
pub mod blockchain;
pub mod operation;

// ============================================================================
// Admission
// ============================================================================
pub mod crypto;
pub mod miner;

// ============================================================================
// State Management
// ============================================================================
pub mod node;
pub mod persistence;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;

pub use blockchain::{Block, BlockStatus, Blockchain, KvStore, Outcome, RequestId, Visibility};
pub use error::{ChainError, Result};
pub use operation::{OpKind, Operation};
