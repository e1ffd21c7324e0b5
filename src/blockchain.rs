// Thin re-export module: implementation is in `blockchain/core.rs`, split into
// chain management, derived state and integrity validation.

pub mod core;
pub use core::*;
