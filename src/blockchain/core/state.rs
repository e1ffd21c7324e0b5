use crate::crypto::{sha256_concat, Sha256Hash};
use crate::error::{ChainError, Result};
use crate::operation::{OpKind, Operation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::chain::Blockchain;

/// Which blocks a replay observes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Every block, tentative ones included.
    #[default]
    Speculative,
    /// Only the decided prefix `[0, depth)`.
    Committed,
}

/// Key-value mapping derived by replaying a chain. Never persisted on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvStore {
    entries: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Result<&str> {
        self.entries
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ChainError::KeyNotFound(key.to_string()))
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn apply_operation(&mut self, operation: &Operation) -> Result<()> {
        match &operation.kind {
            OpKind::Put => {
                let value = operation.value.as_ref().ok_or_else(|| {
                    ChainError::InvalidOperation(format!("put for key {} carries no value", operation.key))
                })?;
                self.put(operation.key.clone(), value.clone());
            }
            OpKind::Get => {}
            OpKind::Other(kind) => {
                return Err(ChainError::InvalidOperation(format!(
                    "Invalid operation type: {}",
                    kind
                )));
            }
        }
        Ok(())
    }

    /// Digest over the entries in key order, for comparing two replays.
    pub fn state_digest(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        for (key, value) in &self.entries {
            hasher.update(sha256_concat(&[
                &(key.len() as u32).to_le_bytes(),
                key.as_bytes(),
                &(value.len() as u32).to_le_bytes(),
                value.as_bytes(),
            ]));
        }
        hasher.finalize().into()
    }
}

impl Blockchain {
    /// Replay every block, tentative ones included.
    pub fn generate(&self) -> Result<KvStore> {
        self.generate_with(Visibility::Speculative)
    }

    pub fn generate_with(&self, visibility: Visibility) -> Result<KvStore> {
        let replayed = match visibility {
            Visibility::Speculative => self.blocks(),
            Visibility::Committed => self.committed()?,
        };

        let mut store = KvStore::new();
        for block in replayed {
            store.apply_operation(&block.operation)?;
        }
        Ok(store)
    }
}
