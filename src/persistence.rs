//! Persistence layer for KVChain
//!
//! The chain is saved and loaded as a whole. A missing store loads as an empty
//! chain; every other failure is returned to the caller.

use crate::blockchain::{Block, BlockStatus, Blockchain, RequestId};
use crate::crypto::HashPointer;
use crate::error::{ChainError, Result};
use crate::miner::Difficulty;
use crate::operation::Operation;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Abstraction for persistence backends. Saving must be atomic from a
/// reader's point of view.
pub trait Persistence: Send + Sync {
    fn load_blockchain(&self) -> Result<Blockchain>;
    fn save_blockchain(&self, chain: &Blockchain) -> Result<()>;
}

/// Load the bincode snapshot at `path`, or an empty chain if there is none.
pub fn read(path: impl AsRef<Path>) -> Result<Blockchain> {
    let path = path.as_ref();
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!("no chain at {}, starting empty", path.display());
            return Ok(Blockchain::new());
        }
        Err(e) => return Err(e.into()),
    };
    let chain: Blockchain = bincode::deserialize(&bytes)?;
    chain.check_loaded()?;
    debug!("loaded {} blocks (depth {}) from {}", chain.len(), chain.depth(), path.display());
    Ok(chain)
}

/// Replace the snapshot at `path` with `chain`.
///
/// Written to a temporary file in the same directory, synced, then renamed
/// over the target so readers see either the old or the new snapshot.
pub fn write(path: impl AsRef<Path>, chain: &Blockchain) -> Result<()> {
    let path = path.as_ref();
    let bytes = bincode::serialize(chain)?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(&bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| ChainError::IoError(e.error))?;

    debug!("wrote {} blocks ({} bytes) to {}", chain.len(), bytes.len(), path.display());
    Ok(())
}

/// Whole-chain bincode snapshot on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Persistence for FileStore {
    fn load_blockchain(&self) -> Result<Blockchain> {
        read(&self.path)
    }

    fn save_blockchain(&self, chain: &Blockchain) -> Result<()> {
        write(&self.path, chain)
    }
}

/// SQLite-backed store: one row per block plus a metadata table.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                idx INTEGER PRIMARY KEY,
                operation TEXT NOT NULL,
                nonce TEXT NOT NULL,
                hash_pointer BLOB,
                client_id INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                status TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create blocks table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create metadata table: {}", e)))?;

        Ok(Database { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }

    /// Replace every stored row inside a single SQL transaction.
    pub fn save_blockchain(&self, chain: &Blockchain) -> Result<()> {
        let conn_guard = self.lock()?;
        let tx = conn_guard.unchecked_transaction()?;

        tx.execute("DELETE FROM blocks", [])?;
        for (index, block) in chain.blocks().iter().enumerate() {
            tx.execute(
                "INSERT INTO blocks (idx, operation, nonce, hash_pointer, client_id, sequence, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    index as i64,
                    serde_json::to_string(&block.operation)?,
                    block.nonce,
                    block.hash_pointer.map(|p| p.as_bytes().to_vec()),
                    block.request_id.client_id as i64,
                    block.request_id.sequence as i64,
                    block.status.to_string(),
                ],
            )?;
        }

        let metadata = [
            ("depth", chain.depth().to_string()),
            ("last_accepted_request_id", serde_json::to_string(&chain.last_accepted_request_id())?),
            ("last_decided_request_id", serde_json::to_string(&chain.last_decided_request_id())?),
            ("difficulty", serde_json::to_string(chain.difficulty())?),
        ];
        for (key, value) in metadata {
            tx.execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }

        tx.commit()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to commit transaction: {}", e)))?;
        Ok(())
    }

    pub fn load_blockchain(&self) -> Result<Blockchain> {
        let conn_guard = self.lock()?;

        let depth: Option<String> = conn_guard
            .query_row("SELECT value FROM metadata WHERE key = 'depth'", [], |row| row.get(0))
            .optional()?;
        let Some(depth) = depth else {
            info!("database holds no chain, starting empty");
            return Ok(Blockchain::new());
        };
        let depth: usize = depth
            .parse()
            .map_err(|e| ChainError::DatabaseError(format!("Invalid stored depth {}: {}", depth, e)))?;

        let metadata = |key: &str| -> Result<String> {
            conn_guard
                .query_row("SELECT value FROM metadata WHERE key = ?1", params![key], |row| row.get(0))
                .map_err(|e| ChainError::DatabaseError(format!("Missing metadata {}: {}", key, e)))
        };
        let last_accepted: Option<RequestId> = serde_json::from_str(&metadata("last_accepted_request_id")?)?;
        let last_decided: Option<RequestId> = serde_json::from_str(&metadata("last_decided_request_id")?)?;
        let difficulty: Difficulty = serde_json::from_str(&metadata("difficulty")?)?;

        let mut stmt = conn_guard.prepare(
            "SELECT operation, nonce, hash_pointer, client_id, sequence, status
             FROM blocks ORDER BY idx ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let operation: String = row.get(0)?;
            let nonce: String = row.get(1)?;
            let hash_pointer: Option<Vec<u8>> = row.get(2)?;
            let client_id: i64 = row.get(3)?;
            let sequence: i64 = row.get(4)?;
            let status: String = row.get(5)?;
            Ok((operation, nonce, hash_pointer, client_id, sequence, status))
        })?;

        let mut blocks = Vec::new();
        for row in rows {
            let (operation, nonce, hash_pointer, client_id, sequence, status) = row?;
            let operation: Operation = serde_json::from_str(&operation)?;
            let hash_pointer = hash_pointer
                .map(|bytes| {
                    bytes
                        .try_into()
                        .map(HashPointer)
                        .map_err(|_| ChainError::DatabaseError("Stored hash pointer is not 32 bytes".to_string()))
                })
                .transpose()?;
            let status = match status.as_str() {
                "tentative" => BlockStatus::Tentative,
                "decided" => BlockStatus::Decided,
                other => return Err(ChainError::DatabaseError(format!("Unknown block status {}", other))),
            };
            blocks.push(Block::from_parts(
                operation,
                nonce,
                hash_pointer,
                RequestId::new(client_id as u64, sequence as u64),
                status,
            ));
        }

        let chain = Blockchain::from_parts(blocks, depth, last_accepted, last_decided, difficulty);
        chain.check_loaded()?;
        debug!("loaded {} blocks (depth {}) from database", chain.len(), chain.depth());
        Ok(chain)
    }
}

impl Persistence for Database {
    fn load_blockchain(&self) -> Result<Blockchain> {
        Database::load_blockchain(self)
    }

    fn save_blockchain(&self, chain: &Blockchain) -> Result<()> {
        Database::save_blockchain(self, chain)
    }
}

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    pub chain: Arc<Mutex<Option<Blockchain>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for InMemoryPersistence {
    fn load_blockchain(&self) -> Result<Blockchain> {
        let chain = self
            .chain
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))?;
        Ok(chain.clone().unwrap_or_default())
    }

    fn save_blockchain(&self, chain: &Blockchain) -> Result<()> {
        let mut stored = self
            .chain
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))?;
        *stored = Some(chain.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chain() -> Blockchain {
        let mut chain = Blockchain::new();
        let a = Block::create(Operation::put("x", "42"), RequestId::new(1, 1), None);
        chain.accept(a.clone(), 0).unwrap();
        chain.decide(a.clone(), 0).unwrap();
        let b = Block::create(Operation::get("x"), RequestId::new(1, 2), Some(&a));
        chain.accept(b, 1).unwrap();
        chain
    }

    fn statuses(chain: &Blockchain) -> Vec<BlockStatus> {
        chain.blocks().iter().map(|b| b.status).collect()
    }

    #[test]
    fn test_database_open() {
        let db = Database::open(":memory:").unwrap();
        assert!(db.conn.lock().unwrap().is_autocommit());
    }

    #[test]
    fn test_empty_database_loads_empty_chain() {
        let db = Database::open(":memory:").unwrap();
        let chain = db.load_blockchain().unwrap();
        assert!(chain.is_empty());
        assert_eq!(chain.depth(), 0);
    }

    #[test]
    fn test_database_roundtrip() {
        let db = Database::open(":memory:").unwrap();
        let chain = sample_chain();
        db.save_blockchain(&chain).unwrap();

        let loaded = db.load_blockchain().unwrap();
        assert_eq!(loaded, chain);
        assert_eq!(statuses(&loaded), statuses(&chain));
    }

    #[test]
    fn test_database_save_replaces_previous_rows() {
        let db = Database::open(":memory:").unwrap();
        db.save_blockchain(&sample_chain()).unwrap();
        db.save_blockchain(&Blockchain::new()).unwrap();

        let loaded = db.load_blockchain().unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded, Blockchain::new());
    }

    #[test]
    fn test_in_memory_roundtrip() {
        let store = InMemoryPersistence::new();
        assert_eq!(store.load_blockchain().unwrap(), Blockchain::new());

        let chain = sample_chain();
        store.save_blockchain(&chain).unwrap();
        assert_eq!(store.load_blockchain().unwrap(), chain);
    }

    #[test]
    fn test_read_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.bin");
        fs::write(&path, b"not a chain").unwrap();

        let err = read(&path).unwrap_err();
        assert!(err.is_resource_error());
    }

    #[test]
    fn test_read_rejects_depth_past_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.bin");
        let broken = Blockchain::from_parts(Vec::new(), 3, None, None, Difficulty::default());
        fs::write(&path, bincode::serialize(&broken).unwrap()).unwrap();

        assert!(matches!(read(&path), Err(ChainError::ConsistencyViolation(_))));
    }

    #[test]
    fn test_read_rejects_undecided_block_below_depth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.bin");
        let tentative = Block::create(Operation::put("x", "1"), RequestId::new(1, 1), None);
        let broken = Blockchain::from_parts(vec![tentative], 1, None, None, Difficulty::default());
        fs::write(&path, bincode::serialize(&broken).unwrap()).unwrap();

        assert!(matches!(read(&path), Err(ChainError::ConsistencyViolation(_))));
    }

    #[test]
    fn test_database_rejects_depth_past_end() {
        let db = Database::open(":memory:").unwrap();
        db.save_blockchain(&sample_chain()).unwrap();
        db.conn
            .lock()
            .unwrap()
            .execute("UPDATE metadata SET value = '5' WHERE key = 'depth'", [])
            .unwrap();

        assert!(matches!(db.load_blockchain(), Err(ChainError::ConsistencyViolation(_))));
    }
}
