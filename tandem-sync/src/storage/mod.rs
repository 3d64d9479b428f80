//! Persistence of room documents.
//!
//! ```text
//! ┌─────────────┐  load / save   ┌──────────────────────┐
//! │ RoomManager │ ─────────────► │ PersistenceGateway   │
//! │ (debounced) │   full state   ├──────────────────────┤
//! └─────────────┘                │ MemoryStore (tests,  │
//!                                │   no data dir)       │
//!                                │ RocksStore (LZ4,     │
//!                                │   column families)   │
//!                                └──────────────────────┘
//! ```
//!
//! The gateway only sees opaque room ids and full document states; saves for
//! one room are serialized by the room itself.

pub mod rocks;

pub use rocks::{RocksStore, RoomMetadata, StoreConfig};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use thiserror::Error;

/// Storage errors. Logged and retried by the room layer, never sent to
/// clients.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage task failed: {0}")]
    Task(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for PersistenceError {
    fn from(e: rocksdb::Error) -> Self {
        PersistenceError::Database(e.to_string())
    }
}

impl From<tokio::task::JoinError> for PersistenceError {
    fn from(e: tokio::task::JoinError) -> Self {
        PersistenceError::Task(e.to_string())
    }
}

/// Read/write contract of the backing store.
#[async_trait]
pub trait PersistenceGateway: Send + Sync + 'static {
    /// Stored state of the room, `None` if it was never saved.
    async fn load(&self, room_id: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Replace the stored state of the room.
    async fn save(&self, room_id: &str, state: Vec<u8>) -> Result<(), PersistenceError>;
}

/// In-process store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rooms: RwLock<HashMap<String, Vec<u8>>>,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored bytes for a room.
    pub fn get(&self, room_id: &str) -> Option<Vec<u8>> {
        self.rooms
            .read()
            .ok()
            .and_then(|rooms| rooms.get(room_id).cloned())
    }

    /// Seed a room without counting a save.
    pub fn insert(&self, room_id: &str, state: Vec<u8>) {
        if let Ok(mut rooms) = self.rooms.write() {
            rooms.insert(room_id.to_string(), state);
        }
    }

    /// Number of successful saves since creation.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.rooms.read().map(|rooms| rooms.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn load(&self, room_id: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let rooms = self
            .rooms
            .read()
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;
        Ok(rooms.get(room_id).cloned())
    }

    async fn save(&self, room_id: &str, state: Vec<u8>) -> Result<(), PersistenceError> {
        let mut rooms = self
            .rooms
            .write()
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;
        rooms.insert(room_id.to_string(), state);
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
