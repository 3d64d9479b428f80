//! RocksDB-backed room store.
//!
//! Column families:
//! - `documents`: full document states (LZ4 compressed), keyed by room id
//! - `metadata`: per-room bookkeeping (bincode), keyed by room id
//!
//! A snapshot and its metadata are written in one `WriteBatch`. All RocksDB
//! calls are blocking; the async gateway runs them on the blocking pool.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use super::{PersistenceError, PersistenceGateway};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Default tuning at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each room's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room_id: String,
    /// Number of saves since the room was first stored
    pub saves: u64,
    /// Uncompressed state size in bytes
    pub snapshot_size: u64,
    /// Compressed state size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(room_id: &str) -> Self {
        let now = unix_now();
        Self {
            room_id: room_id.to_string(),
            saves: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Durable room store. Cheap to clone; clones share the database handle.
#[derive(Clone)]
pub struct RocksStore {
    inner: Arc<Inner>,
}

struct Inner {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open (or create) the database and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, PersistenceError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened room store at {}", config.path.display());

        Ok(Self {
            inner: Arc::new(Inner { db, config }),
        })
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Store the full state of a room, replacing the previous one.
    pub fn save_snapshot(
        &self,
        room_id: &str,
        state: &[u8],
    ) -> Result<RoomMetadata, PersistenceError> {
        let inner = &self.inner;
        let cf_docs = inner.cf(CF_DOCUMENTS)?;
        let cf_meta = inner.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(state);

        let mut meta = self
            .metadata(room_id)?
            .unwrap_or_else(|| RoomMetadata::new(room_id));
        meta.saves += 1;
        meta.snapshot_size = state.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, room_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, room_id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(inner.config.sync_writes);
        inner.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Stored state of a room (decompressed).
    pub fn load_snapshot(&self, room_id: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let cf = self.inner.cf(CF_DOCUMENTS)?;
        match self.inner.db.get_cf(&cf, room_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| PersistenceError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn metadata(&self, room_id: &str) -> Result<Option<RoomMetadata>, PersistenceError> {
        let cf = self.inner.cf(CF_METADATA)?;
        self.inner
            .db
            .get_cf(&cf, room_id.as_bytes())?
            .map(|bytes| RoomMetadata::decode(&bytes))
            .transpose()
    }

    /// Ids of every stored room, in key order.
    pub fn list_rooms(&self) -> Result<Vec<String>, PersistenceError> {
        let cf = self.inner.cf(CF_METADATA)?;
        let mut rooms = Vec::new();
        for item in self.inner.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            match String::from_utf8(key.to_vec()) {
                Ok(id) => rooms.push(id),
                Err(_) => log::warn!("Skipping non UTF-8 room key"),
            }
        }
        Ok(rooms)
    }

    /// Remove a room's state and metadata.
    pub fn delete_room(&self, room_id: &str) -> Result<(), PersistenceError> {
        let cf_docs = self.inner.cf(CF_DOCUMENTS)?;
        let cf_meta = self.inner.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, room_id.as_bytes());
        batch.delete_cf(&cf_meta, room_id.as_bytes());
        self.inner.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), PersistenceError> {
        self.inner.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }
}

#[async_trait]
impl PersistenceGateway for RocksStore {
    async fn load(&self, room_id: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let store = self.clone();
        let room_id = room_id.to_string();
        tokio::task::spawn_blocking(move || store.load_snapshot(&room_id)).await?
    }

    async fn save(&self, room_id: &str, state: Vec<u8>) -> Result<(), PersistenceError> {
        let store = self.clone();
        let room_id = room_id.to_string();
        let meta = tokio::task::spawn_blocking(move || store.save_snapshot(&room_id, &state)).await??;
        log::debug!(
            "Stored room {} ({} bytes, {} compressed, save #{})",
            meta.room_id,
            meta.snapshot_size,
            meta.compressed_size,
            meta.saves
        );
        Ok(())
    }
}

impl Inner {
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Database(format!("Column family '{name}' not found")))
    }
}

/// Column-family-specific options.
fn cf_options(name: &str, config: &StoreConfig) -> Options {
    let mut opts = Options::default();

    let mut block_opts = BlockBasedOptions::default();
    let cache = Cache::new_lru_cache(config.block_cache_size);
    block_opts.set_block_cache(&cache);
    block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
    block_opts.set_block_size(16 * 1024);
    opts.set_block_based_table_factory(&block_opts);
    opts.set_write_buffer_size(config.write_buffer_size);

    match name {
        CF_DOCUMENTS => {
            // Values are already LZ4 framed.
            opts.set_compression_type(DBCompressionType::None);
            opts.set_max_write_buffer_number(2);
            opts.optimize_for_point_lookup(config.block_cache_size as u64);
        }
        CF_METADATA => {
            opts.set_compression_type(DBCompressionType::Lz4);
            opts.set_max_write_buffer_number(2);
            opts.optimize_for_point_lookup(config.block_cache_size as u64);
        }
        _ => {}
    }

    opts
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
