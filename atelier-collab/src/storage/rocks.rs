//! RocksDB-backed document mirror.
//!
//! Column families:
//! - `snapshots`: one LZ4-compressed full state per room
//! - `updates`: LZ4-compressed update log, keyed by room then sequence
//! - `meta`: per-room bookkeeping (bincode)
//!
//! Update keys are `<room len: u32 BE><room bytes><seq: u64 BE>`, so one
//! room's log is a contiguous, ordered key range.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use super::{MirrorBackend, PersistenceError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_UPDATES, CF_META];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("atelier_mirror"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
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

/// Bookkeeping for one mirrored room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorMetadata {
    pub room: String,
    /// Sequence number the next logged update receives.
    pub next_seq: u64,
    /// Updates currently in the log.
    pub update_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl MirrorMetadata {
    fn new(room: &str) -> Self {
        let now = unix_secs();
        Self {
            room: room.to_string(),
            next_seq: 0,
            update_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistenceError::Corrupted(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PersistenceError::Corrupted(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for PersistenceError {
    fn from(e: rocksdb::Error) -> Self {
        PersistenceError::Database(e.to_string())
    }
}

/// Durable mirror: a snapshot plus an update log per room.
pub struct RocksMirror {
    /// Single-threaded mode; callers serialize through `write_lock`.
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Guards metadata read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl RocksMirror {
    /// Open (or create) the mirror at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, PersistenceError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document mirror at {}", config.path.display());
        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

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
            CF_SNAPSHOTS => {
                // Values are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_META => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Metadata of a room, `None` if never written.
    pub fn metadata(&self, room: &str) -> Result<Option<MirrorMetadata>, PersistenceError> {
        let cf = self.cf(CF_META)?;
        self.db
            .get_cf(&cf, room.as_bytes())?
            .map(|bytes| MirrorMetadata::decode(&bytes))
            .transpose()
    }

    /// Every room with a mirror.
    pub fn list_rooms(&self) -> Result<Vec<String>, PersistenceError> {
        let cf = self.cf(CF_META)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let room = String::from_utf8(key.to_vec())
                .map_err(|e| PersistenceError::Corrupted(e.to_string()))?;
            rooms.push(room);
        }
        Ok(rooms)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn load_meta_or_new(&self, room: &str) -> Result<MirrorMetadata, PersistenceError> {
        Ok(self
            .metadata(room)?
            .unwrap_or_else(|| MirrorMetadata::new(room)))
    }

    /// Keys and values of the room's update log, in sequence order.
    fn log_entries(&self, room: &str) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, PersistenceError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = room_prefix(room);
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != prefix.len() + 8 || !key.starts_with(&prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }
}

impl MirrorBackend for RocksMirror {
    fn load(&self, room: &str) -> Result<Vec<Vec<u8>>, PersistenceError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut out = Vec::new();
        if let Some(compressed) = self.db.get_cf(&cf, room.as_bytes())? {
            out.push(decompress(&compressed)?);
        }
        for (_, value) in self.log_entries(room)? {
            out.push(decompress(&value)?);
        }
        Ok(out)
    }

    fn append(&self, room: &str, update: &[u8]) -> Result<usize, PersistenceError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_META)?;

        let mut meta = self.load_meta_or_new(room)?;
        let key = update_key(room, meta.next_seq);
        meta.next_seq += 1;
        meta.update_count += 1;
        meta.updated_at = unix_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_updates, &key, lz4_flex::compress_prepend_size(update));
        batch.put_cf(&cf_meta, room.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(meta.update_count as usize)
    }

    fn replace(&self, room: &str, snapshot: &[u8]) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_META)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);
        let mut meta = self.load_meta_or_new(room)?;
        meta.update_count = 0;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_secs();

        // Snapshot, log truncation and metadata land together or not at all.
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snapshots, room.as_bytes(), &compressed);
        for (key, _) in self.log_entries(room)? {
            batch.delete_cf(&cf_updates, &key);
        }
        batch.put_cf(&cf_meta, room.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;

        log::debug!(
            "Compacted mirror of room {room}: {} -> {} bytes",
            snapshot.len(),
            compressed.len()
        );
        Ok(())
    }

    fn remove(&self, room: &str) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_META)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snapshots, room.as_bytes());
        batch.delete_cf(&cf_meta, room.as_bytes());
        for (key, _) in self.log_entries(room)? {
            batch.delete_cf(&cf_updates, &key);
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }
}

fn room_prefix(room: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + room.len() + 8);
    key.extend_from_slice(&(room.len() as u32).to_be_bytes());
    key.extend_from_slice(room.as_bytes());
    key
}

fn update_key(room: &str, seq: u64) -> Vec<u8> {
    let mut key = room_prefix(room);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, PersistenceError> {
    lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| PersistenceError::Compression(e.to_string()))
}

fn unix_secs() -> u64 {
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
