//! RocksDB-backed snapshot + update log.
//!
//! Column families:
//! - `snapshots`: full document state as one update (LZ4 compressed)
//! - `updates`: updates appended since the last snapshot (LZ4 compressed)
//! - `metadata`: per-document counters (bincode)
//!
//! Update keys are `<name length:2 BE><name bytes><seq:8 BE>`, so one
//! document's updates sort contiguously and in append order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;
use thiserror::Error;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_UPDATES, CF_METADATA];

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
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("aegis_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Default tuning at a given directory.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
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

/// Per-document bookkeeping stored alongside the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub name: String,
    /// Sequence number of the last appended update
    pub last_seq: u64,
    /// Updates currently stored (not yet folded into the snapshot)
    pub update_count: u64,
    /// Highest update sequence folded into the current snapshot
    pub snapshot_seq: u64,
    /// Number of compactions performed
    pub compactions: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(name: &str) -> Self {
        let now = unix_now();
        Self {
            name: name.to_string(),
            last_seq: 0,
            update_count: 0,
            snapshot_seq: 0,
            compactions: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Everything persisted for one document, in replay order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredDocument {
    pub snapshot: Option<Vec<u8>>,
    pub updates: Vec<(u64, Vec<u8>)>,
}

impl StoredDocument {
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.updates.is_empty()
    }

    /// Snapshot first, then updates in append order.
    pub fn replay(&self) -> impl Iterator<Item = &[u8]> {
        self.snapshot
            .as_deref()
            .into_iter()
            .chain(self.updates.iter().map(|(_, u)| u.as_slice()))
    }
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Document name too long: {0} bytes")]
    NameTooLong(usize),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Writer task stopped")]
    WriterClosed,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable snapshot + update log for named documents.
pub struct SnapshotStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Global update sequence, shared by all documents
    sequence: AtomicU64,
    /// Serialises metadata read-modify-write cycles
    meta_lock: Mutex<()>,
}

impl SnapshotStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
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

        let store = Self {
            db,
            config,
            sequence: AtomicU64::new(0),
            meta_lock: Mutex::new(()),
        };
        let next = store.recover_sequence()?;
        store.sequence.store(next, Ordering::SeqCst);
        log::debug!(
            "Opened snapshot store at {} (next seq {next})",
            store.config.path.display()
        );
        Ok(store)
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                // Values are already LZ4 frames
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// Next sequence number: one past the highest `last_seq` on record.
    fn recover_sequence(&self) -> Result<u64, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut max_seq = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            max_seq = max_seq.max(DocumentMetadata::decode(&value)?.last_seq);
        }
        Ok(max_seq + 1)
    }

    // ─── Updates ──────────────────────────────────────────────────────

    /// Append one update. Returns its sequence number.
    pub fn append_update(&self, name: &str, update: &[u8]) -> Result<u64, StoreError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let prefix = Self::name_prefix(name)?;

        let _guard = self.meta_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);

        let mut meta = self
            .metadata(name)?
            .unwrap_or_else(|| DocumentMetadata::new(name));
        meta.last_seq = seq;
        meta.update_count += 1;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            cf_updates,
            Self::update_key(&prefix, seq),
            lz4_flex::compress_prepend_size(update),
        );
        batch.put_cf(cf_meta, name.as_bytes(), meta.encode()?);
        self.write(batch)?;

        Ok(seq)
    }

    /// Updates stored for a document, in append order.
    pub fn load_updates(&self, name: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = Self::name_prefix(name)?;

        let mut updates = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            let Some(seq) = Self::seq_from_key(&prefix, &key) else {
                break;
            };
            let update = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            updates.push((seq, update));
        }
        Ok(updates)
    }

    /// Number of updates appended since the last compaction.
    pub fn update_count(&self, name: &str) -> Result<u64, StoreError> {
        Ok(self.metadata(name)?.map_or(0, |m| m.update_count))
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    pub fn load_snapshot(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, name.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    /// Snapshot plus pending updates.
    pub fn load(&self, name: &str) -> Result<StoredDocument, StoreError> {
        Ok(StoredDocument {
            snapshot: self.load_snapshot(name)?,
            updates: self.load_updates(name)?,
        })
    }

    /// Replace the snapshot and drop updates with `seq <= up_to_seq`.
    ///
    /// `snapshot` must already contain every update up to `up_to_seq`.
    /// Updates appended after `up_to_seq` was read survive the compaction.
    /// A snapshot that does not reach past the stored one is discarded and
    /// the current metadata is returned unchanged.
    pub fn compact(
        &self,
        name: &str,
        snapshot: &[u8],
        up_to_seq: u64,
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let prefix = Self::name_prefix(name)?;

        let _guard = self.meta_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut meta = self
            .metadata(name)?
            .unwrap_or_else(|| DocumentMetadata::new(name));
        if meta.compactions > 0 && up_to_seq <= meta.snapshot_seq {
            log::debug!(
                "Skipping stale compaction of '{name}' (seq {up_to_seq} <= {})",
                meta.snapshot_seq
            );
            return Ok(meta);
        }

        let compressed = lz4_flex::compress_prepend_size(snapshot);
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, name.as_bytes(), &compressed);

        let mut removed = 0u64;
        let iter = self
            .db
            .iterator_cf(cf_updates, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            match Self::seq_from_key(&prefix, &key) {
                Some(seq) if seq <= up_to_seq => {
                    batch.delete_cf(cf_updates, &key);
                    removed += 1;
                }
                _ => break,
            }
        }

        meta.update_count = meta.update_count.saturating_sub(removed);
        meta.snapshot_seq = up_to_seq;
        meta.compactions += 1;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();
        batch.put_cf(cf_meta, name.as_bytes(), meta.encode()?);

        self.write(batch)?;
        log::debug!("Compacted '{name}': folded {removed} updates into snapshot");
        Ok(meta)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn metadata(&self, name: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(cf, name.as_bytes())?
            .map(|bytes| DocumentMetadata::decode(&bytes))
            .transpose()
    }

    /// Names of all documents with persisted state.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut names = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            names.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(names)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn name_prefix(name: &str) -> Result<Vec<u8>, StoreError> {
        let len = u16::try_from(name.len()).map_err(|_| StoreError::NameTooLong(name.len()))?;
        let mut prefix = Vec::with_capacity(2 + name.len() + 8);
        prefix.extend_from_slice(&len.to_be_bytes());
        prefix.extend_from_slice(name.as_bytes());
        Ok(prefix)
    }

    fn update_key(prefix: &[u8], seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + 8);
        key.extend_from_slice(prefix);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    /// Sequence number of `key` if it belongs to the document of `prefix`.
    fn seq_from_key(prefix: &[u8], key: &[u8]) -> Option<u64> {
        let rest = key.strip_prefix(prefix)?;
        let bytes: [u8; 8] = rest.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
