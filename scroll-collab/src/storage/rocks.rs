//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`: document rows, bincode encoded and LZ4 compressed, keyed by doc id
//! - `history`: committed snapshots (LZ4 compressed, keyed by doc_id:version)
//!
//! Conditional writes (version CAS, lock set/clear) are read-modify-write
//! sequences; they are serialized through a single async write lock so two
//! writers can never both observe the same stored version.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{apply_lock, check_update, DocumentStore, StoreError};
use crate::model::{
    timestamp_now, CollaborativeDocument, DocumentId, DocumentUpdate, HistoryEntry, UserId,
};

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_HISTORY: &str = "history";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_HISTORY];

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
            path: PathBuf::from("scroll_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, caller-provided directory).
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

/// RocksDB-backed document store.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write sequences.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
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

        log::info!("Document store opened at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Rows are already LZ4 framed by lz4_flex.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Point lookups by document id
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_HISTORY => {
                // Append-mostly, prefix-scanned by doc_id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Database directory.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Blocking helpers (no column family handle outlives a call) ───

    fn read_document(&self, id: DocumentId) -> Result<Option<CollaborativeDocument>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, id.0.as_bytes())? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_document(&self, document: &CollaborativeDocument) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, document.id.0.as_bytes(), encode_row(document)?);
        self.write_batch(batch)
    }

    fn modify_document(
        &self,
        id: DocumentId,
        change: impl FnOnce(&mut CollaborativeDocument) -> Result<(), StoreError>,
    ) -> Result<CollaborativeDocument, StoreError> {
        let mut document = self.read_document(id)?.ok_or(StoreError::NotFound(id))?;
        change(&mut document)?;
        self.write_document(&document)?;
        Ok(document)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn read_history(&self, id: DocumentId) -> Result<Vec<HistoryEntry>, StoreError> {
        let cf = self.cf(CF_HISTORY)?;
        let start_key = history_key(id, 0);

        let mut entries = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            // Stop once we've passed this document's key prefix
            if key.len() < 24 || &key[..16] != id.0.as_bytes() {
                break;
            }
            entries.push(decode_row(&value)?);
        }

        Ok(entries)
    }

    fn read_ids(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if let Ok(uuid) = Uuid::from_slice(&key) {
                ids.push(DocumentId(uuid));
            }
        }
        Ok(ids)
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn get(&self, id: DocumentId) -> Result<CollaborativeDocument, StoreError> {
        self.read_document(id)?.ok_or(StoreError::NotFound(id))
    }

    async fn create(&self, document: CollaborativeDocument) -> Result<CollaborativeDocument, StoreError> {
        let _guard = self.write_lock.lock().await;
        if self.read_document(document.id)?.is_some() {
            return Err(StoreError::AlreadyExists(document.id));
        }
        self.write_document(&document)?;
        log::debug!("Created document {} ({} bytes)", document.id, document.content.len());
        Ok(document)
    }

    async fn update(
        &self,
        id: DocumentId,
        update: DocumentUpdate,
    ) -> Result<CollaborativeDocument, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.modify_document(id, |doc| check_update(doc, update))
    }

    async fn set_lock(
        &self,
        id: DocumentId,
        holder: Option<UserId>,
    ) -> Result<CollaborativeDocument, StoreError> {
        let _guard = self.write_lock.lock().await;
        let now = timestamp_now();
        self.modify_document(id, |doc| apply_lock(doc, holder, now))
    }

    async fn append_history(&self, entry: HistoryEntry) -> Result<(), StoreError> {
        let cf = self.cf(CF_HISTORY)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, history_key(entry.document_id, entry.version), encode_row(&entry)?);
        self.write_batch(batch)
    }

    async fn history(&self, id: DocumentId) -> Result<Vec<HistoryEntry>, StoreError> {
        self.read_history(id)
    }

    async fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        self.read_ids()
    }
}

/// Build a history key: doc_id (16 bytes) + version (8 bytes big-endian).
fn history_key(id: DocumentId, version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(id.0.as_bytes());
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// bincode encode, then LZ4 compress with a size prefix.
fn encode_row<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decode_row<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Get number of CPUs for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (_dir, store) = open_temp();
        let doc = CollaborativeDocument::new(DocumentId::new(), "Hello", UserId::new());
        store.create(doc.clone()).await.unwrap();

        assert_eq!(store.get(doc.id).await.unwrap(), doc);
        assert_eq!(store.list_documents().await.unwrap(), vec![doc.id]);
    }

    #[tokio::test]
    async fn test_not_found() {
        let (_dir, store) = open_temp();
        let id = DocumentId::new();
        assert_eq!(store.get(id).await, Err(StoreError::NotFound(id)));
        assert!(store.history(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_cas() {
        let (_dir, store) = open_temp();
        let author = UserId::new();
        let doc = store
            .create(CollaborativeDocument::new(DocumentId::new(), "v1", author))
            .await
            .unwrap();

        let update = DocumentUpdate {
            content: "v2".into(),
            version: 2,
            last_edited_by: author,
            last_edited_at: timestamp_now(),
        };
        let stored = store.update(doc.id, update.clone()).await.unwrap();
        assert_eq!(stored.version, 2);

        // Same write again: the store is now at 2.
        assert_eq!(
            store.update(doc.id, update).await,
            Err(StoreError::VersionConflict { current: 2, attempted: 2 })
        );
    }

    #[tokio::test]
    async fn test_history_scoped_per_document() {
        let (_dir, store) = open_temp();
        let a = CollaborativeDocument::new(DocumentId::new(), "a", UserId::new());
        let b = CollaborativeDocument::new(DocumentId::new(), "b", UserId::new());

        for version in [3, 1, 2] {
            let mut entry = HistoryEntry::from(&a);
            entry.version = version;
            store.append_history(entry).await.unwrap();
        }
        store.append_history(HistoryEntry::from(&b)).await.unwrap();

        let versions: Vec<u64> = store.history(a.id).await.unwrap().iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(store.history(b.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_persists() {
        let (_dir, store) = open_temp();
        let holder = UserId::new();
        let doc = store
            .create(CollaborativeDocument::new(DocumentId::new(), "x", UserId::new()))
            .await
            .unwrap();

        store.set_lock(doc.id, Some(holder)).await.unwrap();
        assert_eq!(store.get(doc.id).await.unwrap().locked_by, Some(holder));
        assert!(matches!(
            store.set_lock(doc.id, Some(UserId::new())).await,
            Err(StoreError::Locked { .. })
        ));
    }
}
