//! # RocksDB Storage
//!
//! Durable block storage for a production node.
//!
//! Three column families:
//!
//! - `block_log`: irreversible blocks keyed by big-endian block number,
//!   append-only
//! - `fork_db`: reversible blocks keyed by block id
//! - `chain_meta`: chain id and the current LIB
//!
//! Finalizing blocks (log append, fork_db delete, LIB update) is a single
//! write batch, so a crash never leaves a block in both places or in neither.
//!
//! All operations are synchronous blocking I/O. Callers in async contexts
//! should use `spawn_blocking`.

use crate::metrics;
use keel_bft::{ChainSnapshot, RecoveredState};
use keel_types::{BlockId, BlockNum, ChainId, FinalizerSafetyInfo, PublicKey, SignedBlock};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, WriteOptions, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

pub const CF_BLOCK_LOG: &str = "block_log";
pub const CF_FORK_DB: &str = "fork_db";
pub const CF_CHAIN_META: &str = "chain_meta";

const META_CHAIN_ID: &[u8] = b"chain_id";
const META_LIB: &[u8] = b"lib";

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Column family {0} not found")]
    MissingColumnFamily(&'static str),

    #[error("Undecodable {what}: {reason}")]
    Codec { what: &'static str, reason: String },

    #[error("Database belongs to chain {stored}, node runs {expected}")]
    ChainMismatch { expected: ChainId, stored: ChainId },

    #[error("Block log gap: expected block {expected}, got {got}")]
    LogGap { expected: BlockNum, got: BlockNum },
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::DatabaseError(e.to_string())
    }
}

fn codec<E: std::fmt::Debug>(what: &'static str) -> impl FnOnce(E) -> StorageError {
    move |e| StorageError::Codec {
        what,
        reason: format!("{e:?}"),
    }
}

fn decode_block(bytes: &[u8]) -> Result<SignedBlock, StorageError> {
    sbor::basic_decode(bytes).map_err(codec("block"))
}

fn log_key(num: BlockNum) -> [u8; 4] {
    num.to_be_bytes()
}

/// RocksDB-backed block log and fork database store.
pub struct RocksDbStorage {
    db: Arc<DB>,
    sync_writes: bool,
}

impl RocksDbStorage {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::open_with_config(path, RocksDbConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: RocksDbConfig,
    ) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        opts.set_max_background_jobs(config.max_background_jobs);
        if config.bytes_per_sync > 0 {
            opts.set_bytes_per_sync(config.bytes_per_sync as u64);
        }
        opts.set_keep_log_file_num(config.keep_log_file_num);
        opts.set_max_write_buffer_number(config.max_write_buffer_number);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_compression_type(config.compression.to_rocksdb());

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        if let Some(cache_size) = config.block_cache_size {
            let cache = rocksdb::Cache::new_lru_cache(cache_size);
            block_opts.set_block_cache(&cache);
        }
        if config.bloom_filter_bits > 0.0 {
            block_opts.set_bloom_filter(config.bloom_filter_bits, false);
        }
        opts.set_block_based_table_factory(&block_opts);

        let cf_descriptors: Vec<_> = [CF_BLOCK_LOG, CF_FORK_DB, CF_CHAIN_META]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            sync_writes: config.sync_writes,
        })
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or(StorageError::MissingColumnFamily(name))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let start = Instant::now();
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &opts)?;
        metrics::record_rocksdb_write(start.elapsed().as_secs_f64());
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Chain metadata
    // ═══════════════════════════════════════════════════════════════════════

    /// Record the chain id on first open; refuse a database from another chain.
    pub fn check_chain_id(&self, chain_id: ChainId) -> Result<(), StorageError> {
        let cf = self.cf(CF_CHAIN_META)?;
        match self.db.get_cf(cf, META_CHAIN_ID)? {
            Some(bytes) => {
                let stored: ChainId =
                    sbor::basic_decode(&bytes).map_err(codec("chain id"))?;
                if stored != chain_id {
                    return Err(StorageError::ChainMismatch {
                        expected: chain_id,
                        stored,
                    });
                }
                Ok(())
            }
            None => {
                let mut batch = WriteBatch::default();
                let bytes = sbor::basic_encode(&chain_id).map_err(codec("chain id"))?;
                batch.put_cf(cf, META_CHAIN_ID, bytes);
                self.write(batch)
            }
        }
    }

    /// LIB recorded by the last irreversible batch.
    pub fn lib(&self) -> Result<Option<BlockId>, StorageError> {
        let cf = self.cf(CF_CHAIN_META)?;
        match self.db.get_cf(cf, META_LIB)? {
            Some(bytes) => sbor::basic_decode(&bytes)
                .map(Some)
                .map_err(codec("lib")),
            None => Ok(None),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Store a reversible block in the fork database.
    pub fn put_reversible_block(&self, block: &SignedBlock) -> Result<(), StorageError> {
        let id = block.id();
        let bytes = sbor::basic_encode(block).map_err(codec("block"))?;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_FORK_DB)?, id.as_bytes(), bytes);
        self.write(batch)?;
        debug!(block_num = block.block_num(), block_id = ?id, "Stored reversible block");
        Ok(())
    }

    /// Drop reversible blocks (pruned forks or rejected blocks).
    pub fn remove_blocks(&self, ids: &[BlockId]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        let cf = self.cf(CF_FORK_DB)?;
        let mut batch = WriteBatch::default();
        for id in ids {
            batch.delete_cf(cf, id.as_bytes());
        }
        self.write(batch)
    }

    /// Append finalized blocks to the log, delete them from the fork
    /// database and record the new LIB, atomically.
    pub fn persist_irreversible(
        &self,
        blocks: &[Arc<SignedBlock>],
        lib: BlockId,
    ) -> Result<(), StorageError> {
        let log_cf = self.cf(CF_BLOCK_LOG)?;
        let fork_cf = self.cf(CF_FORK_DB)?;
        let meta_cf = self.cf(CF_CHAIN_META)?;

        let mut batch = WriteBatch::default();
        for block in blocks {
            let bytes = sbor::basic_encode(block.as_ref()).map_err(codec("block"))?;
            batch.put_cf(log_cf, log_key(block.block_num()), bytes);
            batch.delete_cf(fork_cf, block.id().as_bytes());
        }
        let lib_bytes = sbor::basic_encode(&lib).map_err(codec("lib"))?;
        batch.put_cf(meta_cf, META_LIB, lib_bytes);
        self.write(batch)?;

        debug!(
            count = blocks.len(),
            lib = lib.block_num(),
            "Persisted irreversible blocks"
        );
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    /// Irreversible block by number.
    pub fn get_block(&self, num: BlockNum) -> Result<Option<SignedBlock>, StorageError> {
        match self.db.get_cf(self.cf(CF_BLOCK_LOG)?, log_key(num))? {
            Some(bytes) => decode_block(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Reversible block by id.
    pub fn get_reversible_block(&self, id: &BlockId) -> Result<Option<SignedBlock>, StorageError> {
        match self.db.get_cf(self.cf(CF_FORK_DB)?, id.as_bytes())? {
            Some(bytes) => decode_block(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Irreversible blocks in `[from, to]`, ascending, stopping at the first
    /// missing number.
    pub fn get_blocks_range(
        &self,
        from: BlockNum,
        to: BlockNum,
    ) -> Result<Vec<SignedBlock>, StorageError> {
        let mut blocks = Vec::new();
        let iter = self.db.iterator_cf(
            self.cf(CF_BLOCK_LOG)?,
            rocksdb::IteratorMode::From(&log_key(from), rocksdb::Direction::Forward),
        );
        let mut expected = from;
        for item in iter {
            let (_, value) = item?;
            let block = decode_block(&value)?;
            if block.block_num() > to || block.block_num() != expected {
                break;
            }
            blocks.push(block);
            expected = expected.saturating_add(1);
        }
        Ok(blocks)
    }

    /// Highest block number in the log.
    pub fn last_logged_block(&self) -> Result<Option<BlockNum>, StorageError> {
        let mut iter = self
            .db
            .iterator_cf(self.cf(CF_BLOCK_LOG)?, rocksdb::IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (_, value) = item?;
                Ok(Some(decode_block(&value)?.block_num()))
            }
            None => Ok(None),
        }
    }

    fn reversible_blocks(&self) -> Result<Vec<Arc<SignedBlock>>, StorageError> {
        let iter = self
            .db
            .iterator_cf(self.cf(CF_FORK_DB)?, rocksdb::IteratorMode::Start);
        let mut blocks = Vec::new();
        for item in iter {
            let (_, value) = item?;
            blocks.push(Arc::new(decode_block(&value)?));
        }
        Ok(blocks)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Recovery
    // ═══════════════════════════════════════════════════════════════════════

    /// Gather everything needed to rebuild the engine after a restart.
    ///
    /// The block log must be contiguous from the start root; a gap is
    /// reported as an error rather than replaying past it.
    pub fn load_recovered_state(
        &self,
        snapshot: Option<ChainSnapshot>,
        safety_records: BTreeMap<PublicKey, FinalizerSafetyInfo>,
        safety_corrupt: Option<String>,
    ) -> Result<RecoveredState, StorageError> {
        let start_num = snapshot
            .as_ref()
            .map(|s| s.header.head_block_num)
            .unwrap_or(0);

        let mut irreversible_blocks = Vec::new();
        let iter = self.db.iterator_cf(
            self.cf(CF_BLOCK_LOG)?,
            rocksdb::IteratorMode::From(
                &log_key(start_num.saturating_add(1)),
                rocksdb::Direction::Forward,
            ),
        );
        let mut expected: Option<BlockNum> = None;
        for item in iter {
            let (_, value) = item?;
            let block = decode_block(&value)?;
            if let Some(expected) = expected {
                if block.block_num() != expected {
                    return Err(StorageError::LogGap {
                        expected,
                        got: block.block_num(),
                    });
                }
            }
            expected = Some(block.block_num() + 1);
            irreversible_blocks.push(Arc::new(block));
        }

        let reversible_blocks = self.reversible_blocks()?;

        info!(
            snapshot_root = start_num,
            irreversible = irreversible_blocks.len(),
            reversible = reversible_blocks.len(),
            safety_records = safety_records.len(),
            "Loaded recovered state"
        );

        Ok(RecoveredState {
            snapshot,
            irreversible_blocks,
            reversible_blocks,
            safety_records,
            safety_corrupt,
        })
    }
}

/// Configuration for RocksDB storage.
#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    pub max_background_jobs: i32,
    pub bytes_per_sync: usize,
    pub keep_log_file_num: usize,
    pub max_write_buffer_number: i32,
    pub write_buffer_size: usize,
    pub compression: CompressionType,
    pub block_cache_size: Option<usize>,
    pub bloom_filter_bits: f64,
    /// fsync the WAL on every write batch.
    pub sync_writes: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            max_background_jobs: 4,
            bytes_per_sync: 1024 * 1024,
            keep_log_file_num: 10,
            max_write_buffer_number: 3,
            write_buffer_size: 64 * 1024 * 1024,
            compression: CompressionType::Lz4,
            block_cache_size: Some(256 * 1024 * 1024),
            bloom_filter_bits: 10.0,
            sync_writes: true,
        }
    }
}

/// Compression algorithm for RocksDB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    None,
    Snappy,
    #[default]
    Lz4,
    Zstd,
}

impl CompressionType {
    fn to_rocksdb(self) -> rocksdb::DBCompressionType {
        match self {
            CompressionType::None => rocksdb::DBCompressionType::None,
            CompressionType::Snappy => rocksdb::DBCompressionType::Snappy,
            CompressionType::Lz4 => rocksdb::DBCompressionType::Lz4,
            CompressionType::Zstd => rocksdb::DBCompressionType::Zstd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{BlockHeader, BlockTimestamp, Hash, ProducerName, QcClaim};
    use tempfile::TempDir;

    fn chain(len: BlockNum) -> Vec<Arc<SignedBlock>> {
        let mut previous = BlockId::NONE;
        (1..=len)
            .map(|num| {
                let block = SignedBlock::new(
                    BlockHeader {
                        block_num: num,
                        previous,
                        timestamp: BlockTimestamp(1000 + num),
                        producer: ProducerName::new("prod-a"),
                        qc_claim: QcClaim::new(num.saturating_sub(1), false),
                        new_finalizer_policy: None,
                        new_proposer_policy: None,
                        payload_root: Hash::ZERO,
                    },
                    None,
                );
                previous = block.id();
                Arc::new(block)
            })
            .collect()
    }

    #[test]
    fn test_reversible_then_irreversible() {
        let dir = TempDir::new().unwrap();
        let storage = RocksDbStorage::open(dir.path()).unwrap();
        let blocks = chain(4);

        for block in &blocks {
            storage.put_reversible_block(block).unwrap();
        }
        assert!(storage.get_block(2).unwrap().is_none());
        assert!(storage
            .get_reversible_block(&blocks[1].id())
            .unwrap()
            .is_some());

        storage
            .persist_irreversible(&blocks[..2], blocks[1].id())
            .unwrap();

        assert_eq!(storage.get_block(2).unwrap().as_ref(), Some(blocks[1].as_ref()));
        assert!(storage
            .get_reversible_block(&blocks[1].id())
            .unwrap()
            .is_none());
        assert!(storage
            .get_reversible_block(&blocks[2].id())
            .unwrap()
            .is_some());
        assert_eq!(storage.lib().unwrap(), Some(blocks[1].id()));
        assert_eq!(storage.last_logged_block().unwrap(), Some(2));
    }

    #[test]
    fn test_blocks_range_stops_at_end_of_log() {
        let dir = TempDir::new().unwrap();
        let storage = RocksDbStorage::open(dir.path()).unwrap();
        let blocks = chain(5);
        storage.persist_irreversible(&blocks, blocks[4].id()).unwrap();

        let range = storage.get_blocks_range(2, 4).unwrap();
        assert_eq!(
            range.iter().map(|b| b.block_num()).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        assert_eq!(storage.get_blocks_range(4, 100).unwrap().len(), 2);
        assert!(storage.get_blocks_range(9, 12).unwrap().is_empty());
    }

    #[test]
    fn test_recovered_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let blocks = chain(6);
        {
            let storage = RocksDbStorage::open(dir.path()).unwrap();
            for block in &blocks {
                storage.put_reversible_block(block).unwrap();
            }
            storage
                .persist_irreversible(&blocks[..3], blocks[2].id())
                .unwrap();
            storage.remove_blocks(&[blocks[5].id()]).unwrap();
        }

        let storage = RocksDbStorage::open(dir.path()).unwrap();
        let recovered = storage
            .load_recovered_state(None, BTreeMap::new(), None)
            .unwrap();
        assert_eq!(
            recovered
                .irreversible_blocks
                .iter()
                .map(|b| b.block_num())
                .collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let mut reversible: Vec<_> = recovered
            .reversible_blocks
            .iter()
            .map(|b| b.block_num())
            .collect();
        reversible.sort();
        assert_eq!(reversible, vec![4, 5]);
    }

    #[test]
    fn test_chain_id_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let storage = RocksDbStorage::open(dir.path()).unwrap();
        let ours = ChainId(Hash::from_bytes(b"ours"));
        let theirs = ChainId(Hash::from_bytes(b"theirs"));

        storage.check_chain_id(ours).unwrap();
        storage.check_chain_id(ours).unwrap();
        assert!(matches!(
            storage.check_chain_id(theirs),
            Err(StorageError::ChainMismatch { .. })
        ));
    }

    #[test]
    fn test_compression_mapping() {
        assert_eq!(CompressionType::default(), CompressionType::Lz4);
        assert!(matches!(
            CompressionType::Zstd.to_rocksdb(),
            rocksdb::DBCompressionType::Zstd
        ));
    }
}
