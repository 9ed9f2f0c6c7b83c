//! In-memory node storage for simulation.
//!
//! Mirrors the production layout: an append-only block log below LIB, a
//! reversible block store keyed by id, and the finalizer safety records.
//! Writes apply synchronously, so everything a node persisted survives a
//! simulated crash.

use keel_bft::{ChainSnapshot, RecoveredState};
use keel_types::{BlockId, BlockNum, FinalizerSafetyInfo, PublicKey, SignedBlock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Storage of one simulated node.
#[derive(Debug, Clone, Default)]
pub struct SimStorage {
    block_log: BTreeMap<BlockNum, Arc<SignedBlock>>,
    fork_db: BTreeMap<BlockId, Arc<SignedBlock>>,
    lib: Option<BlockId>,
    safety: BTreeMap<PublicKey, FinalizerSafetyInfo>,
    safety_corrupt: Option<String>,
    fail_safety_writes: bool,
    safety_writes: u64,
}

impl SimStorage {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Blocks ───

    pub fn put_reversible_block(&mut self, block: Arc<SignedBlock>) {
        self.fork_db.insert(block.id(), block);
    }

    pub fn remove_blocks(&mut self, ids: &[BlockId]) {
        for id in ids {
            self.fork_db.remove(id);
        }
    }

    /// Append finalized blocks to the log and drop them from the reversible
    /// store.
    pub fn persist_irreversible(&mut self, blocks: &[Arc<SignedBlock>], lib: BlockId) {
        for block in blocks {
            self.fork_db.remove(&block.id());
            self.block_log.insert(block.block_num(), block.clone());
        }
        self.lib = Some(lib);
        trace!(count = blocks.len(), lib = lib.block_num(), "Blocks moved to log");
    }

    pub fn get_block(&self, block_num: BlockNum) -> Option<Arc<SignedBlock>> {
        self.block_log.get(&block_num).cloned()
    }

    pub fn get_reversible_block(&self, id: &BlockId) -> Option<Arc<SignedBlock>> {
        self.fork_db.get(id).cloned()
    }

    /// Contiguous log blocks in `[from, to]`, stopping at the first gap.
    pub fn get_blocks_range(&self, from: BlockNum, to: BlockNum) -> Vec<Arc<SignedBlock>> {
        let mut blocks = Vec::new();
        for num in from..=to {
            match self.block_log.get(&num) {
                Some(block) => blocks.push(block.clone()),
                None => break,
            }
        }
        blocks
    }

    pub fn lib(&self) -> Option<BlockId> {
        self.lib
    }

    pub fn last_logged_block(&self) -> Option<BlockNum> {
        self.block_log.keys().next_back().copied()
    }

    pub fn reversible_count(&self) -> usize {
        self.fork_db.len()
    }

    /// Forget all blocks, keeping the safety records. Models a node whose
    /// block database was lost and is restored from a snapshot.
    pub fn clear_blocks(&mut self) {
        self.block_log.clear();
        self.fork_db.clear();
        self.lib = None;
    }

    // ─── Safety records ───

    /// Replace the safety records. Fails when write failures are injected.
    pub fn store_safety(
        &mut self,
        records: BTreeMap<PublicKey, FinalizerSafetyInfo>,
    ) -> Result<(), String> {
        if self.fail_safety_writes {
            return Err("injected safety write failure".to_string());
        }
        self.safety = records;
        self.safety_corrupt = None;
        self.safety_writes += 1;
        Ok(())
    }

    pub fn safety_records(&self) -> &BTreeMap<PublicKey, FinalizerSafetyInfo> {
        &self.safety
    }

    pub fn safety_writes(&self) -> u64 {
        self.safety_writes
    }

    /// Make subsequent safety writes fail (or succeed again).
    pub fn set_fail_safety_writes(&mut self, fail: bool) {
        self.fail_safety_writes = fail;
    }

    /// Mark the safety records as unreadable for the next launch.
    pub fn corrupt_safety(&mut self, reason: impl Into<String>) {
        self.safety.clear();
        self.safety_corrupt = Some(reason.into());
    }

    // ─── Recovery ───

    /// Everything a relaunched node reads at startup.
    ///
    /// Log blocks at or below the snapshot root are skipped.
    pub fn recovered_state(&self, snapshot: Option<ChainSnapshot>) -> RecoveredState {
        let start_num = snapshot
            .as_ref()
            .map(|s| s.header.head_block_num)
            .unwrap_or(0);
        let irreversible_blocks = self
            .block_log
            .range(start_num.saturating_add(1)..)
            .map(|(_, block)| block.clone())
            .collect();
        let mut reversible_blocks: Vec<_> = self.fork_db.values().cloned().collect();
        reversible_blocks.sort_by_key(|block| block.block_num());

        RecoveredState {
            snapshot,
            irreversible_blocks,
            reversible_blocks,
            safety_records: self.safety.clone(),
            safety_corrupt: self.safety_corrupt.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::test_utils::{test_key, test_producer};
    use keel_types::{BlockHeader, BlockRef, BlockTimestamp, Hash, QcClaim};

    fn chain(len: u32) -> Vec<Arc<SignedBlock>> {
        let mut previous = BlockId::new(0, &Hash::from_bytes(b"genesis"));
        (1..=len)
            .map(|num| {
                let header = BlockHeader {
                    block_num: num,
                    previous,
                    timestamp: BlockTimestamp(1000 + num),
                    producer: test_producer(0),
                    qc_claim: QcClaim {
                        block_num: num - 1,
                        is_strong_qc: true,
                    },
                    new_finalizer_policy: None,
                    new_proposer_policy: None,
                    payload_root: Hash::ZERO,
                };
                let block = Arc::new(SignedBlock::new(header, None));
                previous = block.id();
                block
            })
            .collect()
    }

    #[test]
    fn test_persist_irreversible_moves_blocks() {
        let mut storage = SimStorage::new();
        let blocks = chain(4);
        for block in &blocks {
            storage.put_reversible_block(block.clone());
        }
        assert_eq!(storage.reversible_count(), 4);

        storage.persist_irreversible(&blocks[..2], blocks[1].id());
        assert_eq!(storage.reversible_count(), 2);
        assert_eq!(storage.lib(), Some(blocks[1].id()));
        assert_eq!(storage.last_logged_block(), Some(2));
        assert_eq!(storage.get_blocks_range(1, 4).len(), 2);
        assert!(storage.get_reversible_block(&blocks[3].id()).is_some());
    }

    #[test]
    fn test_recovered_state_skips_snapshot_range() {
        let mut storage = SimStorage::new();
        let blocks = chain(3);
        storage.persist_irreversible(&blocks, blocks[2].id());

        let recovered = storage.recovered_state(None);
        assert_eq!(recovered.irreversible_blocks.len(), 3);
        assert!(recovered.reversible_blocks.is_empty());
        assert!(recovered.safety_corrupt.is_none());
    }

    #[test]
    fn test_safety_write_injection() {
        let mut storage = SimStorage::new();
        let block_ref = BlockRef {
            block_id: BlockId::new(3, &Hash::from_bytes(b"b3")),
            timestamp: BlockTimestamp(1003),
            finality_digest: Hash::from_bytes(b"digest"),
        };
        let mut records = BTreeMap::new();
        records.insert(
            test_key(0).public_key(),
            FinalizerSafetyInfo {
                highest_qc_seen: BlockTimestamp(1002),
                last_vote: block_ref,
                lock: block_ref,
                other_branch_latest_time: BlockTimestamp(1001),
            },
        );

        storage.store_safety(records.clone()).unwrap();
        assert_eq!(storage.safety_writes(), 1);

        storage.set_fail_safety_writes(true);
        assert!(storage.store_safety(BTreeMap::new()).is_err());
        assert_eq!(storage.safety_records(), &records);

        storage.corrupt_safety("bad checksum");
        let recovered = storage.recovered_state(None);
        assert!(recovered.safety_records.is_empty());
        assert_eq!(recovered.safety_corrupt.as_deref(), Some("bad checksum"));
    }
}
