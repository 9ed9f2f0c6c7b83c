//! Per-finalizer safety record.

use crate::{BlockId, BlockNum, BlockTimestamp, Hash};
use sbor::prelude::BasicSbor;

/// Reference to a block as seen by the finality core and the safety record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BasicSbor)]
pub struct BlockRef {
    pub block_id: BlockId,
    pub timestamp: BlockTimestamp,
    pub finality_digest: Hash,
}

impl BlockRef {
    pub const EMPTY: BlockRef = BlockRef {
        block_id: BlockId::NONE,
        timestamp: BlockTimestamp(0),
        finality_digest: Hash::ZERO,
    };

    pub fn block_num(&self) -> BlockNum {
        self.block_id.block_num()
    }

    pub fn is_empty(&self) -> bool {
        self.block_id.is_none()
    }
}

/// What a finalizer last voted for and what it is locked on.
///
/// Persisted before every vote leaves the node; this record is what keeps a
/// restarted finalizer from equivocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub struct FinalizerSafetyInfo {
    /// Timestamp of the latest QC claim seen when the last vote was cast.
    pub highest_qc_seen: BlockTimestamp,
    pub last_vote: BlockRef,
    pub lock: BlockRef,
    /// Timestamp of the latest block voted on another branch since the last
    /// strong vote. Zero when the last vote was strong.
    pub other_branch_latest_time: BlockTimestamp,
}

impl FinalizerSafetyInfo {
    /// A finalizer that has never voted.
    pub const UNSET: FinalizerSafetyInfo = FinalizerSafetyInfo {
        highest_qc_seen: BlockTimestamp(0),
        last_vote: BlockRef::EMPTY,
        lock: BlockRef::EMPTY,
        other_branch_latest_time: BlockTimestamp(0),
    };

    pub fn is_unset(&self) -> bool {
        self.last_vote.is_empty() && self.lock.is_empty()
    }

    /// Safety record anchored at `block`; used when a finalizer first votes
    /// without any persisted history.
    pub fn anchored_at(block: BlockRef) -> Self {
        Self {
            highest_qc_seen: block.timestamp,
            last_vote: block,
            lock: block,
            other_branch_latest_time: BlockTimestamp(0),
        }
    }
}

impl Default for FinalizerSafetyInfo {
    fn default() -> Self {
        Self::UNSET
    }
}
