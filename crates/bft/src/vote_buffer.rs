//! Buffer for votes that arrive before their block.

use keel_core::{NodeIndex, VoteStatus};
use keel_types::{BlockId, BlockNum, Vote};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Votes waiting for their block, keyed by block id.
///
/// Bounded three ways: votes more than `horizon` blocks above head are
/// dropped, each connection may hold at most `per_connection` votes, and the
/// whole buffer at most `total`.
#[derive(Debug)]
pub struct VoteBuffer {
    horizon: BlockNum,
    per_connection: usize,
    total: usize,
    votes: BTreeMap<BlockId, Vec<(Vote, NodeIndex)>>,
    per_peer: HashMap<NodeIndex, usize>,
    len: usize,
}

impl VoteBuffer {
    pub fn new(horizon: BlockNum, per_connection: usize, total: usize) -> Self {
        Self {
            horizon,
            per_connection,
            total,
            votes: BTreeMap::new(),
            per_peer: HashMap::new(),
            len: 0,
        }
    }

    /// Buffer `vote` received from `from`.
    ///
    /// Returns `UnknownBlock` when buffered (or silently discarded because it
    /// is at or below LIB or beyond the horizon) and `MaxExceeded` when a cap
    /// is hit.
    pub fn insert(
        &mut self,
        vote: Vote,
        from: NodeIndex,
        head: BlockNum,
        lib: BlockNum,
    ) -> VoteStatus {
        let block_num = vote.block_num();
        if block_num <= lib || block_num > head.saturating_add(self.horizon) {
            trace!(block_num, head, lib, "Discarding vote outside buffer window");
            return VoteStatus::UnknownBlock;
        }
        let peer_count = self.per_peer.get(&from).copied().unwrap_or(0);
        if peer_count >= self.per_connection || self.len >= self.total {
            return VoteStatus::MaxExceeded;
        }
        let entry = self.votes.entry(vote.block_id).or_default();
        if entry.iter().any(|(v, _)| v == &vote) {
            return VoteStatus::Duplicate;
        }
        entry.push((vote, from));
        *self.per_peer.entry(from).or_insert(0) += 1;
        self.len += 1;
        VoteStatus::UnknownBlock
    }

    /// Remove and return the votes buffered for `block_id`.
    pub fn take(&mut self, block_id: &BlockId) -> Vec<(Vote, NodeIndex)> {
        let votes = self.votes.remove(block_id).unwrap_or_default();
        for (_, from) in &votes {
            self.release(*from);
        }
        votes
    }

    /// Drop votes for blocks at or below `lib` and beyond the horizon above
    /// `head`.
    pub fn prune(&mut self, head: BlockNum, lib: BlockNum) {
        let limit = head.saturating_add(self.horizon);
        let stale: Vec<BlockId> = self
            .votes
            .keys()
            .filter(|id| id.block_num() <= lib || id.block_num() > limit)
            .copied()
            .collect();
        for id in stale {
            self.take(&id);
        }
    }

    fn release(&mut self, from: NodeIndex) {
        self.len = self.len.saturating_sub(1);
        if let Some(count) = self.per_peer.get_mut(&from) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_peer.remove(&from);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
