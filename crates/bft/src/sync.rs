//! Unlinkable blocks and range fetches.

use keel_types::{BlockId, BlockNum, SignedBlock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Blocks whose parent is not yet known, keyed by parent id.
#[derive(Debug)]
pub struct OrphanPool {
    max_orphans: usize,
    by_parent: HashMap<BlockId, Vec<Arc<SignedBlock>>>,
    ids: HashMap<BlockId, BlockId>,
}

impl OrphanPool {
    pub fn new(max_orphans: usize) -> Self {
        Self {
            max_orphans,
            by_parent: HashMap::new(),
            ids: HashMap::new(),
        }
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.ids.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Hold `block` until its parent arrives.
    ///
    /// Returns false when the pool overflowed and was cleared instead.
    pub fn insert(&mut self, block: Arc<SignedBlock>) -> bool {
        let id = block.id();
        if self.ids.contains_key(&id) {
            return true;
        }
        if self.ids.len() >= self.max_orphans {
            warn!(
                orphans = self.ids.len(),
                block_num = block.block_num(),
                "Too many unlinkable blocks, clearing orphan pool"
            );
            self.clear();
            return false;
        }
        self.ids.insert(id, block.previous());
        self.by_parent.entry(block.previous()).or_default().push(block);
        true
    }

    /// Remove and return the direct children of `parent`.
    pub fn take_children(&mut self, parent: &BlockId) -> Vec<Arc<SignedBlock>> {
        let children = self.by_parent.remove(parent).unwrap_or_default();
        for child in &children {
            self.ids.remove(&child.id());
        }
        children
    }

    /// Drop `root` and every orphan descending from it.
    pub fn remove_descendants(&mut self, root: &BlockId) -> usize {
        let mut removed = 0;
        let mut stack = vec![*root];
        while let Some(id) = stack.pop() {
            for child in self.take_children(&id) {
                removed += 1;
                stack.push(child.id());
            }
        }
        removed
    }

    /// Drop orphans at or below `lib`; they can never link.
    pub fn prune(&mut self, lib: BlockNum) {
        let before = self.ids.len();
        self.by_parent.retain(|_, blocks| {
            blocks.retain(|b| b.block_num() > lib);
            !blocks.is_empty()
        });
        self.ids.retain(|id, _| id.block_num() > lib);
        if self.ids.len() != before {
            debug!(dropped = before - self.ids.len(), lib, "Pruned orphan blocks");
        }
    }

    /// Lowest block number in the pool.
    pub fn lowest(&self) -> Option<BlockNum> {
        self.ids.keys().map(BlockId::block_num).min()
    }

    pub fn clear(&mut self) {
        self.by_parent.clear();
        self.ids.clear();
    }
}

/// Rate limiting of outstanding range requests.
#[derive(Debug)]
pub struct SyncTracker {
    fetch_span: BlockNum,
    retry_after: Duration,
    requested: BTreeMap<BlockNum, Duration>,
}

impl SyncTracker {
    pub fn new(fetch_span: BlockNum, retry_after: Duration) -> Self {
        Self {
            fetch_span: fetch_span.max(1),
            retry_after,
            requested: BTreeMap::new(),
        }
    }

    pub fn fetch_span(&self) -> BlockNum {
        self.fetch_span
    }

    /// Range to request for an orphan at `orphan_num`, or `None` if the
    /// same start was requested recently.
    ///
    /// An orphan above `head + 1` is fetched from `head + 1`. One at or
    /// below it sits on a fork that left our head branch somewhere above
    /// `lib`, so the fetch starts right after LIB.
    pub fn next_request(
        &mut self,
        lib: BlockNum,
        head: BlockNum,
        orphan_num: BlockNum,
        now: Duration,
    ) -> Option<(BlockNum, BlockNum)> {
        let from = if orphan_num <= head + 1 {
            lib + 1
        } else {
            head + 1
        };
        if let Some(at) = self.requested.get(&from) {
            if now.saturating_sub(*at) < self.retry_after {
                return None;
            }
        }
        let to = orphan_num
            .saturating_sub(1)
            .max(from)
            .min(from + self.fetch_span - 1);
        self.requested.insert(from, now);
        Some((from, to))
    }

    /// Forget requests starting at or below `head`.
    pub fn on_head_advance(&mut self, head: BlockNum) {
        self.requested.retain(|from, _| *from > head);
    }
}
