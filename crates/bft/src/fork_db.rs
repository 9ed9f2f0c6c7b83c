//! Fork database: the tree of reversible blocks rooted at LIB.
//!
//! Every block in the database descends from the root. The head is the best
//! tip by `(latest QC claim, block number, earliest arrival)`.

use crate::block_state::BlockState;
use keel_types::{BlockId, BlockNum};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Errors from fork database operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForkDbError {
    #[error("block {block_id:?} does not link: parent {previous:?} unknown")]
    Unlinkable { block_id: BlockId, previous: BlockId },

    #[error("block {0:?} already in fork database")]
    Duplicate(BlockId),

    #[error("block {0:?} not in fork database")]
    UnknownBlock(BlockId),
}

/// Which branch a by-number lookup follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// The branch ending at the current head.
    Head,
    /// The irreversible branch ending at LIB.
    Lib,
}

/// Outcome of moving the root forward.
#[derive(Debug, Clone, Default)]
pub struct RootAdvance {
    /// Blocks that became irreversible, ascending, ending with the new root.
    pub irreversible: Vec<Arc<BlockState>>,
    /// Blocks dropped because they do not descend from the new root.
    pub pruned: Vec<BlockId>,
}

#[derive(Debug, Clone)]
struct ForkEntry {
    state: Arc<BlockState>,
    arrival: u64,
}

#[derive(Debug)]
pub struct ForkDatabase {
    root: Arc<BlockState>,
    head: Arc<BlockState>,
    /// Reversible blocks, excluding the root.
    blocks: HashMap<BlockId, ForkEntry>,
    children: HashMap<BlockId, Vec<BlockId>>,
    next_arrival: u64,
}

impl ForkDatabase {
    pub fn new(root: Arc<BlockState>) -> Self {
        Self {
            head: root.clone(),
            root,
            blocks: HashMap::new(),
            children: HashMap::new(),
            next_arrival: 1,
        }
    }

    pub fn root(&self) -> &Arc<BlockState> {
        &self.root
    }

    pub fn head(&self) -> &Arc<BlockState> {
        &self.head
    }

    /// Number of reversible blocks (the root excluded).
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        *id == self.root.id() || self.blocks.contains_key(id)
    }

    /// Block state by id, root included.
    pub fn get(&self, id: &BlockId) -> Option<&Arc<BlockState>> {
        if *id == self.root.id() {
            return Some(&self.root);
        }
        self.blocks.get(id).map(|e| &e.state)
    }

    /// Reversible blocks in ascending block number order.
    pub fn blocks(&self) -> Vec<Arc<BlockState>> {
        let mut all: Vec<_> = self.blocks.values().collect();
        all.sort_by_key(|e| (e.state.block_num(), e.arrival));
        all.into_iter().map(|e| e.state.clone()).collect()
    }

    /// Insert a validated block. Its parent must be present.
    pub fn insert(&mut self, state: Arc<BlockState>) -> Result<(), ForkDbError> {
        let id = state.id();
        if self.contains(&id) {
            return Err(ForkDbError::Duplicate(id));
        }
        let previous = state.previous();
        if !self.contains(&previous) {
            return Err(ForkDbError::Unlinkable {
                block_id: id,
                previous,
            });
        }

        trace!(block_num = state.block_num(), block_id = ?id, "Fork database insert");
        self.children.entry(previous).or_default().push(id);
        self.blocks.insert(
            id,
            ForkEntry {
                state,
                arrival: self.next_arrival,
            },
        );
        self.next_arrival += 1;
        Ok(())
    }

    /// Best tip by `(latest QC claim block, block number, earliest arrival)`.
    pub fn best_tip(&self) -> Arc<BlockState> {
        self.blocks
            .values()
            .max_by_key(|e| {
                (
                    e.state.latest_qc_claim().block_num,
                    e.state.block_num(),
                    Reverse(e.arrival),
                )
            })
            .map(|e| e.state.clone())
            .unwrap_or_else(|| self.root.clone())
    }

    /// Re-select the head. Returns the previous head when it changed.
    pub fn update_head(&mut self) -> Option<Arc<BlockState>> {
        let best = self.best_tip();
        if best.id() == self.head.id() {
            return None;
        }
        Some(std::mem::replace(&mut self.head, best))
    }

    /// Whether `id` is `ancestor` or descends from it.
    pub fn is_descendant(&self, id: &BlockId, ancestor: &BlockId) -> bool {
        let mut current = *id;
        loop {
            if current == *ancestor {
                return true;
            }
            match self.blocks.get(&current) {
                Some(entry) => current = entry.state.previous(),
                None => return false,
            }
        }
    }

    /// Block numbered `block_num` on the branch ending at `tip`.
    pub fn search_on_branch(&self, tip: &BlockId, block_num: BlockNum) -> Option<Arc<BlockState>> {
        let mut current = self.get(tip)?;
        loop {
            if current.block_num() == block_num {
                return Some(current.clone());
            }
            if current.block_num() < block_num || current.id() == self.root.id() {
                return None;
            }
            current = self.get(&current.previous())?;
        }
    }

    /// Block numbered `block_num` on `branch`.
    pub fn get_block(&self, block_num: BlockNum, branch: Branch) -> Option<Arc<BlockState>> {
        match branch {
            Branch::Head => self.search_on_branch(&self.head.id(), block_num),
            Branch::Lib => (block_num == self.root.block_num()).then(|| self.root.clone()),
        }
    }

    /// Blocks from `tip` down to (excluding) `stop`, descending.
    pub fn branch_until(&self, tip: &BlockId, stop: &BlockId) -> Vec<Arc<BlockState>> {
        let mut out = Vec::new();
        let mut current = *tip;
        while current != *stop {
            match self.blocks.get(&current) {
                Some(entry) => {
                    out.push(entry.state.clone());
                    current = entry.state.previous();
                }
                None => break,
            }
        }
        out
    }

    /// Latest common ancestor of two blocks in the database.
    pub fn common_ancestor(&self, a: &BlockId, b: &BlockId) -> Option<Arc<BlockState>> {
        let mut x = self.get(a)?.clone();
        let mut y = self.get(b)?.clone();
        while x.id() != y.id() {
            if x.block_num() >= y.block_num() {
                if x.id() == self.root.id() {
                    return None;
                }
                x = self.get(&x.previous())?.clone();
            } else {
                y = self.get(&y.previous())?.clone();
            }
        }
        Some(x)
    }

    /// Make `new_root` the root, returning newly irreversible blocks and the
    /// ids of pruned forks.
    ///
    /// # Panics
    ///
    /// Panics if `new_root` is below the current root: LIB never moves back.
    pub fn advance_root(&mut self, new_root: &BlockId) -> Result<RootAdvance, ForkDbError> {
        if *new_root == self.root.id() {
            return Ok(RootAdvance::default());
        }
        let target = self
            .blocks
            .get(new_root)
            .map(|e| e.state.clone())
            .ok_or(ForkDbError::UnknownBlock(*new_root))?;
        assert!(
            target.block_num() > self.root.block_num(),
            "LIB regression: root {} -> {}",
            self.root.block_num(),
            target.block_num()
        );

        let mut irreversible = self.branch_until(new_root, &self.root.id());
        irreversible.reverse();

        // Everything not descending from the new root is dropped.
        let mut keep = HashSet::new();
        let mut queue = VecDeque::from([*new_root]);
        while let Some(id) = queue.pop_front() {
            if let Some(children) = self.children.get(&id) {
                for child in children {
                    keep.insert(*child);
                    queue.push_back(*child);
                }
            }
        }
        let mut pruned: Vec<BlockId> = self
            .blocks
            .keys()
            .filter(|id| !keep.contains(*id) && *id != new_root)
            .filter(|id| !irreversible.iter().any(|b| b.id() == **id))
            .copied()
            .collect();
        pruned.sort();

        for id in &pruned {
            self.blocks.remove(id);
            self.children.remove(id);
        }
        for state in &irreversible {
            self.blocks.remove(&state.id());
        }
        self.children
            .retain(|parent, _| keep.contains(parent) || parent == new_root);

        debug!(
            old_root = self.root.block_num(),
            new_root = target.block_num(),
            irreversible = irreversible.len(),
            pruned = pruned.len(),
            "Advanced fork database root"
        );
        self.root = target;
        if !self.contains(&self.head.id()) {
            self.head = self.best_tip();
        }

        Ok(RootAdvance {
            irreversible,
            pruned,
        })
    }

    /// Remove `id` and all its descendants. Returns the removed ids.
    pub fn remove_subtree(&mut self, id: &BlockId) -> Vec<BlockId> {
        let Some(entry) = self.blocks.get(id) else {
            return Vec::new();
        };
        let parent = entry.state.previous();

        let mut removed = Vec::new();
        let mut queue = VecDeque::from([*id]);
        while let Some(current) = queue.pop_front() {
            if self.blocks.remove(&current).is_some() {
                removed.push(current);
            }
            if let Some(children) = self.children.remove(&current) {
                queue.extend(children);
            }
        }
        if let Some(siblings) = self.children.get_mut(&parent) {
            siblings.retain(|c| c != id);
        }
        if !self.contains(&self.head.id()) {
            self.head = self.best_tip();
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_state::test_chain::{child_block_at, extend, extend_with_qc};
    use keel_types::test_utils::{test_genesis, test_key};
    use keel_types::KeyPair;

    fn keys() -> Vec<KeyPair> {
        (0..4).map(test_key).collect()
    }

    fn genesis_state() -> Arc<BlockState> {
        Arc::new(BlockState::genesis(&test_genesis(1, &keys())))
    }

    /// Child of `parent` one slot later than `extend` would produce.
    fn sibling(parent: &BlockState) -> BlockState {
        let timestamp = parent.timestamp().next().next();
        let block = child_block_at(parent, timestamp, parent.latest_qc_claim(), None, None);
        parent.next(block, 2).unwrap()
    }

    #[test]
    fn test_insert_requires_parent() {
        let genesis = genesis_state();
        let b2 = Arc::new(extend(&genesis));
        let b3 = Arc::new(extend(&b2));
        let mut db = ForkDatabase::new(genesis);

        assert!(matches!(
            db.insert(b3.clone()),
            Err(ForkDbError::Unlinkable { .. })
        ));
        db.insert(b2.clone()).unwrap();
        assert_eq!(db.insert(b2.clone()), Err(ForkDbError::Duplicate(b2.id())));
        db.insert(b3.clone()).unwrap();
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn test_head_prefers_higher_claim_over_length() {
        let keys = keys();
        let genesis = genesis_state();
        let mut db = ForkDatabase::new(genesis.clone());

        // Long branch without QCs.
        let a2 = Arc::new(extend(&genesis));
        let a3 = Arc::new(extend(&a2));
        let a4 = Arc::new(extend(&a3));
        // Short branch with a QC on its first block.
        let b2 = Arc::new(sibling(&genesis));
        let b3 = Arc::new(extend_with_qc(&b2, &keys));

        for s in [&a2, &a3, &a4, &b2, &b3] {
            db.insert((*s).clone()).unwrap();
        }
        db.update_head();
        assert_eq!(db.head().id(), b3.id());
    }

    #[test]
    fn test_tie_breaks_on_earliest_arrival() {
        let genesis = genesis_state();
        let mut db = ForkDatabase::new(genesis.clone());
        let first = Arc::new(extend(&genesis));
        let second = Arc::new(sibling(&genesis));
        db.insert(first.clone()).unwrap();
        db.insert(second).unwrap();
        db.update_head();
        assert_eq!(db.head().id(), first.id());
    }

    #[test]
    fn test_advance_root_prunes_forks() {
        let genesis = genesis_state();
        let mut db = ForkDatabase::new(genesis.clone());
        let a2 = Arc::new(extend(&genesis));
        let a3 = Arc::new(extend(&a2));
        let fork = Arc::new(sibling(&genesis));
        for s in [&a2, &a3, &fork] {
            db.insert((*s).clone()).unwrap();
        }

        let advance = db.advance_root(&a2.id()).unwrap();
        assert_eq!(advance.irreversible.len(), 1);
        assert_eq!(advance.irreversible[0].id(), a2.id());
        assert_eq!(advance.pruned, vec![fork.id()]);
        assert_eq!(db.root().id(), a2.id());
        assert_eq!(db.len(), 1);
        assert!(db.contains(&a3.id()));
    }

    #[test]
    #[should_panic(expected = "LIB regression")]
    fn test_root_regression_panics() {
        let genesis = genesis_state();
        let a2 = Arc::new(extend(&genesis));
        let a3 = Arc::new(extend(&a2));
        let mut db = ForkDatabase::new(a2.clone());
        db.insert(a3.clone()).unwrap();
        db.advance_root(&a3.id()).unwrap();
        db.blocks.insert(
            a2.id(),
            ForkEntry {
                state: a2.clone(),
                arrival: 99,
            },
        );
        let _ = db.advance_root(&a2.id());
    }

    #[test]
    fn test_search_and_remove_subtree() {
        let genesis = genesis_state();
        let mut db = ForkDatabase::new(genesis.clone());
        let a2 = Arc::new(extend(&genesis));
        let a3 = Arc::new(extend(&a2));
        let a4 = Arc::new(extend(&a3));
        for s in [&a2, &a3, &a4] {
            db.insert((*s).clone()).unwrap();
        }
        db.update_head();
        assert_eq!(db.get_block(3, Branch::Head).unwrap().id(), a3.id());
        assert_eq!(db.get_block(1, Branch::Lib).unwrap().id(), genesis.id());
        assert!(db.get_block(3, Branch::Lib).is_none());

        let removed = db.remove_subtree(&a3.id());
        assert_eq!(removed.len(), 2);
        assert_eq!(db.head().id(), a2.id());
    }
}
