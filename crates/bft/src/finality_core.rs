//! Finality core: the per-block record of QC links used to derive finality.
//!
//! Every block carries a core describing the chain of QC claims from the last
//! final block up to itself:
//!
//! - `links`: one [`QcLink`] per block from the front source up to the
//!   current block, each pointing at the block its header claimed a QC on.
//! - `refs`: one [`BlockRef`] per block from the last final block up to (but
//!   not including) the current block.
//!
//! The core of a child is derived from its parent with [`FinalityCore::next`].
//! A strong claim on block B finalizes the block reached by following
//! `commit_chain_length - 1` links back from B. With the default length of
//! two this is the block B itself claimed.

use keel_types::{BlockId, BlockNum, BlockRef, BlockTimestamp, QcClaim};
use sbor::prelude::BasicSbor;
use thiserror::Error;

/// Errors from deriving a child core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("reference for block {got} given to core of block {expected}")]
    CurrentBlockMismatch { expected: BlockNum, got: BlockNum },

    #[error("claim on block {claim} is ahead of current block {current}")]
    ClaimAheadOfBlock { claim: BlockNum, current: BlockNum },

    #[error("claim {claim:?} regresses below latest claim {latest:?}")]
    ClaimRegression { claim: QcClaim, latest: QcClaim },

    #[error("block reference is not the successor of the last reference")]
    NonSequentialRef,
}

/// A QC link from `source` to the `target` block it claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub struct QcLink {
    pub source_block_num: BlockNum,
    pub target_block_num: BlockNum,
    pub is_link_strong: bool,
}

/// Finality numbers a core would have after applying a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreMetadata {
    pub last_final_block_num: BlockNum,
    pub latest_qc_claim_block_num: BlockNum,
}

#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct FinalityCore {
    links: Vec<QcLink>,
    refs: Vec<BlockRef>,
    genesis_timestamp: BlockTimestamp,
}

impl FinalityCore {
    /// Core of the finality genesis block: final by definition.
    pub fn genesis(block_num: BlockNum, timestamp: BlockTimestamp) -> Self {
        Self {
            links: vec![QcLink {
                source_block_num: block_num,
                target_block_num: block_num,
                is_link_strong: false,
            }],
            refs: Vec::new(),
            genesis_timestamp: timestamp,
        }
    }

    pub fn is_genesis_core(&self) -> bool {
        self.links.len() == 1 && self.links[0].source_block_num == self.links[0].target_block_num
    }

    pub fn links(&self) -> &[QcLink] {
        &self.links
    }

    pub fn refs(&self) -> &[BlockRef] {
        &self.refs
    }

    pub fn current_block_num(&self) -> BlockNum {
        // links is never empty
        self.links
            .last()
            .map(|l| l.source_block_num)
            .unwrap_or_default()
    }

    pub fn last_final_block_num(&self) -> BlockNum {
        self.links
            .first()
            .map(|l| l.target_block_num)
            .unwrap_or_default()
    }

    pub fn last_final_block_timestamp(&self) -> BlockTimestamp {
        if self.is_genesis_core() {
            return self.genesis_timestamp;
        }
        self.refs
            .first()
            .map(|r| r.timestamp)
            .unwrap_or(self.genesis_timestamp)
    }

    pub fn latest_qc_claim(&self) -> QcClaim {
        let back = self.links.last().copied().unwrap_or(QcLink {
            source_block_num: 0,
            target_block_num: 0,
            is_link_strong: false,
        });
        QcClaim::new(back.target_block_num, back.is_link_strong)
    }

    /// Timestamp of the block the latest claim points at.
    pub fn latest_qc_block_timestamp(&self) -> BlockTimestamp {
        if self.is_genesis_core() {
            return self.genesis_timestamp;
        }
        self.get_block_reference(self.latest_qc_claim().block_num)
            .map(|r| r.timestamp)
            .unwrap_or(self.genesis_timestamp)
    }

    /// Whether `id` is a reversible ancestor tracked by this core.
    pub fn extends(&self, id: &BlockId) -> bool {
        let num = id.block_num();
        num >= self.last_final_block_num()
            && num < self.current_block_num()
            && self
                .get_block_reference(num)
                .map(|r| r.block_id == *id)
                .unwrap_or(false)
    }

    /// Reference to an ancestor in `[last_final, current)`.
    pub fn get_block_reference(&self, block_num: BlockNum) -> Option<&BlockRef> {
        let last_final = self.last_final_block_num();
        if block_num < last_final || block_num >= self.current_block_num() {
            return None;
        }
        self.refs.get((block_num - last_final) as usize)
    }

    /// The link whose source is `block_num`.
    pub fn get_qc_link_from(&self, block_num: BlockNum) -> Option<&QcLink> {
        let front = self.links.first()?.source_block_num;
        if block_num < front {
            return None;
        }
        self.links.get((block_num - front) as usize)
    }

    /// New `(last_final, links_front_source)` after applying `claim`.
    fn new_block_numbers(&self, claim: QcClaim, commit_chain_length: u32) -> (BlockNum, BlockNum) {
        let unchanged = (
            self.last_final_block_num(),
            self.links
                .first()
                .map(|l| l.source_block_num)
                .unwrap_or_default(),
        );
        if !claim.is_strong_qc {
            return unchanged;
        }

        let Some(mut link) = self.get_qc_link_from(claim.block_num).copied() else {
            return unchanged;
        };
        for _ in 2..commit_chain_length.max(2) {
            if !link.is_link_strong {
                return unchanged;
            }
            match self.get_qc_link_from(link.target_block_num) {
                Some(next) => link = *next,
                None => return unchanged,
            }
        }

        if link.target_block_num < unchanged.0 || link.source_block_num < unchanged.1 {
            return unchanged;
        }
        (link.target_block_num, link.source_block_num)
    }

    /// Finality numbers of the child core built with `claim`.
    pub fn next_metadata(&self, claim: QcClaim, commit_chain_length: u32) -> CoreMetadata {
        let (last_final, _) = self.new_block_numbers(claim, commit_chain_length);
        CoreMetadata {
            last_final_block_num: last_final,
            latest_qc_claim_block_num: claim.block_num,
        }
    }

    /// Block that becomes final once a strong QC on the current block exists.
    pub fn final_on_strong_qc(&self, commit_chain_length: u32) -> BlockNum {
        self.next_metadata(
            QcClaim::new(self.current_block_num(), true),
            commit_chain_length,
        )
        .last_final_block_num
    }

    /// Core of the child of the current block.
    ///
    /// `current` is the reference of the current block; `claim` is the child
    /// header's QC claim.
    pub fn next(
        &self,
        current: BlockRef,
        claim: QcClaim,
        commit_chain_length: u32,
    ) -> Result<FinalityCore, CoreError> {
        let current_num = self.current_block_num();
        if current.block_num() != current_num {
            return Err(CoreError::CurrentBlockMismatch {
                expected: current_num,
                got: current.block_num(),
            });
        }
        if claim.block_num > current_num {
            return Err(CoreError::ClaimAheadOfBlock {
                claim: claim.block_num,
                current: current_num,
            });
        }
        let latest = self.latest_qc_claim();
        if claim < latest {
            return Err(CoreError::ClaimRegression { claim, latest });
        }
        if let Some(last) = self.refs.last() {
            if last.block_num() + 1 != current_num || last.timestamp >= current.timestamp {
                return Err(CoreError::NonSequentialRef);
            }
        }

        let (new_final, new_front) = self.new_block_numbers(claim, commit_chain_length);
        let front = self
            .links
            .first()
            .map(|l| l.source_block_num)
            .unwrap_or_default();

        let mut links: Vec<QcLink> = self
            .links
            .get((new_front - front) as usize..)
            .map(<[QcLink]>::to_vec)
            .unwrap_or_default();
        links.push(QcLink {
            source_block_num: current_num + 1,
            target_block_num: claim.block_num,
            is_link_strong: claim.is_strong_qc,
        });

        let mut refs: Vec<BlockRef> = self
            .refs
            .get((new_final - self.last_final_block_num()) as usize..)
            .map(<[BlockRef]>::to_vec)
            .unwrap_or_default();
        refs.push(current);

        Ok(FinalityCore {
            links,
            refs,
            genesis_timestamp: self.genesis_timestamp,
        })
    }
}
