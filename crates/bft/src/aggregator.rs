//! Vote aggregation and QC construction.
//!
//! Each reversible block with finality enabled gets an [`OpenQc`] holding one
//! [`OpenQcSig`] per voting policy. A policy's votes move through the
//! pending-QC states:
//!
//! ```text
//! Unrestricted ──weak > max_weak──▶ Restricted
//!      │                                │
//!   quorum                           quorum
//!      ▼                                ▼
//! WeakAchieved ──weak ≥ max_weak──▶ WeakFinal
//!      │
//!  strong quorum
//!      ▼
//!   Strong
//! ```
//!
//! `max_weak = total_weight - threshold`: once weak votes exceed it a strong
//! QC can no longer form. A block's QC is available when every voting policy
//! has met quorum.

use crate::block_state::BlockState;
use keel_core::VoteStatus;
use keel_types::{
    BlockId, BlockNum, FinalizerPolicy, PublicKey, QcSig, QuorumCertificate, Signature, Vote,
    VoteBitset, VoteKind,
};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// Pending-QC state of one policy's votes on one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PendingQcState {
    Unrestricted,
    Restricted,
    WeakAchieved,
    WeakFinal,
    Strong,
}

impl PendingQcState {
    pub fn is_quorum_met(self) -> bool {
        matches!(
            self,
            PendingQcState::WeakAchieved | PendingQcState::WeakFinal | PendingQcState::Strong
        )
    }
}

/// Votes of one finalizer policy on one block.
#[derive(Debug, Clone)]
pub struct OpenQcSig {
    threshold: u64,
    max_weak_sum: u64,
    weights: Vec<u64>,
    keys: Vec<PublicKey>,
    votes: Vec<Option<(VoteKind, Signature)>>,
    strong_sum: u64,
    weak_sum: u64,
    state: PendingQcState,
}

impl OpenQcSig {
    pub fn new(policy: &FinalizerPolicy) -> Self {
        let n = policy.finalizers.len();
        Self {
            threshold: policy.threshold,
            max_weak_sum: policy.max_weak_sum_before_weak_final(),
            weights: policy.finalizers.iter().map(|f| f.weight).collect(),
            keys: policy.finalizers.iter().map(|f| f.public_key).collect(),
            votes: vec![None; n],
            strong_sum: 0,
            weak_sum: 0,
            state: PendingQcState::Unrestricted,
        }
    }

    pub fn state(&self) -> PendingQcState {
        self.state
    }

    pub fn strong_sum(&self) -> u64 {
        self.strong_sum
    }

    pub fn weak_sum(&self) -> u64 {
        self.weak_sum
    }

    pub fn is_quorum_met(&self) -> bool {
        self.state.is_quorum_met()
    }

    fn index_of(&self, key: &PublicKey) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }

    /// Existing vote by `key`, if any.
    fn existing(&self, key: &PublicKey) -> Option<VoteKind> {
        self.index_of(key)
            .and_then(|i| self.votes[i].as_ref().map(|(kind, _)| *kind))
    }

    /// Record a verified vote. The key must belong to this policy.
    fn add(&mut self, index: usize, kind: VoteKind, signature: Signature) -> VoteStatus {
        match self.votes[index] {
            Some((existing, _)) if existing == kind => return VoteStatus::Duplicate,
            Some(_) => return VoteStatus::Conflicting,
            None => {}
        }
        self.votes[index] = Some((kind, signature));
        let weight = self.weights[index];

        match kind {
            VoteKind::Strong => {
                self.strong_sum += weight;
                match self.state {
                    PendingQcState::Unrestricted | PendingQcState::Restricted => {
                        if self.strong_sum >= self.threshold {
                            self.state = PendingQcState::Strong;
                        } else if self.weak_sum + self.strong_sum >= self.threshold {
                            self.state = if self.state == PendingQcState::Restricted {
                                PendingQcState::WeakFinal
                            } else {
                                PendingQcState::WeakAchieved
                            };
                        }
                    }
                    PendingQcState::WeakAchieved => {
                        if self.strong_sum >= self.threshold {
                            self.state = PendingQcState::Strong;
                        }
                    }
                    PendingQcState::WeakFinal | PendingQcState::Strong => {}
                }
            }
            VoteKind::Weak => {
                self.weak_sum += weight;
                match self.state {
                    PendingQcState::Unrestricted | PendingQcState::Restricted => {
                        if self.weak_sum + self.strong_sum >= self.threshold {
                            self.state = PendingQcState::WeakAchieved;
                        }
                        if self.weak_sum > self.max_weak_sum {
                            self.state = match self.state {
                                PendingQcState::WeakAchieved => PendingQcState::WeakFinal,
                                PendingQcState::Unrestricted => PendingQcState::Restricted,
                                other => other,
                            };
                        }
                    }
                    PendingQcState::WeakAchieved => {
                        if self.weak_sum >= self.max_weak_sum {
                            self.state = PendingQcState::WeakFinal;
                        }
                    }
                    PendingQcState::WeakFinal | PendingQcState::Strong => {}
                }
            }
        }
        VoteStatus::Success
    }

    /// Build the QC signature for the current state; `None` without quorum.
    pub fn to_qc_sig(&self) -> Option<QcSig> {
        if !self.is_quorum_met() {
            return None;
        }
        let strong_only = self.state == PendingQcState::Strong;
        let n = self.votes.len();
        let mut strong = VoteBitset::new(n);
        let mut weak = VoteBitset::new(n);
        let mut signatures = Vec::new();
        for (i, vote) in self.votes.iter().enumerate() {
            match vote {
                Some((VoteKind::Strong, sig)) => {
                    strong.set(i);
                    signatures.push(*sig);
                }
                Some((VoteKind::Weak, sig)) if !strong_only => {
                    weak.set(i);
                    signatures.push(*sig);
                }
                _ => {}
            }
        }
        let signature = match Signature::aggregate(&signatures) {
            Ok(sig) => sig,
            Err(e) => {
                warn!(error = %e, "Failed to aggregate vote signatures");
                return None;
            }
        };
        Some(QcSig {
            strong_votes: Some(strong),
            weak_votes: (!strong_only).then_some(weak),
            signature,
        })
    }
}

/// The QC under construction for one block.
#[derive(Debug, Clone)]
pub struct OpenQc {
    block_id: BlockId,
    active: OpenQcSig,
    pending: Option<OpenQcSig>,
    /// Strength of the last QC reported as formed.
    reported: Option<bool>,
}

/// A QC that became available or was upgraded to strong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QcUpdate {
    pub block_id: BlockId,
    pub strong: bool,
}

impl OpenQc {
    /// Open a QC for `block`; `None` when finality is not enabled on it.
    pub fn new(block: &BlockState) -> Option<Self> {
        let (active, pending) = block.voting_policies()?;
        Some(Self {
            block_id: block.id(),
            active: OpenQcSig::new(active),
            pending: pending.map(OpenQcSig::new),
            reported: None,
        })
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn active(&self) -> &OpenQcSig {
        &self.active
    }

    pub fn pending(&self) -> Option<&OpenQcSig> {
        self.pending.as_ref()
    }

    pub fn is_quorum_met(&self) -> bool {
        self.active.is_quorum_met() && self.pending.as_ref().map_or(true, |p| p.is_quorum_met())
    }

    pub fn is_strong(&self) -> bool {
        self.active.state == PendingQcState::Strong
            && self
                .pending
                .as_ref()
                .map_or(true, |p| p.state == PendingQcState::Strong)
    }

    /// Checks that do not need the signature: known key, not yet voted.
    pub fn precheck(&self, vote: &Vote) -> Result<(), VoteStatus> {
        let sigs = std::iter::once(&self.active).chain(self.pending.as_ref());
        let mut known = false;
        for sig in sigs {
            if sig.index_of(&vote.finalizer_key).is_none() {
                continue;
            }
            known = true;
            match sig.existing(&vote.finalizer_key) {
                Some(kind) if kind == vote.kind => return Err(VoteStatus::Duplicate),
                Some(_) => return Err(VoteStatus::Conflicting),
                None => {}
            }
        }
        if known {
            Ok(())
        } else {
            Err(VoteStatus::UnknownPublicKey)
        }
    }

    /// Add a vote whose signature has been verified.
    pub fn add_vote(&mut self, vote: &Vote) -> (VoteStatus, Option<QcUpdate>) {
        if let Err(status) = self.precheck(vote) {
            return (status, None);
        }
        let mut status = VoteStatus::UnknownPublicKey;
        let sigs = std::iter::once(&mut self.active).chain(self.pending.as_mut());
        for sig in sigs {
            if let Some(index) = sig.index_of(&vote.finalizer_key) {
                status = sig.add(index, vote.kind, vote.signature);
            }
        }

        let update = if self.is_quorum_met() {
            let strong = self.is_strong();
            let changed = match self.reported {
                None => true,
                Some(was_strong) => strong && !was_strong,
            };
            if changed {
                self.reported = Some(strong);
                Some(QcUpdate {
                    block_id: self.block_id,
                    strong,
                })
            } else {
                None
            }
        } else {
            None
        };
        (status, update)
    }

    /// The best QC available, if quorum is met.
    pub fn qc(&self) -> Option<QuorumCertificate> {
        if !self.is_quorum_met() {
            return None;
        }
        let active_policy_sig = self.active.to_qc_sig()?;
        let pending_policy_sig = match &self.pending {
            Some(p) => Some(p.to_qc_sig()?),
            None => None,
        };
        Some(QuorumCertificate {
            block_id: self.block_id,
            active_policy_sig,
            pending_policy_sig,
        })
    }
}

/// Open QCs for all reversible blocks.
#[derive(Debug, Default)]
pub struct VoteAggregator {
    open: BTreeMap<BlockId, OpenQc>,
}

impl VoteAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start collecting votes for `block`.
    pub fn track(&mut self, block: &BlockState) {
        if self.open.contains_key(&block.id()) {
            return;
        }
        if let Some(open) = OpenQc::new(block) {
            trace!(block_num = block.block_num(), "Tracking votes");
            self.open.insert(block.id(), open);
        }
    }

    pub fn is_tracking(&self, block_id: &BlockId) -> bool {
        self.open.contains_key(block_id)
    }

    pub fn get(&self, block_id: &BlockId) -> Option<&OpenQc> {
        self.open.get(block_id)
    }

    /// Checks run before spending a signature verification on `vote`.
    pub fn precheck(&self, vote: &Vote) -> Result<(), VoteStatus> {
        match self.open.get(&vote.block_id) {
            Some(open) => open.precheck(vote),
            None => Err(VoteStatus::UnknownBlock),
        }
    }

    /// Add a verified vote.
    pub fn add_vote(&mut self, vote: &Vote) -> (VoteStatus, Option<QcUpdate>) {
        let Some(open) = self.open.get_mut(&vote.block_id) else {
            return (VoteStatus::UnknownBlock, None);
        };
        let (status, update) = open.add_vote(vote);
        if let Some(update) = &update {
            debug!(
                block_num = vote.block_num(),
                strong = update.strong,
                active_strong = open.active.strong_sum,
                active_weak = open.active.weak_sum,
                "QC available"
            );
        }
        (status, update)
    }

    /// The QC on `block_id`, if quorum is met.
    pub fn qc(&self, block_id: &BlockId) -> Option<QuorumCertificate> {
        self.open.get(block_id).and_then(OpenQc::qc)
    }

    /// Drop QCs for blocks at or below `block_num`.
    pub fn prune_at_or_below(&mut self, block_num: BlockNum) {
        self.open.retain(|id, _| id.block_num() > block_num);
    }

    pub fn remove(&mut self, block_id: &BlockId) {
        self.open.remove(block_id);
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_state::test_chain::extend;
    use keel_types::test_utils::{test_genesis, test_key, test_policy};
    use keel_types::{FinalizerAuthority, KeyPair};

    fn keys() -> Vec<KeyPair> {
        (0..4).map(test_key).collect()
    }

    fn vote(key: &KeyPair, block: &BlockState, kind: VoteKind) -> Vote {
        Vote::sign(key, block.id(), block.strong_digest(), kind)
    }

    #[test]
    fn test_strong_quorum_forms_strong_qc() {
        let keys = keys();
        let block = BlockState::genesis(&test_genesis(1, &keys));
        let mut open = OpenQc::new(&block).unwrap();

        assert_eq!(open.add_vote(&vote(&keys[0], &block, VoteKind::Strong)).1, None);
        assert_eq!(open.add_vote(&vote(&keys[1], &block, VoteKind::Strong)).1, None);
        let (status, update) = open.add_vote(&vote(&keys[2], &block, VoteKind::Strong));
        assert_eq!(status, VoteStatus::Success);
        assert_eq!(
            update,
            Some(QcUpdate {
                block_id: block.id(),
                strong: true
            })
        );

        let qc = open.qc().unwrap();
        assert!(qc.is_strong());
        let policy = block.active_finalizer_policy().unwrap();
        qc.verify(policy, None, block.strong_digest()).unwrap();
    }

    #[test]
    fn test_weak_qc_then_upgrade() {
        let keys = keys();
        let block = BlockState::genesis(&test_genesis(1, &keys));
        let mut open = OpenQc::new(&block).unwrap();
        // threshold 3 of 4, max_weak 1.
        open.add_vote(&vote(&keys[0], &block, VoteKind::Strong));
        open.add_vote(&vote(&keys[1], &block, VoteKind::Strong));
        let (_, update) = open.add_vote(&vote(&keys[2], &block, VoteKind::Weak));
        assert_eq!(update.map(|u| u.strong), Some(false));
        assert_eq!(open.active().state(), PendingQcState::WeakAchieved);

        let qc = open.qc().unwrap();
        assert!(!qc.is_strong());
        qc.verify(block.active_finalizer_policy().unwrap(), None, block.strong_digest())
            .unwrap();

        let (_, update) = open.add_vote(&vote(&keys[3], &block, VoteKind::Strong));
        assert_eq!(update.map(|u| u.strong), Some(true));
        assert!(open.qc().unwrap().is_strong());
    }

    #[test]
    fn test_weak_final_cannot_upgrade() {
        // Seven equal finalizers: threshold 5, max_weak 2.
        let keys: Vec<KeyPair> = (0..7).map(test_key).collect();
        let block = BlockState::genesis(&test_genesis(1, &keys));
        let mut open = OpenQc::new(&block).unwrap();
        for k in &keys[0..3] {
            open.add_vote(&vote(k, &block, VoteKind::Strong));
        }
        open.add_vote(&vote(&keys[3], &block, VoteKind::Weak));
        let (_, update) = open.add_vote(&vote(&keys[4], &block, VoteKind::Weak));
        assert_eq!(update.map(|u| u.strong), Some(false));
        assert_eq!(open.active().state(), PendingQcState::WeakAchieved);

        open.add_vote(&vote(&keys[5], &block, VoteKind::Weak));
        assert_eq!(open.active().state(), PendingQcState::WeakFinal);
        let (_, update) = open.add_vote(&vote(&keys[6], &block, VoteKind::Strong));
        assert!(update.is_none());
        assert!(!open.is_strong());
        open.qc()
            .unwrap()
            .verify(block.active_finalizer_policy().unwrap(), None, block.strong_digest())
            .unwrap();
    }

    #[test]
    fn test_too_many_weak_votes_restrict() {
        let keys = keys();
        let block = BlockState::genesis(&test_genesis(1, &keys));
        let mut open = OpenQc::new(&block).unwrap();
        open.add_vote(&vote(&keys[0], &block, VoteKind::Weak));
        assert_eq!(open.active().state(), PendingQcState::Unrestricted);
        open.add_vote(&vote(&keys[1], &block, VoteKind::Weak));
        assert_eq!(open.active().state(), PendingQcState::Restricted);
        open.add_vote(&vote(&keys[2], &block, VoteKind::Strong));
        assert_eq!(open.active().state(), PendingQcState::WeakFinal);
    }

    #[test]
    fn test_duplicate_conflicting_and_unknown() {
        let keys = keys();
        let block = BlockState::genesis(&test_genesis(1, &keys));
        let mut open = OpenQc::new(&block).unwrap();
        let v = vote(&keys[0], &block, VoteKind::Strong);
        assert_eq!(open.add_vote(&v).0, VoteStatus::Success);
        assert_eq!(open.add_vote(&v).0, VoteStatus::Duplicate);
        assert_eq!(
            open.add_vote(&vote(&keys[0], &block, VoteKind::Weak)).0,
            VoteStatus::Conflicting
        );
        assert_eq!(
            open.precheck(&vote(&test_key(9), &block, VoteKind::Strong)),
            Err(VoteStatus::UnknownPublicKey)
        );
    }

    #[test]
    fn test_dual_policy_needs_both_quorums() {
        let old_keys = keys();
        let new_keys: Vec<KeyPair> = (10..14).map(test_key).collect();
        let genesis = BlockState::genesis(&test_genesis(1, &old_keys));

        // Propose the new policy, then build until it is pending.
        let block = crate::block_state::test_chain::child_block(
            &genesis,
            genesis.latest_qc_claim(),
            None,
            Some(test_policy(2, &new_keys)),
        );
        let mut state = genesis.next(block, 2).unwrap();
        while state.pending_finalizer_policy().is_none() {
            state = crate::block_state::test_chain::extend_with_qc(&state, &old_keys);
        }
        let mut open = OpenQc::new(&state).unwrap();
        assert!(open.pending().is_some());

        for k in &old_keys[0..3] {
            open.add_vote(&vote(k, &state, VoteKind::Strong));
        }
        assert!(!open.is_quorum_met());
        for k in &new_keys[0..3] {
            open.add_vote(&vote(k, &state, VoteKind::Strong));
        }
        assert!(open.is_quorum_met());
        let qc = open.qc().unwrap();
        qc.verify(
            state.active_finalizer_policy().unwrap(),
            state.pending_finalizer_policy().map(|p| p.policy.as_ref()),
            state.strong_digest(),
        )
        .unwrap();
    }

    #[test]
    fn test_weighted_policy() {
        let keys = keys();
        let policy = FinalizerPolicy {
            generation: 1,
            threshold: 6,
            finalizers: keys
                .iter()
                .enumerate()
                .map(|(i, k)| FinalizerAuthority {
                    description: format!("f{i}"),
                    weight: if i == 0 { 5 } else { 1 },
                    public_key: k.public_key(),
                })
                .collect(),
        };
        let mut sig = OpenQcSig::new(&policy);
        sig.add(0, VoteKind::Strong, Signature::zero());
        assert!(!sig.is_quorum_met());
        sig.add(1, VoteKind::Strong, Signature::zero());
        assert_eq!(sig.state(), PendingQcState::Strong);
    }

    #[test]
    fn test_aggregator_prunes() {
        let keys = keys();
        let genesis = BlockState::genesis(&test_genesis(1, &keys));
        let b2 = extend(&genesis);
        let mut agg = VoteAggregator::new();
        agg.track(&genesis);
        agg.track(&b2);
        assert_eq!(agg.len(), 2);
        assert_eq!(
            agg.precheck(&vote(&keys[0], &extend(&b2), VoteKind::Strong)),
            Err(VoteStatus::UnknownBlock)
        );
        agg.prune_at_or_below(1);
        assert_eq!(agg.len(), 1);
        assert!(agg.is_tracking(&b2.id()));
    }
}
