//! Per-block consensus state.
//!
//! A [`BlockState`] is everything the engine knows about a block once it has
//! been validated against its parent: the finality core, the finalizer and
//! proposer policies in force, the protocol phase and the digests finalizers
//! sign. States are immutable and shared via `Arc`; the only way to make a
//! new one is [`BlockState::next`].

use crate::finality_core::{CoreError, FinalityCore};
use crate::policy::{evaluate_policy_promotion, ProtocolPhase, TrackedPolicy};
use crate::schedule::{proposer_policy_activation, scheduled_producer};
use keel_types::{
    finality_digest, weak_digest, BlockHeader, BlockId, BlockNum, BlockRef, BlockTimestamp,
    FinalizerPolicy, Genesis, Hash, PolicyError, ProducerName, ProposerPolicy, QcClaim,
    SignedBlock, VoteKind,
};
use sbor::prelude::BasicSbor;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

/// Reasons a block is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("block does not build on {expected:?} (previous is {got:?})")]
    ParentMismatch { expected: BlockId, got: BlockId },

    #[error("block number {got} does not follow parent {parent}")]
    NonSequentialNumber { parent: BlockNum, got: BlockNum },

    #[error("timestamp {got} not after parent timestamp {parent}")]
    TimestampNotIncreasing {
        parent: BlockTimestamp,
        got: BlockTimestamp,
    },

    #[error("slot belongs to {expected:?}, block produced by {got:?}")]
    WrongProducer {
        expected: Option<ProducerName>,
        got: ProducerName,
    },

    #[error("invalid qc claim: {0}")]
    InvalidClaim(#[from] CoreError),

    #[error("qc claim {claim:?} made before finality is enabled")]
    ClaimWithoutFinality { claim: QcClaim },

    #[error("claim {claim:?} advances without a qc")]
    MissingQc { claim: QcClaim },

    #[error("qc {qc:?} does not match claim {claim:?}")]
    QcClaimMismatch { claim: QcClaim, qc: QcClaim },

    #[error("qc attached while finality is not enabled")]
    UnexpectedQc,

    #[error("qc certifies {got:?}, branch has {expected:?}")]
    QcBlockMismatch { expected: BlockId, got: BlockId },

    #[error("qc target block {0} is not known on this branch")]
    QcTargetUnknown(BlockNum),

    #[error("invalid qc: {0}")]
    InvalidQc(#[from] keel_types::QcError),

    #[error("invalid finalizer policy: {0}")]
    InvalidFinalizerPolicy(PolicyError),

    #[error("finalizer policy generation {got} not above {latest}")]
    StaleFinalizerPolicy { got: u32, latest: u32 },

    #[error("invalid proposer policy: {0}")]
    InvalidProposerPolicy(PolicyError),

    #[error("proposer policy version {got} not above {latest}")]
    StaleProposerPolicy { got: u32, latest: u32 },
}

/// A proposer policy waiting for its activation slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingProposerPolicy {
    pub activation: BlockTimestamp,
    pub policy: Arc<ProposerPolicy>,
}

/// One block's producer, used for producer-confirmation irreversibility
/// before finality is active.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ProducerConfirmation {
    pub block_num: BlockNum,
    pub producer: ProducerName,
}

#[derive(Debug, Clone)]
pub struct BlockState {
    id: BlockId,
    block: Arc<SignedBlock>,
    core: FinalityCore,
    phase: ProtocolPhase,
    /// First block carrying a meaningful finality core.
    finality_genesis: Option<BlockNum>,

    active_finalizer_policy: Option<Arc<FinalizerPolicy>>,
    pending_finalizer_policy: Option<TrackedPolicy>,
    proposed_finalizer_policies: Vec<TrackedPolicy>,
    last_finalizer_policy_generation: u32,

    active_proposer_policy: Arc<ProposerPolicy>,
    pending_proposer_policy: Option<PendingProposerPolicy>,
    last_proposer_policy_version: u32,

    confirmations: Vec<ProducerConfirmation>,
    confirmed_block_num: BlockNum,

    strong_digest: Hash,
    weak_digest: Hash,
}

impl BlockState {
    /// Header of the genesis block described by `genesis`.
    pub fn genesis_block(genesis: &Genesis) -> SignedBlock {
        let mut proposer_policy = ProposerPolicy::new(0, genesis.initial_producers.clone());
        proposer_policy.proposal_time = genesis.initial_timestamp;
        let producer = scheduled_producer(&proposer_policy, genesis.initial_timestamp)
            .cloned()
            .unwrap_or_else(|| ProducerName::new(""));

        SignedBlock::new(
            BlockHeader {
                block_num: 1,
                previous: BlockId::NONE,
                timestamp: genesis.initial_timestamp,
                producer,
                qc_claim: QcClaim::new(1, false),
                new_finalizer_policy: genesis.initial_finalizer_policy.clone(),
                new_proposer_policy: Some(proposer_policy),
                payload_root: genesis.chain_id().0,
            },
            None,
        )
    }

    /// State of the genesis block. Finality is active from genesis when the
    /// genesis carries a finalizer policy.
    pub fn genesis(genesis: &Genesis) -> Self {
        let block = Arc::new(Self::genesis_block(genesis));
        let id = block.id();
        let timestamp = genesis.initial_timestamp;
        let mut proposer_policy = ProposerPolicy::new(0, genesis.initial_producers.clone());
        proposer_policy.proposal_time = timestamp;

        let (phase, active, finality_genesis, generation) = match &genesis.initial_finalizer_policy
        {
            Some(policy) => (
                ProtocolPhase::Active,
                Some(Arc::new(policy.clone())),
                Some(1),
                policy.generation,
            ),
            None => (ProtocolPhase::NoPolicy, None, None, 0),
        };

        let mut state = Self {
            id,
            block,
            core: FinalityCore::genesis(1, timestamp),
            phase,
            finality_genesis,
            active_finalizer_policy: active,
            pending_finalizer_policy: None,
            proposed_finalizer_policies: Vec::new(),
            last_finalizer_policy_generation: generation,
            active_proposer_policy: Arc::new(proposer_policy),
            pending_proposer_policy: None,
            last_proposer_policy_version: 0,
            confirmations: Vec::new(),
            confirmed_block_num: 1,
            strong_digest: Hash::ZERO,
            weak_digest: Hash::ZERO,
        };
        state.compute_digests();
        state
    }

    /// Validate `block` against `self` (its parent) and build its state.
    ///
    /// A QC carried by the block must already have been verified against the
    /// claimed ancestor; this checks only that it matches the header claim.
    pub fn next(
        &self,
        block: Arc<SignedBlock>,
        commit_chain_length: u32,
    ) -> Result<BlockState, BlockError> {
        let header = &block.header;
        let block_num = header.block_num;
        let timestamp = header.timestamp;

        if header.previous != self.id {
            return Err(BlockError::ParentMismatch {
                expected: self.id,
                got: header.previous,
            });
        }
        if block_num != self.block_num() + 1 {
            return Err(BlockError::NonSequentialNumber {
                parent: self.block_num(),
                got: block_num,
            });
        }
        if timestamp <= self.timestamp() {
            return Err(BlockError::TimestampNotIncreasing {
                parent: self.timestamp(),
                got: timestamp,
            });
        }

        // ═══════════════════════════════════════════════════════════════════
        // Producer schedule
        // ═══════════════════════════════════════════════════════════════════
        let mut active_proposer_policy = self.active_proposer_policy.clone();
        let mut pending_proposer_policy = self.pending_proposer_policy.clone();
        if pending_proposer_policy
            .as_ref()
            .is_some_and(|p| timestamp >= p.activation)
        {
            if let Some(p) = pending_proposer_policy.take() {
                active_proposer_policy = p.policy;
            }
        }

        let expected = scheduled_producer(&active_proposer_policy, timestamp);
        if expected != Some(&header.producer) {
            return Err(BlockError::WrongProducer {
                expected: expected.cloned(),
                got: header.producer.clone(),
            });
        }

        let mut last_proposer_policy_version = self.last_proposer_policy_version;
        if let Some(proposed) = &header.new_proposer_policy {
            proposed
                .validate()
                .map_err(BlockError::InvalidProposerPolicy)?;
            if proposed.version <= last_proposer_policy_version {
                return Err(BlockError::StaleProposerPolicy {
                    got: proposed.version,
                    latest: last_proposer_policy_version,
                });
            }
            let mut policy = proposed.clone();
            policy.proposal_time = timestamp;
            last_proposer_policy_version = policy.version;
            pending_proposer_policy = Some(PendingProposerPolicy {
                activation: proposer_policy_activation(&active_proposer_policy, timestamp),
                policy: Arc::new(policy),
            });
        }

        // ═══════════════════════════════════════════════════════════════════
        // QC claim and finality core
        // ═══════════════════════════════════════════════════════════════════
        let claim = header.qc_claim;
        let parent_claim = self.core.latest_qc_claim();
        let mut core = if self.phase == ProtocolPhase::NoPolicy {
            if claim != parent_claim {
                return Err(BlockError::ClaimWithoutFinality { claim });
            }
            if block.qc.is_some() {
                return Err(BlockError::UnexpectedQc);
            }
            FinalityCore::genesis(block_num, timestamp)
        } else {
            match &block.qc {
                Some(qc) if qc.to_claim() != claim => {
                    return Err(BlockError::QcClaimMismatch {
                        claim,
                        qc: qc.to_claim(),
                    })
                }
                None if claim != parent_claim => return Err(BlockError::MissingQc { claim }),
                _ => {}
            }
            self.core
                .next(self.block_ref(), claim, commit_chain_length)?
        };

        // ═══════════════════════════════════════════════════════════════════
        // Producer confirmations (irreversibility before finality)
        // ═══════════════════════════════════════════════════════════════════
        let (confirmations, confirmed_block_num) = if self.phase == ProtocolPhase::Active {
            (Vec::new(), self.confirmed_block_num)
        } else {
            let mut confirmations = self.confirmations.clone();
            confirmations.push(ProducerConfirmation {
                block_num,
                producer: header.producer.clone(),
            });
            let threshold = active_proposer_policy.producers.len() * 2 / 3 + 1;
            let confirmed = confirmed_by_producers(&confirmations, threshold)
                .unwrap_or(0)
                .max(self.confirmed_block_num);
            confirmations.retain(|c| c.block_num > confirmed);
            (confirmations, confirmed)
        };

        // ═══════════════════════════════════════════════════════════════════
        // Finalizer policies
        // ═══════════════════════════════════════════════════════════════════
        let mut proposed = self.proposed_finalizer_policies.clone();
        let mut last_finalizer_policy_generation = self.last_finalizer_policy_generation;
        if let Some(policy) = &header.new_finalizer_policy {
            policy
                .validate()
                .map_err(BlockError::InvalidFinalizerPolicy)?;
            if policy.generation <= last_finalizer_policy_generation {
                return Err(BlockError::StaleFinalizerPolicy {
                    got: policy.generation,
                    latest: last_finalizer_policy_generation,
                });
            }
            last_finalizer_policy_generation = policy.generation;
            proposed.push(TrackedPolicy::new(block_num, Arc::new(policy.clone())));
        }

        let lib = match self.phase {
            ProtocolPhase::Active => core.last_final_block_num(),
            _ => confirmed_block_num,
        };
        let promotion = evaluate_policy_promotion(
            self.active_finalizer_policy.as_ref(),
            self.pending_finalizer_policy.as_ref(),
            &proposed,
            lib,
            block_num,
        );

        let mut phase = self.phase;
        let mut finality_genesis = self.finality_genesis;
        match self.phase {
            ProtocolPhase::NoPolicy if promotion.pending.is_some() => {
                phase = ProtocolPhase::ActivationPending;
                finality_genesis = Some(block_num);
                core = FinalityCore::genesis(block_num, timestamp);
            }
            ProtocolPhase::ActivationPending if promotion.activated => {
                phase = ProtocolPhase::Active;
            }
            _ => {}
        }

        let mut state = BlockState {
            id: block.id(),
            block,
            core,
            phase,
            finality_genesis,
            active_finalizer_policy: promotion.active,
            pending_finalizer_policy: promotion.pending,
            proposed_finalizer_policies: promotion.proposed,
            last_finalizer_policy_generation,
            active_proposer_policy,
            pending_proposer_policy,
            last_proposer_policy_version,
            confirmations,
            confirmed_block_num,
            strong_digest: Hash::ZERO,
            weak_digest: Hash::ZERO,
        };
        state.compute_digests();
        Ok(state)
    }

    fn compute_digests(&mut self) {
        self.strong_digest = match self.voting_policies() {
            Some((active, pending)) => {
                let pending_digest = pending.map(|p| p.digest());
                finality_digest(&self.id, &active.digest(), pending_digest.as_ref())
            }
            None => Hash::ZERO,
        };
        self.weak_digest = weak_digest(&self.strong_digest);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn block(&self) -> &Arc<SignedBlock> {
        &self.block
    }

    pub fn header(&self) -> &BlockHeader {
        &self.block.header
    }

    pub fn block_num(&self) -> BlockNum {
        self.block.header.block_num
    }

    pub fn previous(&self) -> BlockId {
        self.block.header.previous
    }

    pub fn timestamp(&self) -> BlockTimestamp {
        self.block.header.timestamp
    }

    pub fn producer(&self) -> &ProducerName {
        &self.block.header.producer
    }

    pub fn core(&self) -> &FinalityCore {
        &self.core
    }

    pub fn phase(&self) -> ProtocolPhase {
        self.phase
    }

    pub fn finality_genesis(&self) -> Option<BlockNum> {
        self.finality_genesis
    }

    pub fn active_finalizer_policy(&self) -> Option<&Arc<FinalizerPolicy>> {
        self.active_finalizer_policy.as_ref()
    }

    pub fn pending_finalizer_policy(&self) -> Option<&TrackedPolicy> {
        self.pending_finalizer_policy.as_ref()
    }

    pub fn proposed_finalizer_policies(&self) -> &[TrackedPolicy] {
        &self.proposed_finalizer_policies
    }

    pub fn last_finalizer_policy_generation(&self) -> u32 {
        self.last_finalizer_policy_generation
    }

    pub fn active_proposer_policy(&self) -> &Arc<ProposerPolicy> {
        &self.active_proposer_policy
    }

    pub fn pending_proposer_policy(&self) -> Option<&PendingProposerPolicy> {
        self.pending_proposer_policy.as_ref()
    }

    pub fn last_proposer_policy_version(&self) -> u32 {
        self.last_proposer_policy_version
    }

    pub fn strong_digest(&self) -> &Hash {
        &self.strong_digest
    }

    pub fn weak_digest(&self) -> &Hash {
        &self.weak_digest
    }

    pub fn digest_for(&self, kind: VoteKind) -> &Hash {
        match kind {
            VoteKind::Strong => &self.strong_digest,
            VoteKind::Weak => &self.weak_digest,
        }
    }

    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            block_id: self.id,
            timestamp: self.timestamp(),
            finality_digest: self.strong_digest,
        }
    }

    pub fn latest_qc_claim(&self) -> QcClaim {
        self.core.latest_qc_claim()
    }

    /// Reference to this block or a reversible ancestor tracked by the core.
    pub fn ancestor_ref(&self, block_num: BlockNum) -> Option<BlockRef> {
        if block_num == self.block_num() {
            return Some(self.block_ref());
        }
        self.core.get_block_reference(block_num).copied()
    }

    /// Whether finalizers vote on this block.
    pub fn is_finality_enabled(&self) -> bool {
        self.phase != ProtocolPhase::NoPolicy
    }

    /// Policies whose finalizers vote on this block: `(active, pending)`.
    ///
    /// While the first policy awaits activation it is the only voting policy.
    pub fn voting_policies(&self) -> Option<(&FinalizerPolicy, Option<&FinalizerPolicy>)> {
        match self.phase {
            ProtocolPhase::NoPolicy => None,
            ProtocolPhase::ActivationPending => self
                .pending_finalizer_policy
                .as_ref()
                .map(|p| (p.policy.as_ref(), None)),
            ProtocolPhase::Active => self.active_finalizer_policy.as_deref().map(|active| {
                (
                    active,
                    self.pending_finalizer_policy
                        .as_ref()
                        .map(|p| p.policy.as_ref()),
                )
            }),
        }
    }

    /// Irreversible block number as seen by this block.
    pub fn irreversible_block_num(&self) -> BlockNum {
        match self.phase {
            ProtocolPhase::Active => self.core.last_final_block_num(),
            _ => self.confirmed_block_num,
        }
    }

    /// Block that becomes final once a strong QC on this block exists.
    pub fn final_on_strong_qc(&self, commit_chain_length: u32) -> BlockNum {
        self.core.final_on_strong_qc(commit_chain_length)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Snapshots
    // ═══════════════════════════════════════════════════════════════════════

    pub fn to_snapshot(&self) -> BlockStateSnapshot {
        let tracked = |p: &TrackedPolicy| SnapshotPolicy {
            block_num: p.block_num,
            policy: p.policy.as_ref().clone(),
        };
        BlockStateSnapshot {
            block: self.block.as_ref().clone(),
            core: self.core.clone(),
            phase: self.phase,
            finality_genesis: self.finality_genesis,
            active_finalizer_policy: self.active_finalizer_policy.as_deref().cloned(),
            pending_finalizer_policy: self.pending_finalizer_policy.as_ref().map(tracked),
            proposed_finalizer_policies: self
                .proposed_finalizer_policies
                .iter()
                .map(tracked)
                .collect(),
            last_finalizer_policy_generation: self.last_finalizer_policy_generation,
            active_proposer_policy: self.active_proposer_policy.as_ref().clone(),
            pending_proposer_policy: self
                .pending_proposer_policy
                .as_ref()
                .map(|p| (p.activation, p.policy.as_ref().clone())),
            last_proposer_policy_version: self.last_proposer_policy_version,
            confirmations: self.confirmations.clone(),
            confirmed_block_num: self.confirmed_block_num,
        }
    }

    pub fn from_snapshot(snapshot: BlockStateSnapshot) -> Self {
        let tracked =
            |p: SnapshotPolicy| TrackedPolicy::new(p.block_num, Arc::new(p.policy));
        let block = Arc::new(snapshot.block);
        let mut state = Self {
            id: block.id(),
            block,
            core: snapshot.core,
            phase: snapshot.phase,
            finality_genesis: snapshot.finality_genesis,
            active_finalizer_policy: snapshot.active_finalizer_policy.map(Arc::new),
            pending_finalizer_policy: snapshot.pending_finalizer_policy.map(tracked),
            proposed_finalizer_policies: snapshot
                .proposed_finalizer_policies
                .into_iter()
                .map(tracked)
                .collect(),
            last_finalizer_policy_generation: snapshot.last_finalizer_policy_generation,
            active_proposer_policy: Arc::new(snapshot.active_proposer_policy),
            pending_proposer_policy: snapshot.pending_proposer_policy.map(|(activation, p)| {
                PendingProposerPolicy {
                    activation,
                    policy: Arc::new(p),
                }
            }),
            last_proposer_policy_version: snapshot.last_proposer_policy_version,
            confirmations: snapshot.confirmations,
            confirmed_block_num: snapshot.confirmed_block_num,
            strong_digest: Hash::ZERO,
            weak_digest: Hash::ZERO,
        };
        state.compute_digests();
        state
    }
}

/// Highest block confirmed by `threshold` distinct producers building on it.
fn confirmed_by_producers(
    confirmations: &[ProducerConfirmation],
    threshold: usize,
) -> Option<BlockNum> {
    let mut producers = BTreeSet::new();
    for c in confirmations.iter().rev() {
        producers.insert(&c.producer);
        if producers.len() >= threshold {
            return Some(c.block_num.saturating_sub(1));
        }
    }
    None
}

/// Owned, encodable form of a [`BlockState`].
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct BlockStateSnapshot {
    pub block: SignedBlock,
    pub core: FinalityCore,
    pub phase: ProtocolPhase,
    pub finality_genesis: Option<BlockNum>,
    pub active_finalizer_policy: Option<FinalizerPolicy>,
    pub pending_finalizer_policy: Option<SnapshotPolicy>,
    pub proposed_finalizer_policies: Vec<SnapshotPolicy>,
    pub last_finalizer_policy_generation: u32,
    pub active_proposer_policy: ProposerPolicy,
    pub pending_proposer_policy: Option<(BlockTimestamp, ProposerPolicy)>,
    pub last_proposer_policy_version: u32,
    pub confirmations: Vec<ProducerConfirmation>,
    pub confirmed_block_num: BlockNum,
}

#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct SnapshotPolicy {
    pub block_num: BlockNum,
    pub policy: FinalizerPolicy,
}

#[cfg(test)]
pub(crate) mod test_chain {
    //! Helpers to build valid chains of block states in tests.

    use super::*;
    use keel_types::{KeyPair, QuorumCertificate};

    /// Block on `parent` in the next slot owned by its scheduled producer.
    pub fn child_block(
        parent: &BlockState,
        claim: QcClaim,
        qc: Option<QuorumCertificate>,
        new_finalizer_policy: Option<FinalizerPolicy>,
    ) -> Arc<SignedBlock> {
        child_block_at(parent, parent.timestamp().next(), claim, qc, new_finalizer_policy)
    }

    pub fn child_block_at(
        parent: &BlockState,
        timestamp: BlockTimestamp,
        claim: QcClaim,
        qc: Option<QuorumCertificate>,
        new_finalizer_policy: Option<FinalizerPolicy>,
    ) -> Arc<SignedBlock> {
        let policy = match parent.pending_proposer_policy() {
            Some(p) if timestamp >= p.activation => p.policy.clone(),
            _ => parent.active_proposer_policy().clone(),
        };
        let producer = scheduled_producer(&policy, timestamp)
            .cloned()
            .unwrap_or_else(|| ProducerName::new(""));
        Arc::new(SignedBlock::new(
            BlockHeader {
                block_num: parent.block_num() + 1,
                previous: parent.id(),
                timestamp,
                producer,
                qc_claim: claim,
                new_finalizer_policy,
                new_proposer_policy: None,
                payload_root: Hash::ZERO,
            },
            qc,
        ))
    }

    /// Child that repeats the parent's claim.
    pub fn extend(parent: &BlockState) -> BlockState {
        let block = child_block(parent, parent.latest_qc_claim(), None, None);
        parent.next(block, 2).unwrap()
    }

    /// Strong QC on `target` signed by every key in `keys`.
    pub fn strong_qc(target: &BlockState, keys: &[KeyPair]) -> QuorumCertificate {
        crate::aggregator::test_support::build_qc(target, keys, VoteKind::Strong)
    }

    /// Child claiming a strong QC on its parent.
    pub fn extend_with_qc(parent: &BlockState, keys: &[KeyPair]) -> BlockState {
        let qc = strong_qc(parent, keys);
        let block = child_block(parent, qc.to_claim(), Some(qc), None);
        parent.next(block, 2).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_chain::*;
    use super::*;
    use keel_types::test_utils::{test_genesis, test_key, test_policy};

    fn keys() -> Vec<keel_types::KeyPair> {
        (0..4).map(test_key).collect()
    }

    #[test]
    fn test_genesis_with_policy_is_active() {
        let state = BlockState::genesis(&test_genesis(1, &keys()));
        assert_eq!(state.block_num(), 1);
        assert_eq!(state.phase(), ProtocolPhase::Active);
        assert_eq!(state.finality_genesis(), Some(1));
        assert!(!state.strong_digest().is_zero());
        assert_eq!(state.irreversible_block_num(), 1);
    }

    #[test]
    fn test_genesis_without_policy() {
        let state = BlockState::genesis(&test_genesis(1, &[]));
        assert_eq!(state.phase(), ProtocolPhase::NoPolicy);
        assert!(state.voting_policies().is_none());
        assert!(state.strong_digest().is_zero());
    }

    #[test]
    fn test_next_rejects_wrong_parent_and_timestamp() {
        let genesis = BlockState::genesis(&test_genesis(1, &keys()));
        let child = extend(&genesis);

        let block = child_block(&child, child.latest_qc_claim(), None, None);
        assert!(matches!(
            genesis.next(block, 2),
            Err(BlockError::ParentMismatch { .. })
        ));

        let block = child_block_at(&child, child.timestamp(), child.latest_qc_claim(), None, None);
        assert!(matches!(
            child.next(block, 2),
            Err(BlockError::TimestampNotIncreasing { .. })
        ));
    }

    #[test]
    fn test_next_rejects_wrong_producer() {
        let genesis = BlockState::genesis(&test_genesis(2, &keys()));
        let mut block = (*child_block(&genesis, genesis.latest_qc_claim(), None, None)).clone();
        block.header.producer = ProducerName::new("mallory");
        assert!(matches!(
            genesis.next(Arc::new(block), 2),
            Err(BlockError::WrongProducer { .. })
        ));
    }

    #[test]
    fn test_claim_advance_requires_qc() {
        let genesis = BlockState::genesis(&test_genesis(1, &keys()));
        let block = child_block(&genesis, QcClaim::new(1, true), None, None);
        assert!(matches!(
            genesis.next(block, 2),
            Err(BlockError::MissingQc { .. })
        ));
    }

    #[test]
    fn test_strong_qcs_advance_lib() {
        let keys = keys();
        let genesis = BlockState::genesis(&test_genesis(1, &keys));
        let b2 = extend_with_qc(&genesis, &keys);
        let b3 = extend_with_qc(&b2, &keys);
        let b4 = extend_with_qc(&b3, &keys);
        assert_eq!(b2.irreversible_block_num(), 1);
        assert_eq!(b3.irreversible_block_num(), 1);
        assert_eq!(b4.irreversible_block_num(), 2);
        assert_eq!(b4.final_on_strong_qc(2), 3);
        assert_eq!(b4.ancestor_ref(3), Some(b3.block_ref()));
    }

    #[test]
    fn test_no_policy_confirmation_lib() {
        // Single producer: every block confirms its parent.
        let genesis = BlockState::genesis(&test_genesis(1, &[]));
        let b2 = extend(&genesis);
        let b3 = extend(&b2);
        assert_eq!(b3.irreversible_block_num(), 2);
        assert_eq!(b3.phase(), ProtocolPhase::NoPolicy);
    }

    #[test]
    fn test_first_policy_activation_path() {
        let keys = keys();
        let genesis = BlockState::genesis(&test_genesis(1, &[]));
        // Block 2 proposes the first policy.
        let block = child_block(
            &genesis,
            genesis.latest_qc_claim(),
            None,
            Some(test_policy(1, &keys)),
        );
        let b2 = genesis.next(block, 2).unwrap();
        assert_eq!(b2.phase(), ProtocolPhase::NoPolicy);
        assert_eq!(b2.proposed_finalizer_policies().len(), 1);

        // Block 3 sees block 2 irreversible: policy becomes pending here.
        let b3 = extend(&b2);
        assert_eq!(b3.phase(), ProtocolPhase::ActivationPending);
        assert_eq!(b3.finality_genesis(), Some(3));
        assert!(b3.voting_policies().is_some());
        assert!(!b3.strong_digest().is_zero());

        // Block 4 sees block 3 irreversible: finality becomes active.
        let b4 = extend(&b3);
        assert_eq!(b4.phase(), ProtocolPhase::Active);
        assert_eq!(b4.active_finalizer_policy().unwrap().generation, 1);
        assert!(b4.pending_finalizer_policy().is_none());
        assert_eq!(b4.irreversible_block_num(), 3);
    }

    #[test]
    fn test_snapshot_restores_identical_state() {
        let keys = keys();
        let genesis = BlockState::genesis(&test_genesis(1, &keys));
        let b3 = extend_with_qc(&extend_with_qc(&genesis, &keys), &keys);
        let restored = BlockState::from_snapshot(b3.to_snapshot());
        assert_eq!(restored.id(), b3.id());
        assert_eq!(restored.core(), b3.core());
        assert_eq!(restored.strong_digest(), b3.strong_digest());
        assert_eq!(restored.to_snapshot(), b3.to_snapshot());
    }
}
