//! Finality engine state machine.
//!
//! [`BftState`] owns the fork database, the vote aggregator and the local
//! finalizers. It is the single writer of LIB and of the finalizer safety
//! records; all I/O is returned as [`Action`]s.

use crate::aggregator::VoteAggregator;
use crate::block_state::{BlockError, BlockState};
use crate::config::BftConfig;
use crate::fork_db::{Branch, ForkDatabase};
use crate::policy::{ProtocolPhase, TrackedPolicy};
use crate::safety::MyFinalizers;
use crate::schedule::{next_scheduled_slot, scheduled_producer};
use crate::snapshot::{ChainSnapshot, SnapshotError};
use crate::sync::{OrphanPool, SyncTracker};
use crate::vote_buffer::VoteBuffer;
use keel_core::{
    Action, Event, NodeIndex, Notification, OutboundMessage, SubStateMachine, TimerId, VoteStatus,
};
use keel_types::{
    BlockHeader, BlockId, BlockNum, BlockTimestamp, ChainId, FinalizerPolicy, FinalizerSafetyInfo,
    Genesis, Hash, KeyPair, ProducerName, ProposerPolicy, PublicKey, QcClaim, QuorumCertificate,
    SignedBlock, Vote,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

/// Minimum spacing between identical sync requests.
const SYNC_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// BFT statistics for monitoring.
#[derive(Clone, Copy, Debug, Default)]
pub struct BftStats {
    pub blocks_applied: u64,
    pub blocks_rejected: u64,
    pub votes_cast: u64,
    pub votes_aggregated: u64,
    pub qcs_formed: u64,
    pub fork_switches: u64,
    pub lib: BlockNum,
    pub head: BlockNum,
}

/// State recovered from storage on startup.
///
/// For a fresh start, use `RecoveredState::default()`.
#[derive(Debug, Clone, Default)]
pub struct RecoveredState {
    /// Snapshot to start from instead of genesis.
    pub snapshot: Option<ChainSnapshot>,

    /// Block log entries above the starting root, ascending.
    pub irreversible_blocks: Vec<Arc<SignedBlock>>,

    /// Reversible blocks from the fork database store, in any order.
    pub reversible_blocks: Vec<Arc<SignedBlock>>,

    /// Contents of the safety file.
    /// **BFT Safety Critical**: prevents equivocation after restart.
    pub safety_records: BTreeMap<PublicKey, FinalizerSafetyInfo>,

    /// Set when the safety file exists but could not be read. The node never
    /// votes in this state.
    pub safety_corrupt: Option<String>,
}

/// Finality data of one reversible block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalityMetadata {
    pub block_num: BlockNum,
    pub last_final_block_num: BlockNum,
    pub latest_qc_claim: QcClaim,
    pub finality_digest: Hash,
}

/// Consistent view of the chain for readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainStatus {
    pub chain_id: ChainId,
    pub head_block_num: BlockNum,
    pub head_block_id: BlockId,
    pub head_block_time: BlockTimestamp,
    pub lib_block_num: BlockNum,
    pub lib_block_id: BlockId,
    pub phase: ProtocolPhase,
    pub producer_schedule_version: u32,
    pub producers: Vec<ProducerName>,
    pub active_finalizer_generation: Option<u32>,
    pub pending_finalizer_generation: Option<u32>,
    pub paused: bool,
    pub pause_reasons: Vec<String>,
    pub voting_halted: bool,
}

/// Contents of a block to produce on the current head.
#[derive(Debug, Clone)]
pub struct ProductionRequest {
    pub timestamp: BlockTimestamp,
    pub producer: ProducerName,
    pub new_finalizer_policy: Option<FinalizerPolicy>,
    pub new_proposer_policy: Option<ProposerPolicy>,
    pub payload_root: Hash,
}

/// Finality engine.
///
/// # State Machine Flow
///
/// 1. **Block Received** → link (or hold as orphan and request the range),
///    validate, insert, reselect head, vote on the new head branch
/// 2. **Vote Received** → buffer if the block is unknown, otherwise
///    delegate signature verification
/// 3. **Vote Verified** → aggregate; raise `QuorumCertificateFormed` when a
///    QC becomes available or turns strong
/// 4. **QC Formed** → advance LIB on a strong QC on the head branch
pub struct BftState {
    // ═══════════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════════
    chain_id: ChainId,
    config: BftConfig,

    // ═══════════════════════════════════════════════════════════════════════════
    // Chain State
    // ═══════════════════════════════════════════════════════════════════════════
    fork_db: ForkDatabase,

    /// Blocks above this number are not applied (`pause_at_block`).
    application_limit: Option<BlockNum>,

    /// Verified QCs carried by received blocks, by certified block.
    verified_qcs: HashMap<BlockId, QuorumCertificate>,

    /// Highest generation reported by `PolicyActivated`.
    activated_generation: u32,

    // ═══════════════════════════════════════════════════════════════════════════
    // Votes
    // ═══════════════════════════════════════════════════════════════════════════
    aggregator: VoteAggregator,
    vote_buffer: VoteBuffer,

    /// Votes handed to the runner for signature verification.
    pending_verifications: HashSet<(BlockId, PublicKey, bool)>,

    finalizers: MyFinalizers,

    /// Blocks the local finalizers already considered.
    vote_attempted: BTreeSet<BlockId>,

    // ═══════════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════════
    orphans: OrphanPool,
    sync: SyncTracker,

    /// Actions produced while replaying recovered state.
    startup_actions: Vec<Action>,

    // ═══════════════════════════════════════════════════════════════════════════
    // Time & Statistics
    // ═══════════════════════════════════════════════════════════════════════════
    now: Duration,
    last_vote_received: Duration,
    last_lib_advance: Duration,
    stats: BftStats,
}

impl std::fmt::Debug for BftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BftState")
            .field("head", &self.head().block_num())
            .field("lib", &self.lib())
            .field("phase", &self.head().phase())
            .field("reversible", &self.fork_db.len())
            .field("open_qcs", &self.aggregator.len())
            .field("buffered_votes", &self.vote_buffer.len())
            .field("orphans", &self.orphans.len())
            .finish()
    }
}

impl BftState {
    /// Create the engine, replaying recovered state on top of genesis or the
    /// snapshot root.
    ///
    /// # Arguments
    ///
    /// * `genesis` - Chain parameters; also fixes the chain id
    /// * `finalizer_keys` - Finalizer keys held by this node (may be empty)
    /// * `config` - BFT configuration
    /// * `recovered` - State recovered from storage. Use `RecoveredState::default()` for fresh start.
    ///
    /// # Errors
    ///
    /// Fails when the recovered snapshot belongs to another chain or its
    /// header disagrees with its root. The recovered block log was read
    /// relative to that snapshot.
    pub fn new(
        genesis: &Genesis,
        finalizer_keys: Vec<KeyPair>,
        config: BftConfig,
        recovered: RecoveredState,
    ) -> Result<Self, SnapshotError> {
        let chain_id = genesis.chain_id();
        let root = match recovered.snapshot {
            Some(snapshot) => {
                let state = snapshot.into_block_state(chain_id).map_err(|e| {
                    error!(error = %e, "Snapshot rejected");
                    e
                })?;
                Arc::new(state)
            }
            None => Arc::new(BlockState::genesis(genesis)),
        };

        let mut finalizers = MyFinalizers::new(finalizer_keys, recovered.safety_records);
        if let Some(reason) = recovered.safety_corrupt {
            finalizers.halt(format!("safety file unreadable: {reason}"));
        }

        let mut state = Self {
            chain_id,
            fork_db: ForkDatabase::new(root),
            application_limit: None,
            verified_qcs: HashMap::new(),
            activated_generation: 0,
            aggregator: VoteAggregator::new(),
            vote_buffer: VoteBuffer::new(
                config.vote_buffer_horizon,
                config.max_buffered_votes_per_connection,
                config.max_buffered_votes,
            ),
            pending_verifications: HashSet::new(),
            finalizers,
            vote_attempted: BTreeSet::new(),
            orphans: OrphanPool::new(config.sync_fetch_span as usize),
            sync: SyncTracker::new(config.sync_fetch_span, SYNC_RETRY_INTERVAL),
            startup_actions: Vec::new(),
            config,
            now: Duration::ZERO,
            last_vote_received: Duration::ZERO,
            last_lib_advance: Duration::ZERO,
            stats: BftStats::default(),
        };
        state.activated_generation = state
            .fork_db
            .root()
            .active_finalizer_policy()
            .map(|p| p.generation)
            .unwrap_or(0);
        state.replay_irreversible(recovered.irreversible_blocks);
        state.replay_reversible(recovered.reversible_blocks);
        Ok(state)
    }

    /// Re-apply block log entries above the root. The log is trusted; QCs
    /// are not re-verified.
    fn replay_irreversible(&mut self, blocks: Vec<Arc<SignedBlock>>) {
        let mut root = self.fork_db.root().clone();
        let mut replayed = 0usize;
        for block in blocks {
            if block.block_num() <= root.block_num() {
                continue;
            }
            match root.next(block, self.config.commit_chain_length) {
                Ok(next) => {
                    root = Arc::new(next);
                    replayed += 1;
                }
                Err(e) => {
                    warn!(
                        block_num = root.block_num() + 1,
                        error = %e,
                        "Block log replay stopped at invalid block"
                    );
                    break;
                }
            }
        }
        if replayed > 0 {
            info!(replayed, lib = root.block_num(), "Replayed block log");
            self.activated_generation = root
                .active_finalizer_policy()
                .map(|p| p.generation)
                .unwrap_or(self.activated_generation);
            self.fork_db = ForkDatabase::new(root);
        }
    }

    /// Rebuild the reversible tree from the fork database store. Blocks that
    /// no longer validate are removed together with their descendants.
    fn replay_reversible(&mut self, mut blocks: Vec<Arc<SignedBlock>>) {
        blocks.sort_by_key(|b| b.block_num());
        let root_num = self.fork_db.root().block_num();
        let mut removed = Vec::new();
        for block in blocks {
            let id = block.id();
            if block.block_num() <= root_num {
                removed.push(id);
                continue;
            }
            let Some(parent) = self.fork_db.get(&block.previous()).cloned() else {
                removed.push(id);
                continue;
            };
            match parent.next(block, self.config.commit_chain_length) {
                Ok(state) => {
                    let state = Arc::new(state);
                    self.aggregator.track(&state);
                    if self.fork_db.insert(state).is_err() {
                        removed.push(id);
                    }
                }
                Err(e) => {
                    warn!(block_id = ?id, error = %e, "Dropping invalid stored block");
                    removed.push(id);
                }
            }
        }
        self.fork_db.update_head();
        debug!(
            reversible = self.fork_db.len(),
            head = self.head().block_num(),
            removed = removed.len(),
            "Restored fork database"
        );
        if !removed.is_empty() {
            self.startup_actions
                .push(Action::RemoveBlocks { ids: removed });
        }
        let candidate = self.head().irreversible_block_num();
        let mut actions = self.advance_lib(candidate);
        self.startup_actions.append(&mut actions);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn config(&self) -> &BftConfig {
        &self.config
    }

    pub fn head(&self) -> &Arc<BlockState> {
        self.fork_db.head()
    }

    /// The LIB block (root of the fork database).
    pub fn root(&self) -> &Arc<BlockState> {
        self.fork_db.root()
    }

    pub fn lib(&self) -> BlockNum {
        self.fork_db.root().block_num()
    }

    pub fn fork_db(&self) -> &ForkDatabase {
        &self.fork_db
    }

    pub fn phase(&self) -> ProtocolPhase {
        self.head().phase()
    }

    /// Reversible block by number on the head branch, or the LIB block.
    pub fn get_block(&self, block_num: BlockNum, branch: Branch) -> Option<Arc<BlockState>> {
        self.fork_db.get_block(block_num, branch)
    }

    pub fn get_block_by_id(&self, id: &BlockId) -> Option<&Arc<BlockState>> {
        self.fork_db.get(id)
    }

    /// Finality data of a block on the head branch; `None` before the
    /// finality genesis block.
    pub fn finality_metadata(&self, block_num: BlockNum) -> Option<FinalityMetadata> {
        let block = self.get_block(block_num, Branch::Head)?;
        let genesis = block.finality_genesis()?;
        if block_num < genesis {
            return None;
        }
        Some(FinalityMetadata {
            block_num,
            last_final_block_num: block.irreversible_block_num(),
            latest_qc_claim: block.latest_qc_claim(),
            finality_digest: *block.strong_digest(),
        })
    }

    /// Producer schedule in force at head.
    pub fn producer_schedule(&self) -> &ProposerPolicy {
        self.head().active_proposer_policy()
    }

    /// Producer schedule waiting for activation, with its activation slot.
    pub fn pending_producer_schedule(&self) -> Option<(BlockTimestamp, &ProposerPolicy)> {
        self.head()
            .pending_proposer_policy()
            .map(|p| (p.activation, p.policy.as_ref()))
    }

    /// Producer scheduled for `timestamp` on top of the current head.
    pub fn scheduled_producer(&self, timestamp: BlockTimestamp) -> Option<ProducerName> {
        let head = self.head();
        let policy = match head.pending_proposer_policy() {
            Some(p) if timestamp >= p.activation => p.policy.as_ref(),
            _ => head.active_proposer_policy().as_ref(),
        };
        scheduled_producer(policy, timestamp).cloned()
    }

    /// Next slot after `after` owned by `producer` under the head's schedule.
    pub fn next_scheduled_slot(
        &self,
        producer: &ProducerName,
        after: BlockTimestamp,
    ) -> Option<BlockTimestamp> {
        next_scheduled_slot(self.producer_schedule(), producer, after)
    }

    /// Estimated number of the next block `producer` will produce, assuming
    /// one block per slot from head.
    pub fn next_scheduled_block(&self, producer: &ProducerName) -> Option<BlockNum> {
        let head = self.head();
        let slot = self.next_scheduled_slot(producer, head.timestamp())?;
        let gap = slot.slot().saturating_sub(head.timestamp().slot());
        Some(head.block_num() + gap)
    }

    pub fn active_finalizer_policy(&self) -> Option<&Arc<FinalizerPolicy>> {
        self.head().active_finalizer_policy()
    }

    pub fn pending_finalizer_policy(&self) -> Option<&TrackedPolicy> {
        self.head().pending_finalizer_policy()
    }

    /// Safety record of a local finalizer.
    pub fn last_vote(&self, key: &PublicKey) -> Option<FinalizerSafetyInfo> {
        self.finalizers.safety_info(key).copied()
    }

    pub fn finalizers(&self) -> &MyFinalizers {
        &self.finalizers
    }

    pub fn is_voting_halted(&self) -> bool {
        self.finalizers.is_halted()
    }

    pub fn last_vote_received(&self) -> Duration {
        self.last_vote_received
    }

    pub fn last_lib_advance(&self) -> Duration {
        self.last_lib_advance
    }

    /// Whether finalizers other than ours vote on the head.
    pub fn expects_remote_votes(&self) -> bool {
        let Some((active, pending)) = self.head().voting_policies() else {
            return false;
        };
        self.head().phase() == ProtocolPhase::Active
            && active
                .finalizers
                .iter()
                .chain(pending.into_iter().flat_map(|p| p.finalizers.iter()))
                .any(|f| !self.finalizers.contains(&f.public_key))
    }

    /// Highest locally available QC on the head branch above LIB.
    pub fn best_qc_on_head(&self) -> Option<QuorumCertificate> {
        let mut current = self.head().clone();
        loop {
            if let Some(qc) = self.aggregator.qc(&current.id()) {
                return Some(qc);
            }
            if current.id() == self.root().id() {
                return None;
            }
            current = self.fork_db.get(&current.previous())?.clone();
        }
    }

    pub fn application_limit(&self) -> Option<BlockNum> {
        self.application_limit
    }

    pub fn stats(&self) -> BftStats {
        BftStats {
            lib: self.lib(),
            head: self.head().block_num(),
            ..self.stats
        }
    }

    /// Snapshot of the LIB block state.
    pub fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot::from_root(self.chain_id, self.root())
    }

    /// Status without pause information; the node fills that in.
    pub fn chain_status(&self) -> ChainStatus {
        let head = self.head();
        let root = self.root();
        ChainStatus {
            chain_id: self.chain_id,
            head_block_num: head.block_num(),
            head_block_id: head.id(),
            head_block_time: head.timestamp(),
            lib_block_num: root.block_num(),
            lib_block_id: root.id(),
            phase: head.phase(),
            producer_schedule_version: head.active_proposer_policy().version,
            producers: head.active_proposer_policy().producers.clone(),
            active_finalizer_generation: head.active_finalizer_policy().map(|p| p.generation),
            pending_finalizer_generation: head
                .pending_finalizer_policy()
                .map(|p| p.policy.generation),
            paused: false,
            pause_reasons: Vec::new(),
            voting_halted: self.finalizers.is_halted(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Startup & Control
    // ═══════════════════════════════════════════════════════════════════════════

    /// Actions to run once the runner is up: storage fixes from replay, the
    /// cleanup timer and a catch-up request.
    pub fn on_startup(&mut self) -> Vec<Action> {
        let mut actions = std::mem::take(&mut self.startup_actions);
        actions.push(Action::SetTimer {
            id: TimerId::Cleanup,
            duration: self.config.cleanup_interval,
        });
        let head = self.head().block_num();
        actions.push(Action::Broadcast {
            message: OutboundMessage::SyncRequest {
                from_num: head + 1,
                to_num: head + self.config.sync_fetch_span,
            },
        });
        info!(
            head,
            lib = self.lib(),
            phase = %self.phase(),
            finalizers = self.finalizers.public_keys().count(),
            "Finality engine started"
        );
        actions
    }

    /// Stop applying blocks above `limit`; `None` lifts the limit and asks
    /// peers for anything missed.
    pub fn set_application_limit(&mut self, limit: Option<BlockNum>) -> Vec<Action> {
        let lifted = self.application_limit.is_some() && limit.is_none();
        self.application_limit = limit;
        if !lifted {
            return vec![];
        }
        let head = self.head().block_num();
        vec![Action::Broadcast {
            message: OutboundMessage::SyncRequest {
                from_num: head + 1,
                to_num: head + self.config.sync_fetch_span,
            },
        }]
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Blocks
    // ═══════════════════════════════════════════════════════════════════════════

    /// Handle a block from a peer.
    #[instrument(skip(self, block), fields(
        block_num = block.block_num(),
        producer = %block.header.producer,
        from = from
    ))]
    pub fn on_block_received(&mut self, block: Arc<SignedBlock>, from: NodeIndex) -> Vec<Action> {
        let id = block.id();
        if self.fork_db.contains(&id) || self.orphans.contains(&id) {
            trace!("Block already known");
            return vec![];
        }
        if block.block_num() <= self.lib() {
            trace!(lib = self.lib(), "Ignoring block at or below LIB");
            return vec![];
        }
        if self
            .application_limit
            .is_some_and(|limit| block.block_num() > limit)
        {
            debug!(limit = ?self.application_limit, "Not applying block above pause_at_block");
            return vec![];
        }

        let Some(parent) = self.fork_db.get(&block.previous()).cloned() else {
            return self.hold_orphan(block, from);
        };

        let mut actions = Vec::new();
        let old_head = self.head().clone();
        self.accept_linked(parent, block, &mut actions);
        self.after_tree_change(old_head, &mut actions);
        actions
    }

    fn hold_orphan(&mut self, block: Arc<SignedBlock>, from: NodeIndex) -> Vec<Action> {
        let orphan_num = block.block_num();
        debug!(
            block_num = orphan_num,
            previous = ?block.previous(),
            "Block does not link, holding as orphan"
        );
        if !self.orphans.insert(block) {
            return vec![];
        }
        let head = self.head().block_num();
        match self.sync.next_request(self.lib(), head, orphan_num, self.now) {
            Some((from_num, to_num)) => {
                debug!(from_num, to_num, peer = from, "Requesting missing blocks");
                vec![Action::SendTo {
                    peer: from,
                    message: OutboundMessage::SyncRequest { from_num, to_num },
                }]
            }
            None => vec![],
        }
    }

    /// Apply `block` on `parent` and relay it, then any orphans waiting on it.
    fn accept_linked(
        &mut self,
        parent: Arc<BlockState>,
        block: Arc<SignedBlock>,
        actions: &mut Vec<Action>,
    ) {
        let mut queue = vec![(parent, block)];
        while let Some((parent, block)) = queue.pop() {
            let id = block.id();
            if self
                .application_limit
                .is_some_and(|limit| block.block_num() > limit)
            {
                continue;
            }
            let state = match self.validate_block(&parent, block) {
                Ok(state) => Arc::new(state),
                Err(e) => {
                    self.stats.blocks_rejected += 1;
                    let dropped = self.orphans.remove_descendants(&id);
                    warn!(block_id = ?id, error = %e, dropped_orphans = dropped, "Rejected block");
                    continue;
                }
            };
            if let Err(e) = self.fork_db.insert(state.clone()) {
                debug!(error = %e, "Fork database rejected block");
                continue;
            }
            self.stats.blocks_applied += 1;
            trace!(block_num = state.block_num(), "Accepted block");
            actions.push(Action::PersistBlock {
                block: state.block().clone(),
            });
            actions.push(Action::Broadcast {
                message: OutboundMessage::Block(state.block().clone()),
            });
            actions.push(Action::notify(Notification::AcceptedBlock {
                block_num: state.block_num(),
                block_id: id,
            }));

            self.aggregator.track(&state);
            for (vote, from) in self.vote_buffer.take(&id) {
                actions.extend(self.on_vote_received(vote, from));
            }
            for child in self.orphans.take_children(&id) {
                queue.push((state.clone(), child));
            }
        }
    }

    /// Validate a block against its parent, verifying any attached QC.
    fn validate_block(
        &mut self,
        parent: &Arc<BlockState>,
        block: Arc<SignedBlock>,
    ) -> Result<BlockState, BlockError> {
        if let Some(qc) = &block.qc {
            self.verify_block_qc(parent, qc)?;
        }
        parent.next(block, self.config.commit_chain_length)
    }

    fn verify_block_qc(
        &mut self,
        parent: &Arc<BlockState>,
        qc: &QuorumCertificate,
    ) -> Result<(), BlockError> {
        // Targets at or below LIB are final; their policies are gone.
        if qc.block_num() <= self.lib() {
            return Ok(());
        }
        if self.verified_qcs.get(&qc.block_id) == Some(qc) {
            return Ok(());
        }
        let target = self
            .fork_db
            .search_on_branch(&parent.id(), qc.block_num())
            .ok_or(BlockError::QcTargetUnknown(qc.block_num()))?;
        if target.id() != qc.block_id {
            return Err(BlockError::QcBlockMismatch {
                expected: target.id(),
                got: qc.block_id,
            });
        }
        let (active, pending) = target.voting_policies().ok_or(BlockError::UnexpectedQc)?;
        qc.verify(active, pending, target.strong_digest())?;
        self.verified_qcs.insert(qc.block_id, qc.clone());
        Ok(())
    }

    /// Reselect head, vote on the new head branch and advance LIB.
    fn after_tree_change(&mut self, old_head: Arc<BlockState>, actions: &mut Vec<Action>) {
        if self.fork_db.update_head().is_some() {
            let new_head = self.head().clone();
            if !self.fork_db.is_descendant(&new_head.id(), &old_head.id()) {
                self.stats.fork_switches += 1;
                info!(
                    from = old_head.block_num(),
                    to = new_head.block_num(),
                    from_id = ?old_head.id(),
                    to_id = ?new_head.id(),
                    "Fork switch"
                );
                actions.push(Action::notify(Notification::ForkSwitch {
                    from: old_head.id(),
                    to: new_head.id(),
                }));
            }
            self.sync.on_head_advance(new_head.block_num());
        }

        actions.extend(self.vote_on_head_branch());
        let candidate = self.head().irreversible_block_num();
        actions.extend(self.advance_lib(candidate));
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Production
    // ═══════════════════════════════════════════════════════════════════════════

    /// Build a block on the current head, apply it and broadcast it.
    ///
    /// The block claims the best QC available on the head branch.
    #[instrument(skip(self, request), fields(
        slot = request.timestamp.slot(),
        producer = %request.producer
    ))]
    pub fn produce_block(&mut self, request: ProductionRequest) -> Vec<Action> {
        let head = self.head().clone();
        let (claim, qc) = if head.is_finality_enabled() {
            match self.best_qc_on_head() {
                Some(qc) if qc.to_claim() > head.latest_qc_claim() => (qc.to_claim(), Some(qc)),
                _ => (head.latest_qc_claim(), None),
            }
        } else {
            (head.latest_qc_claim(), None)
        };

        let block = Arc::new(SignedBlock::new(
            BlockHeader {
                block_num: head.block_num() + 1,
                previous: head.id(),
                timestamp: request.timestamp,
                producer: request.producer,
                qc_claim: claim,
                new_finalizer_policy: request.new_finalizer_policy,
                new_proposer_policy: request.new_proposer_policy,
                payload_root: request.payload_root,
            },
            qc,
        ));

        let state = match head.next(block.clone(), self.config.commit_chain_length) {
            Ok(state) => Arc::new(state),
            Err(e) => {
                warn!(error = %e, "Produced block failed validation");
                return vec![];
            }
        };
        if let Some(qc) = &block.qc {
            self.verified_qcs.insert(qc.block_id, qc.clone());
        }
        if let Err(e) = self.fork_db.insert(state.clone()) {
            warn!(error = %e, "Fork database rejected produced block");
            return vec![];
        }
        self.stats.blocks_applied += 1;
        info!(
            block_num = state.block_num(),
            claim = claim.block_num,
            strong = claim.is_strong_qc,
            lib = self.lib(),
            "Produced block"
        );

        let mut actions = vec![
            Action::PersistBlock {
                block: block.clone(),
            },
            Action::Broadcast {
                message: OutboundMessage::Block(block),
            },
            Action::notify(Notification::AcceptedBlock {
                block_num: state.block_num(),
                block_id: state.id(),
            }),
        ];
        self.aggregator.track(&state);
        self.after_tree_change(head, &mut actions);
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Voting
    // ═══════════════════════════════════════════════════════════════════════════

    /// Vote on head-branch blocks not yet considered, oldest first.
    ///
    /// The safety records are persisted before any vote leaves the node.
    fn vote_on_head_branch(&mut self) -> Vec<Action> {
        if self.finalizers.is_empty() || self.finalizers.is_halted() {
            return vec![];
        }
        let mut candidates = Vec::new();
        let mut current = self.head().clone();
        while current.id() != self.root().id() && !self.vote_attempted.contains(&current.id()) {
            let Some(parent) = self.fork_db.get(&current.previous()).cloned() else {
                break;
            };
            candidates.push(current);
            current = parent;
        }
        if candidates.is_empty() {
            return vec![];
        }

        let lib_ref = self.root().block_ref();
        let mut votes = Vec::new();
        for block in candidates.into_iter().rev() {
            self.vote_attempted.insert(block.id());
            if !block.is_finality_enabled() {
                continue;
            }
            votes.extend(self.finalizers.vote(&block, lib_ref));
        }
        if votes.is_empty() {
            return vec![];
        }

        let mut actions = vec![Action::PersistSafetyState {
            records: self.finalizers.records().clone(),
        }];
        for vote in votes {
            self.stats.votes_cast += 1;
            debug!(
                block_num = vote.block_num(),
                kind = %vote.kind,
                finalizer = %vote.finalizer_key,
                "Voting"
            );
            actions.push(Action::notify(Notification::VotedBlock {
                finalizer_key: vote.finalizer_key,
                block_id: vote.block_id,
                kind: vote.kind,
            }));
            actions.push(Action::Broadcast {
                message: OutboundMessage::Vote(vote.clone()),
            });
            actions.push(Action::EnqueueInternal {
                event: Event::LocalVoteCast { vote },
            });
        }
        actions
    }

    /// Handle a vote from a peer.
    #[instrument(skip(self, vote), fields(
        block_num = vote.block_num(),
        finalizer = %vote.finalizer_key,
        kind = %vote.kind
    ))]
    pub fn on_vote_received(&mut self, vote: Vote, from: NodeIndex) -> Vec<Action> {
        if vote.block_num() <= self.lib() {
            trace!(lib = self.lib(), "Skipping vote at or below LIB");
            return vec![];
        }

        let Some(block) = self.fork_db.get(&vote.block_id).cloned() else {
            let head = self.head().block_num();
            let status = self.vote_buffer.insert(vote.clone(), from, head, self.lib());
            trace!(%status, "Vote for unknown block");
            if status == VoteStatus::MaxExceeded {
                return vec![self.vote_status(&vote, status)];
            }
            return vec![];
        };

        if let Err(status) = self.aggregator.precheck(&vote) {
            trace!(%status, "Vote rejected before verification");
            return vec![self.vote_status(&vote, status)];
        }
        let key = (vote.block_id, vote.finalizer_key, vote.is_strong());
        if !self.pending_verifications.insert(key) {
            trace!("Vote verification already pending");
            return vec![];
        }

        vec![Action::VerifyVoteSignature {
            vote,
            from,
            finality_digest: *block.strong_digest(),
        }]
    }

    /// Handle the result of a delegated vote signature check.
    #[instrument(skip(self, vote), fields(
        block_num = vote.block_num(),
        finalizer = %vote.finalizer_key,
        valid = valid
    ))]
    pub fn on_vote_signature_verified(
        &mut self,
        vote: Vote,
        from: NodeIndex,
        valid: bool,
    ) -> Vec<Action> {
        let key = (vote.block_id, vote.finalizer_key, vote.is_strong());
        self.pending_verifications.remove(&key);
        if !valid {
            warn!(from, "Vote signature invalid");
            return vec![self.vote_status(&vote, VoteStatus::InvalidSignature)];
        }
        // Only a verified signature proves another process holds our key.
        if self.finalizers.contains(&vote.finalizer_key) {
            let timestamp = self.fork_db.get(&vote.block_id).map(|b| b.timestamp());
            if let Some(timestamp) = timestamp {
                if self.finalizers.check_equivocation(&vote, timestamp) {
                    return vec![];
                }
            }
        }
        self.last_vote_received = self.now;
        let (status, mut actions) = self.aggregate(&vote);
        // First sight of a peer's vote: pass it on so finalizers without a
        // direct link still see it.
        if status == VoteStatus::Success {
            actions.push(Action::Broadcast {
                message: OutboundMessage::Vote(vote),
            });
        }
        actions
    }

    /// Aggregate one of our own votes.
    pub fn on_local_vote_cast(&mut self, vote: Vote) -> Vec<Action> {
        self.aggregate(&vote).1
    }

    fn aggregate(&mut self, vote: &Vote) -> (VoteStatus, Vec<Action>) {
        let (status, update) = self.aggregator.add_vote(vote);
        if status == VoteStatus::Success {
            self.stats.votes_aggregated += 1;
        }
        let mut actions = vec![self.vote_status(vote, status)];
        if let Some(update) = update {
            self.stats.qcs_formed += 1;
            actions.push(Action::EnqueueInternal {
                event: Event::QuorumCertificateFormed {
                    block_id: update.block_id,
                    strong: update.strong,
                },
            });
        }
        (status, actions)
    }

    fn vote_status(&self, vote: &Vote, status: VoteStatus) -> Action {
        Action::notify(Notification::AggregatedVote {
            finalizer_key: vote.finalizer_key,
            block_id: vote.block_id,
            status,
        })
    }

    /// A QC became available locally. A strong QC on the head branch
    /// finalizes what that block would finalize.
    #[instrument(skip(self), fields(block_num = block_id.block_num()))]
    pub fn on_qc_formed(&mut self, block_id: BlockId, strong: bool) -> Vec<Action> {
        debug!(strong, "Quorum certificate formed");
        if !strong || !self.fork_db.is_descendant(&self.head().id(), &block_id) {
            return vec![];
        }
        let Some(block) = self.fork_db.get(&block_id).cloned() else {
            return vec![];
        };
        if block.phase() != ProtocolPhase::Active {
            return vec![];
        }
        let candidate = block.final_on_strong_qc(self.config.commit_chain_length);
        self.advance_lib(candidate)
    }

    /// The runner could not persist the safety records.
    pub fn on_safety_write_failed(&mut self, error: &str) -> Vec<Action> {
        self.finalizers
            .halt(format!("safety state write failed: {error}"));
        vec![]
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // LIB
    // ═══════════════════════════════════════════════════════════════════════════

    /// Move LIB to the head-branch block numbered `candidate`.
    fn advance_lib(&mut self, candidate: BlockNum) -> Vec<Action> {
        if candidate <= self.lib() {
            return vec![];
        }
        let Some(target) = self.get_block(candidate, Branch::Head) else {
            trace!(candidate, "LIB candidate not on head branch");
            return vec![];
        };
        let advance = match self.fork_db.advance_root(&target.id()) {
            Ok(advance) => advance,
            Err(e) => {
                warn!(error = %e, "Failed to advance LIB");
                return vec![];
            }
        };
        let lib = self.lib();
        self.last_lib_advance = self.now;
        info!(
            lib,
            head = self.head().block_num(),
            finalized = advance.irreversible.len(),
            pruned = advance.pruned.len(),
            "LIB advanced"
        );

        let mut actions = vec![Action::PersistIrreversibleBlocks {
            blocks: advance
                .irreversible
                .iter()
                .map(|b| b.block().clone())
                .collect(),
            lib: target.id(),
        }];
        for block in &advance.irreversible {
            actions.push(Action::notify(Notification::IrreversibleBlock {
                block_num: block.block_num(),
                block_id: block.id(),
            }));
            if let Some(policy) = block.active_finalizer_policy() {
                if policy.generation > self.activated_generation {
                    self.activated_generation = policy.generation;
                    info!(
                        generation = policy.generation,
                        block_num = block.block_num(),
                        "Finalizer policy active"
                    );
                    actions.push(Action::notify(Notification::PolicyActivated {
                        generation: policy.generation,
                        block_num: block.block_num(),
                    }));
                }
            }
        }
        if !advance.pruned.is_empty() {
            for id in &advance.pruned {
                self.aggregator.remove(id);
            }
            actions.push(Action::RemoveBlocks {
                ids: advance.pruned,
            });
        }

        self.aggregator.prune_at_or_below(lib.saturating_sub(1));
        self.vote_buffer.prune(self.head().block_num(), lib);
        self.orphans.prune(lib);
        self.verified_qcs.retain(|id, _| id.block_num() >= lib);
        self.vote_attempted = self.vote_attempted.split_off(&BlockId::new(lib, &Hash::ZERO));
        self.pending_verifications
            .retain(|(id, _, _)| id.block_num() > lib);
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn on_cleanup_timer(&mut self) -> Vec<Action> {
        let head = self.head().block_num();
        let lib = self.lib();
        self.vote_buffer.prune(head, lib);
        self.orphans.prune(lib);

        let mut actions = vec![Action::SetTimer {
            id: TimerId::Cleanup,
            duration: self.config.cleanup_interval,
        }];
        if let Some(lowest) = self.orphans.lowest() {
            if let Some((from_num, to_num)) =
                self.sync.next_request(lib, head, lowest, self.now)
            {
                actions.push(Action::Broadcast {
                    message: OutboundMessage::SyncRequest { from_num, to_num },
                });
            }
        }
        actions
    }
}

impl SubStateMachine for BftState {
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>> {
        match event {
            Event::BlockReceived { block, from } => {
                Some(self.on_block_received(block.clone(), *from))
            }
            Event::VoteReceived { vote, from } => Some(self.on_vote_received(vote.clone(), *from)),
            Event::VoteSignatureVerified { vote, from, valid } => {
                Some(self.on_vote_signature_verified(vote.clone(), *from, *valid))
            }
            Event::LocalVoteCast { vote } => Some(self.on_local_vote_cast(vote.clone())),
            Event::QuorumCertificateFormed { block_id, strong } => {
                Some(self.on_qc_formed(*block_id, *strong))
            }
            Event::SafetyStateWriteFailed { error } => Some(self.on_safety_write_failed(error)),
            Event::CleanupTimer => Some(self.on_cleanup_timer()),
            _ => None,
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }
}
