//! Node state machine.

use keel_bft::{
    BftConfig, BftState, ChainStatus, PauseController, PauseInputs, PauseTransition,
    ProductionRequest, RecoveredState, SnapshotError,
};
use keel_core::{
    Action, Event, NodeIndex, Notification, OutboundMessage, StateMachine, SubStateMachine,
    TimerId,
};
use keel_types::{
    BlockId, BlockNum, BlockTimestamp, FinalizerPolicy, Genesis, Hash, KeyPair, ProducerName,
    ProposerPolicy,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What this node does on the network.
///
/// Producers and finalizers are independent: a node may produce blocks,
/// vote on them, both, or neither.
#[derive(Clone, Default)]
pub struct NodeRole {
    /// Producer accounts this node produces for.
    pub producers: Vec<ProducerName>,

    /// Finalizer keys this node votes with.
    pub finalizer_keys: Vec<KeyPair>,
}

impl NodeRole {
    pub fn producer(name: ProducerName) -> Self {
        Self {
            producers: vec![name],
            finalizer_keys: Vec::new(),
        }
    }

    pub fn finalizer(key: KeyPair) -> Self {
        Self {
            producers: Vec::new(),
            finalizer_keys: vec![key],
        }
    }

    pub fn with_producer(mut self, name: ProducerName) -> Self {
        self.producers.push(name);
        self
    }

    pub fn with_finalizer(mut self, key: KeyPair) -> Self {
        self.finalizer_keys.push(key);
        self
    }

    pub fn can_propose(&self) -> bool {
        !self.producers.is_empty()
    }

    pub fn can_finalize(&self) -> bool {
        !self.finalizer_keys.is_empty()
    }
}

impl std::fmt::Debug for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRole")
            .field("producers", &self.producers)
            .field(
                "finalizers",
                &self
                    .finalizer_keys
                    .iter()
                    .map(|k| k.public_key())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Combined node state machine.
///
/// Composes the finality engine with slot-driven block production. The
/// production timer fires at every slot start; on each tick, and whenever
/// head or LIB moves, the pause conditions are re-evaluated.
pub struct NodeStateMachine {
    /// This node's index (for routing and logs).
    node_index: NodeIndex,

    /// Producer accounts; finalizer keys live in the BFT state.
    producers: Vec<ProducerName>,

    /// Finality engine.
    bft: BftState,

    /// Production pause conditions.
    pause: PauseController,

    /// Operator proposals waiting for our next produced block.
    proposed_finalizer_policy: Option<FinalizerPolicy>,
    proposed_producers: Option<Vec<ProducerName>>,

    /// Head and LIB at the last pause evaluation.
    last_seen: (BlockId, BlockNum),

    /// Current time.
    now: Duration,
}

impl std::fmt::Debug for NodeStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStateMachine")
            .field("node_index", &self.node_index)
            .field("producers", &self.producers)
            .field("bft", &self.bft)
            .field("paused", &self.pause.is_paused())
            .field("now", &self.now)
            .finish()
    }
}

impl NodeStateMachine {
    /// Create a new node state machine.
    ///
    /// # Arguments
    ///
    /// * `node_index` - Deterministic node index for routing
    /// * `role` - Producer accounts and finalizer keys held by this node
    /// * `genesis` - Chain parameters
    /// * `bft_config` - BFT configuration
    /// * `recovered` - State recovered from storage. Use `RecoveredState::default()` for fresh start.
    ///
    /// Fails when the recovered snapshot does not belong to `genesis`.
    pub fn new(
        node_index: NodeIndex,
        role: NodeRole,
        genesis: &Genesis,
        bft_config: BftConfig,
        recovered: RecoveredState,
    ) -> Result<Self, SnapshotError> {
        let pause = PauseController::new(
            bft_config.production_pause_vote_timeout,
            bft_config.max_reversible_blocks,
            Duration::ZERO,
        );
        let bft = BftState::new(genesis, role.finalizer_keys, bft_config, recovered)?;
        let last_seen = (bft.head().id(), bft.lib());
        Ok(Self {
            node_index,
            producers: role.producers,
            bft,
            pause,
            proposed_finalizer_policy: None,
            proposed_producers: None,
            last_seen,
            now: Duration::ZERO,
        })
    }

    /// Get this node's index.
    pub fn node_index(&self) -> NodeIndex {
        self.node_index
    }

    pub fn producers(&self) -> &[ProducerName] {
        &self.producers
    }

    pub fn can_propose(&self) -> bool {
        !self.producers.is_empty()
    }

    pub fn can_finalize(&self) -> bool {
        !self.bft.finalizers().is_empty()
    }

    /// Get a reference to the BFT state.
    pub fn bft(&self) -> &BftState {
        &self.bft
    }

    /// Get a mutable reference to the BFT state.
    pub fn bft_mut(&mut self) -> &mut BftState {
        &mut self.bft
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    pub fn pause_controller(&self) -> &PauseController {
        &self.pause
    }

    /// Chain status including pause state.
    pub fn chain_status(&self) -> ChainStatus {
        let mut status = self.bft.chain_status();
        status.paused = self.pause.is_paused();
        status.pause_reasons = self.pause.reasons().map(ToString::to_string).collect();
        status
    }

    /// Start the node: engine startup actions and the first slot timer.
    ///
    /// Call after the first `set_time`; progress timers start from now.
    pub fn initialize(&mut self) -> Vec<Action> {
        self.pause.record_vote_received(self.now);
        self.pause.record_lib_advance(self.now);
        let mut actions = self.bft.on_startup();
        actions.push(self.production_timer());
        info!(
            node = self.node_index,
            producers = ?self.producers,
            finalizer = self.can_finalize(),
            "Node initialized"
        );
        actions
    }

    /// Timer until the start of the next slot.
    fn production_timer(&self) -> Action {
        let next = BlockTimestamp::from_duration(self.now).next();
        Action::SetTimer {
            id: TimerId::Production,
            duration: next.to_duration().saturating_sub(self.now),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Production
    // ═══════════════════════════════════════════════════════════════════════════

    fn on_production_timer(&mut self) -> Vec<Action> {
        let mut actions = self.evaluate_pause();
        actions.extend(self.maybe_produce());
        actions.extend(self.evaluate_pause());
        actions.push(self.production_timer());
        actions
    }

    /// Produce a block for the current slot if one of our producers owns it.
    fn maybe_produce(&mut self) -> Vec<Action> {
        if self.producers.is_empty() || self.pause.is_paused() {
            return vec![];
        }
        let slot = BlockTimestamp::from_duration(self.now);
        let head = self.bft.head().clone();
        if slot <= head.timestamp() {
            return vec![];
        }
        if self.pause.blocks_application(head.block_num() + 1) {
            return vec![];
        }
        let Some(producer) = self.bft.scheduled_producer(slot) else {
            return vec![];
        };
        if !self.producers.contains(&producer) {
            return vec![];
        }

        let new_finalizer_policy = self.proposed_finalizer_policy.clone().map(|mut policy| {
            policy.generation = head.last_finalizer_policy_generation() + 1;
            policy
        });
        let new_proposer_policy = self.proposed_producers.clone().map(|producers| ProposerPolicy {
            version: head.last_proposer_policy_version() + 1,
            proposal_time: slot,
            producers,
        });

        let actions = self.bft.produce_block(ProductionRequest {
            timestamp: slot,
            producer,
            new_finalizer_policy,
            new_proposer_policy,
            payload_root: Hash::ZERO,
        });
        let produced = actions.iter().any(|a| {
            matches!(
                a,
                Action::Broadcast {
                    message: OutboundMessage::Block(_)
                }
            )
        });
        if produced {
            self.proposed_finalizer_policy = None;
            self.proposed_producers = None;
        }
        actions
    }

    fn on_propose_finalizer_policy(&mut self, policy: &FinalizerPolicy) -> Vec<Action> {
        if let Err(e) = policy.validate() {
            warn!(error = %e, "Rejecting invalid finalizer policy proposal");
            return vec![];
        }
        if !self.can_propose() {
            warn!("Finalizer policy proposed on a node that does not produce");
        }
        info!(
            finalizers = policy.finalizers.len(),
            threshold = policy.threshold,
            "Finalizer policy queued for next produced block"
        );
        self.proposed_finalizer_policy = Some(policy.clone());
        vec![]
    }

    fn on_propose_producer_schedule(&mut self, producers: &[ProducerName]) -> Vec<Action> {
        if let Err(e) = ProposerPolicy::new(0, producers.to_vec()).validate() {
            warn!(error = %e, "Rejecting invalid producer schedule proposal");
            return vec![];
        }
        info!(?producers, "Producer schedule queued for next produced block");
        self.proposed_producers = Some(producers.to_vec());
        vec![]
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Pause
    // ═══════════════════════════════════════════════════════════════════════════

    fn on_pause(&mut self) -> Vec<Action> {
        self.pause.pause();
        self.evaluate_pause()
    }

    fn on_resume(&mut self) -> Vec<Action> {
        self.pause.resume();
        let mut actions = self.bft.set_application_limit(None);
        actions.extend(self.evaluate_pause());
        actions
    }

    fn on_pause_at_block(&mut self, block_num: BlockNum) -> Vec<Action> {
        self.pause.set_pause_at_block(block_num);
        let mut actions = self.bft.set_application_limit(Some(block_num));
        actions.extend(self.evaluate_pause());
        actions
    }

    fn evaluate_pause(&mut self) -> Vec<Action> {
        self.pause.record_vote_received(self.bft.last_vote_received());
        self.pause.record_lib_advance(self.bft.last_lib_advance());
        let head = self.bft.head();
        if head.id() != self.last_seen.0 {
            self.pause.record_block_received(self.now);
        }
        let inputs = PauseInputs {
            now: self.now,
            head: head.block_num(),
            lib: self.bft.lib(),
            head_claim: head.latest_qc_claim().block_num,
            best_qc_block: self.bft.best_qc_on_head().map(|qc| qc.block_num()),
            expects_votes: self.bft.expects_remote_votes(),
        };
        self.last_seen = (head.id(), inputs.lib);
        self.pause
            .evaluate(&inputs)
            .into_iter()
            .map(|t| match t {
                PauseTransition::Paused(reason) => {
                    Action::notify(Notification::ProductionPaused { reason })
                }
                PauseTransition::Resumed => Action::notify(Notification::ProductionResumed),
            })
            .collect()
    }

    /// Re-evaluate pause conditions if head or LIB moved.
    fn after_chain_event(&mut self, mut actions: Vec<Action>) -> Vec<Action> {
        if (self.bft.head().id(), self.bft.lib()) != self.last_seen {
            actions.extend(self.evaluate_pause());
        }
        actions
    }
}

impl StateMachine for NodeStateMachine {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        match &event {
            Event::ProductionTimer => self.on_production_timer(),

            Event::ProposeFinalizerPolicy { policy } => self.on_propose_finalizer_policy(policy),
            Event::ProposeProducerSchedule { producers } => {
                self.on_propose_producer_schedule(producers)
            }
            Event::PauseProduction => self.on_pause(),
            Event::ResumeProduction => self.on_resume(),
            Event::PauseAtBlock { block_num } => self.on_pause_at_block(*block_num),

            Event::CleanupTimer
            | Event::BlockReceived { .. }
            | Event::VoteReceived { .. }
            | Event::VoteSignatureVerified { .. }
            | Event::LocalVoteCast { .. }
            | Event::QuorumCertificateFormed { .. }
            | Event::SafetyStateWriteFailed { .. } => {
                let actions = self.bft.try_handle(&event).unwrap_or_else(|| {
                    debug!(event = event.type_name(), "Event not handled by BFT");
                    vec![]
                });
                self.after_chain_event(actions)
            }
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
        self.bft.set_time(now);
    }

    fn now(&self) -> Duration {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::PauseReason;
    use keel_types::test_utils::{test_genesis, test_key, test_policy, test_producer};
    use std::collections::VecDeque;
    use tracing_test::traced_test;

    /// Run one event and all internal follow-ups; signatures verified inline.
    fn run(node: &mut NodeStateMachine, event: Event) -> Vec<Action> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            for action in node.handle(event) {
                match &action {
                    Action::EnqueueInternal { event } => queue.push_back(event.clone()),
                    Action::VerifyVoteSignature {
                        vote,
                        from,
                        finality_digest,
                    } => queue.push_back(Event::VoteSignatureVerified {
                        vote: vote.clone(),
                        from: *from,
                        valid: vote.verify(finality_digest),
                    }),
                    _ => {}
                }
                out.push(action);
            }
        }
        out
    }

    fn start(node: &mut NodeStateMachine, genesis: &Genesis) -> Duration {
        let now = genesis.initial_timestamp.to_duration();
        node.set_time(now);
        node.initialize();
        now
    }

    /// Advance one slot and fire the production timer.
    fn tick(node: &mut NodeStateMachine, now: &mut Duration) -> Vec<Action> {
        *now += Duration::from_millis(BlockTimestamp::SLOT_MS);
        node.set_time(*now);
        run(node, Event::ProductionTimer)
    }

    fn notifications(actions: &[Action]) -> Vec<Notification> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::EmitNotification { notification } => Some(notification.clone()),
                _ => None,
            })
            .collect()
    }

    fn solo_node() -> (NodeStateMachine, Genesis) {
        let key = test_key(0);
        let genesis = test_genesis(1, std::slice::from_ref(&key));
        let role = NodeRole::producer(test_producer(0)).with_finalizer(key);
        let node = NodeStateMachine::new(
            0,
            role,
            &genesis,
            BftConfig::default(),
            RecoveredState::default(),
        )
        .unwrap();
        (node, genesis)
    }

    #[test]
    fn test_role_capabilities() {
        let role = NodeRole::default();
        assert!(!role.can_propose() && !role.can_finalize());
        let role = role.with_producer(test_producer(0));
        assert!(role.can_propose() && !role.can_finalize());
        assert!(NodeRole::finalizer(test_key(0)).can_finalize());
    }

    #[traced_test]
    #[test]
    fn test_solo_node_produces_and_finalizes() {
        let (mut node, genesis) = solo_node();
        let mut now = start(&mut node, &genesis);
        for _ in 0..10 {
            tick(&mut node, &mut now);
        }
        assert_eq!(node.bft().head().block_num(), 11);
        assert!(node.bft().lib() >= 9);
        assert!(!node.is_paused());
        assert!(logs_contain("Node initialized"));
    }

    #[test]
    fn test_timer_targets_next_slot_start() {
        let (mut node, genesis) = solo_node();
        node.set_time(genesis.initial_timestamp.to_duration() + Duration::from_millis(120));
        let actions = node.initialize();
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer {
                id: TimerId::Production,
                duration
            } if *duration == Duration::from_millis(380)
        )));
    }

    #[test]
    fn test_non_producer_never_produces() {
        let key = test_key(0);
        let genesis = test_genesis(1, std::slice::from_ref(&key));
        let mut node = NodeStateMachine::new(
            0,
            NodeRole::finalizer(key),
            &genesis,
            BftConfig::default(),
            RecoveredState::default(),
        )
        .unwrap();
        let mut now = start(&mut node, &genesis);
        for _ in 0..3 {
            tick(&mut node, &mut now);
        }
        assert_eq!(node.bft().head().block_num(), 1);
    }

    #[test]
    fn test_operator_pause_and_resume() {
        let (mut node, genesis) = solo_node();
        let mut now = start(&mut node, &genesis);
        tick(&mut node, &mut now);

        let actions = run(&mut node, Event::PauseProduction);
        assert_eq!(
            notifications(&actions),
            vec![Notification::ProductionPaused {
                reason: PauseReason::Operator
            }]
        );
        tick(&mut node, &mut now);
        tick(&mut node, &mut now);
        assert_eq!(node.bft().head().block_num(), 2);
        assert_eq!(node.chain_status().pause_reasons.len(), 1);

        let actions = run(&mut node, Event::ResumeProduction);
        assert!(notifications(&actions).contains(&Notification::ProductionResumed));
        tick(&mut node, &mut now);
        assert_eq!(node.bft().head().block_num(), 3);
    }

    #[test]
    fn test_pause_at_block() {
        let (mut node, genesis) = solo_node();
        let mut now = start(&mut node, &genesis);
        run(&mut node, Event::PauseAtBlock { block_num: 4 });

        let mut paused = Vec::new();
        for _ in 0..6 {
            paused.extend(notifications(&tick(&mut node, &mut now)));
        }
        assert_eq!(node.bft().head().block_num(), 4);
        assert!(paused.contains(&Notification::ProductionPaused {
            reason: PauseReason::AtBlock(4)
        }));

        run(&mut node, Event::ResumeProduction);
        tick(&mut node, &mut now);
        assert_eq!(node.bft().head().block_num(), 5);
    }

    #[test]
    fn test_vote_timeout_pauses_producer() {
        // One of four finalizers; the others never vote.
        let keys: Vec<_> = (0..4).map(test_key).collect();
        let genesis = test_genesis(1, &keys);
        let role = NodeRole::producer(test_producer(0)).with_finalizer(keys[0].clone());
        let config =
            BftConfig::default().with_production_pause_vote_timeout(Duration::from_secs(2));
        let mut node =
            NodeStateMachine::new(0, role, &genesis, config, RecoveredState::default()).unwrap();
        let mut now = start(&mut node, &genesis);

        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.extend(notifications(&tick(&mut node, &mut now)));
        }
        assert!(seen.contains(&Notification::ProductionPaused {
            reason: PauseReason::VoteTimeout
        }));
        // Paused after the timeout elapsed, so not every slot produced.
        assert!(node.bft().head().block_num() < 9);
        assert_eq!(node.bft().lib(), 1);
    }

    #[test]
    fn test_policy_proposal_included_in_next_block() {
        let (mut node, genesis) = solo_node();
        let mut now = start(&mut node, &genesis);
        let keys: Vec<_> = (0..4).map(test_key).collect();
        run(
            &mut node,
            Event::ProposeFinalizerPolicy {
                policy: test_policy(0, &keys),
            },
        );
        tick(&mut node, &mut now);
        let head = node.bft().head();
        let proposed = head.header().new_finalizer_policy.as_ref().unwrap();
        assert_eq!(proposed.generation, 2);
        assert_eq!(proposed.finalizers.len(), 4);

        tick(&mut node, &mut now);
        assert!(node.bft().head().header().new_finalizer_policy.is_none());
    }
}
