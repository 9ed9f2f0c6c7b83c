//! Deterministic simulation runner.
//!
//! Each node has its own storage. Storage writes and signature checks happen
//! inline, so a node's state after any event is a pure function of the seed
//! and the scenario.

use crate::event_queue::EventKey;
use crate::network::{Delivery, NetworkConfig, SimulatedNetwork};
use crate::storage::SimStorage;
use crate::NodeIndex;
use keel_bft::{BftConfig, Branch, ChainSnapshot, SnapshotError};
use keel_core::{
    Action, Event, EventPriority, Notification, OutboundMessage, StateMachine, TimerId,
};
use keel_node::{NodeRole, NodeStateMachine};
use keel_types::{BlockNum, Genesis, SignedBlock};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Blocks returned for one sync request.
const MAX_SYNC_RESPONSE_BLOCKS: BlockNum = 256;

/// Something waiting in the global queue for a node.
#[derive(Debug)]
enum Scheduled {
    Event(Event),
    /// A peer's block range request, answered by the runner from the
    /// recipient's storage without entering its state machine.
    SyncRequest {
        from: NodeIndex,
        from_num: BlockNum,
        to_num: BlockNum,
    },
}

/// Deterministic simulation runner.
///
/// Processes events in deterministic order and executes actions.
/// Given the same seed, produces identical results every run.
pub struct SimulationRunner {
    genesis: Genesis,
    bft_config: BftConfig,
    roles: Vec<NodeRole>,

    /// Running nodes; `None` while a node is killed.
    nodes: Vec<Option<NodeStateMachine>>,

    /// Per-node storage, kept across kill and relaunch.
    node_storage: Vec<SimStorage>,

    /// Notifications emitted by each node, with the time they were emitted.
    notifications: Vec<Vec<(Duration, Notification)>>,

    /// Global event queue, ordered deterministically.
    event_queue: BTreeMap<EventKey, Scheduled>,

    /// Sequence counter for deterministic ordering.
    sequence: u64,

    /// Current simulation time (since the unix epoch).
    now: Duration,

    network: SimulatedNetwork,

    /// RNG for network conditions (seeded for determinism).
    rng: ChaCha8Rng,

    /// Maps (node, timer_id) -> event_key for cancellation.
    timers: HashMap<(NodeIndex, TimerId), EventKey>,

    stats: SimulationStats,
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulationStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Events processed by priority.
    pub events_by_priority: [u64; 4],
    /// Total actions generated.
    pub actions_generated: u64,
    /// Messages sent (successfully scheduled for delivery).
    pub messages_sent: u64,
    /// Messages dropped due to network partition.
    pub messages_dropped_partition: u64,
    /// Messages dropped due to packet loss.
    pub messages_dropped_loss: u64,
    /// Messages that arrived at a killed node.
    pub messages_dropped_dead: u64,
    pub timers_set: u64,
    pub timers_cancelled: u64,
    pub sync_requests_served: u64,
    pub safety_write_failures: u64,
}

impl SimulationStats {
    /// Total messages dropped (partition + packet loss + dead recipient).
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped_partition + self.messages_dropped_loss + self.messages_dropped_dead
    }

    /// Message delivery rate (sent / (sent + dropped)).
    pub fn delivery_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_dropped();
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }
}

impl SimulationRunner {
    /// Create a runner with one node per role.
    ///
    /// The clock starts at the genesis timestamp. Nodes are created but not
    /// started; call [`initialize`](Self::initialize).
    pub fn new(
        genesis: Genesis,
        roles: Vec<NodeRole>,
        bft_config: BftConfig,
        network_config: NetworkConfig,
        seed: u64,
    ) -> Self {
        let network_config = NetworkConfig {
            num_nodes: roles.len() as u32,
            ..network_config
        };
        let num_nodes = roles.len();
        let node_storage = vec![SimStorage::new(); num_nodes];
        let now = genesis.initial_timestamp.to_duration();

        let nodes = roles
            .iter()
            .enumerate()
            .map(|(i, role)| {
                let node = NodeStateMachine::new(
                    i as NodeIndex,
                    role.clone(),
                    &genesis,
                    bft_config.clone(),
                    node_storage[i].recovered_state(None),
                );
                node.map_err(|e| error!(node = i, error = %e, "Node failed to start"))
                    .ok()
            })
            .collect();

        info!(
            num_nodes,
            chain_id = %genesis.chain_id(),
            seed,
            "Created simulation runner"
        );

        Self {
            genesis,
            bft_config,
            roles,
            nodes,
            node_storage,
            notifications: vec![Vec::new(); num_nodes],
            event_queue: BTreeMap::new(),
            sequence: 0,
            now,
            network: SimulatedNetwork::new(network_config),
            rng: ChaCha8Rng::seed_from_u64(seed),
            timers: HashMap::new(),
            stats: SimulationStats::default(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// Current simulation time (since the unix epoch).
    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn genesis(&self) -> &Genesis {
        &self.genesis
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// A running node, or `None` if it is killed or out of range.
    pub fn node(&self, index: NodeIndex) -> Option<&NodeStateMachine> {
        self.nodes.get(index as usize).and_then(Option::as_ref)
    }

    pub fn is_alive(&self, index: NodeIndex) -> bool {
        self.node(index).is_some()
    }

    pub fn node_storage(&self, node: NodeIndex) -> Option<&SimStorage> {
        self.node_storage.get(node as usize)
    }

    /// Storage for fault injection.
    pub fn node_storage_mut(&mut self, node: NodeIndex) -> Option<&mut SimStorage> {
        self.node_storage.get_mut(node as usize)
    }

    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    /// Mutable network for partition and loss configuration.
    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    /// Notifications a node emitted, in order. Kept across restarts.
    pub fn notifications(&self, node: NodeIndex) -> &[(Duration, Notification)] {
        self.notifications
            .get(node as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// LIB of a running node.
    pub fn lib(&self, node: NodeIndex) -> Option<BlockNum> {
        self.node(node).map(|n| n.bft().lib())
    }

    /// Head block number of a running node.
    pub fn head(&self, node: NodeIndex) -> Option<BlockNum> {
        self.node(node).map(|n| n.bft().head().block_num())
    }

    /// Lowest LIB among running nodes.
    pub fn min_lib(&self) -> BlockNum {
        self.nodes
            .iter()
            .flatten()
            .map(|n| n.bft().lib())
            .min()
            .unwrap_or(0)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Start every running node.
    pub fn initialize(&mut self) {
        for index in 0..self.nodes.len() as NodeIndex {
            self.start_node(index);
        }
    }

    fn start_node(&mut self, index: NodeIndex) {
        let now = self.now;
        let Some(node) = self.nodes[index as usize].as_mut() else {
            return;
        };
        node.set_time(now);
        let actions = node.initialize();
        self.process_actions(index, actions);
    }

    /// Crash a node. Queued timers and in-flight deliveries to it are
    /// discarded; its storage is kept.
    pub fn kill_node(&mut self, index: NodeIndex) {
        if self.nodes[index as usize].take().is_none() {
            return;
        }
        self.event_queue.retain(|key, _| key.node_index != index);
        self.timers.retain(|(node, _), _| *node != index);
        info!(node = index, time = ?self.now, "Node killed");
    }

    /// Restart a killed node from its retained storage.
    pub fn relaunch_node(&mut self, index: NodeIndex) {
        if let Err(e) = self.relaunch(index, None) {
            error!(node = index, error = %e, "Node failed to relaunch");
        }
    }

    /// Restart a killed node from `snapshot`, replaying whatever log blocks
    /// its storage holds above the snapshot root. A rejected snapshot leaves
    /// the node down.
    pub fn relaunch_node_from_snapshot(
        &mut self,
        index: NodeIndex,
        snapshot: ChainSnapshot,
    ) -> Result<(), SnapshotError> {
        self.relaunch(index, Some(snapshot))
    }

    fn relaunch(
        &mut self,
        index: NodeIndex,
        snapshot: Option<ChainSnapshot>,
    ) -> Result<(), SnapshotError> {
        if self.is_alive(index) {
            warn!(node = index, "Relaunch of a running node ignored");
            return Ok(());
        }
        let recovered = self.node_storage[index as usize].recovered_state(snapshot);
        let node = NodeStateMachine::new(
            index,
            self.roles[index as usize].clone(),
            &self.genesis,
            self.bft_config.clone(),
            recovered,
        )?;
        info!(
            node = index,
            lib = node.bft().lib(),
            head = node.bft().head().block_num(),
            "Node relaunched"
        );
        self.nodes[index as usize] = Some(node);
        self.start_node(index);
        Ok(())
    }

    /// Schedule an event for a node `delay` from now (e.g. operator control).
    pub fn schedule_initial_event(&mut self, node: NodeIndex, delay: Duration, event: Event) {
        let time = self.now + delay;
        self.schedule_event(node, time, event);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event loop
    // ═══════════════════════════════════════════════════════════════════════

    /// Run simulation until no more events or time limit reached. The clock
    /// ends at `end_time`.
    pub fn run_until(&mut self, end_time: Duration) {
        trace!(
            end_time_secs = end_time.as_secs_f64(),
            "Running simulation step"
        );

        while let Some((&key, _)) = self.event_queue.first_key_value() {
            if key.time > end_time {
                break;
            }
            let Some((key, scheduled)) = self.event_queue.pop_first() else {
                break;
            };
            self.now = key.time;
            let node_index = key.node_index;

            if self.timers.get(&(node_index, TimerId::Production)) == Some(&key) {
                self.timers.remove(&(node_index, TimerId::Production));
            } else if self.timers.get(&(node_index, TimerId::Cleanup)) == Some(&key) {
                self.timers.remove(&(node_index, TimerId::Cleanup));
            }

            match scheduled {
                Scheduled::Event(event) => self.deliver_event(key, event),
                Scheduled::SyncRequest {
                    from,
                    from_num,
                    to_num,
                } => self.serve_sync_request(node_index, from, from_num, to_num),
            }
        }

        self.now = self.now.max(end_time);
        trace!(
            events_processed = self.stats.events_processed,
            actions_generated = self.stats.actions_generated,
            final_time = ?self.now,
            "Simulation step complete"
        );
    }

    /// Run for `duration` of simulated time.
    pub fn run_for(&mut self, duration: Duration) {
        let end = self.now + duration;
        self.run_until(end);
    }

    /// Run in `step` increments until `condition` holds or `limit` elapses.
    /// Returns whether the condition was met.
    pub fn run_until_condition<F>(&mut self, limit: Duration, step: Duration, condition: F) -> bool
    where
        F: Fn(&Self) -> bool,
    {
        let deadline = self.now + limit;
        while self.now < deadline {
            if condition(self) {
                return true;
            }
            self.run_until((self.now + step).min(deadline));
        }
        condition(self)
    }

    fn deliver_event(&mut self, key: EventKey, event: Event) {
        let node_index = key.node_index;
        let now = self.now;
        let Some(node) = self.nodes[node_index as usize].as_mut() else {
            if key.priority == EventPriority::Network {
                self.stats.messages_dropped_dead += 1;
            }
            return;
        };

        trace!(time = ?now, node = node_index, event = event.type_name(), "Processing event");
        self.stats.events_processed += 1;
        self.stats.events_by_priority[event.priority() as usize] += 1;

        node.set_time(now);
        let actions = node.handle(event);
        self.stats.actions_generated += actions.len() as u64;
        self.process_actions(node_index, actions);
    }

    /// Execute actions in order, dropping vote actions after a failed safety
    /// write.
    fn process_actions(&mut self, from: NodeIndex, actions: Vec<Action>) {
        let mut safety_write_failed = false;
        for action in actions {
            if safety_write_failed && action.carries_vote() {
                debug!(
                    node = from,
                    action = action.type_name(),
                    "Dropping vote after failed safety write"
                );
                continue;
            }
            if let Action::PersistSafetyState { records } = action {
                if let Err(error) = self.node_storage[from as usize].store_safety(records) {
                    warn!(node = from, %error, "Safety state write failed");
                    self.stats.safety_write_failures += 1;
                    safety_write_failed = true;
                    self.schedule_event(from, self.now, Event::SafetyStateWriteFailed { error });
                }
                continue;
            }
            self.process_action(from, action);
        }
    }

    /// Process an action from a node.
    fn process_action(&mut self, from: NodeIndex, action: Action) {
        match action {
            Action::Broadcast { message } => {
                for to in self.network.all_nodes() {
                    if to != from {
                        self.try_deliver_message(from, to, message.clone());
                    }
                }
            }

            Action::SendTo { peer, message } => {
                self.try_deliver_message(from, peer, message);
            }

            Action::SetTimer { id, duration } => {
                if let Some(old) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&old);
                }
                let fire_time = self.now + duration;
                let key = self.schedule_event(from, fire_time, Self::timer_to_event(id));
                self.timers.insert((from, id), key);
                self.stats.timers_set += 1;
            }

            Action::CancelTimer { id } => {
                if let Some(key) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&key);
                    self.stats.timers_cancelled += 1;
                }
            }

            Action::EnqueueInternal { event } => {
                self.schedule_event(from, self.now, event);
            }

            // Delegated work completes instantly in simulation.
            Action::VerifyVoteSignature {
                vote,
                from: peer,
                finality_digest,
            } => {
                let valid = vote.verify(&finality_digest);
                self.schedule_event(
                    from,
                    self.now,
                    Event::VoteSignatureVerified {
                        vote,
                        from: peer,
                        valid,
                    },
                );
            }

            Action::PersistSafetyState { records } => {
                if let Err(error) = self.node_storage[from as usize].store_safety(records) {
                    self.stats.safety_write_failures += 1;
                    self.schedule_event(from, self.now, Event::SafetyStateWriteFailed { error });
                }
            }

            Action::PersistBlock { block } => {
                self.node_storage[from as usize].put_reversible_block(block);
            }

            Action::PersistIrreversibleBlocks { blocks, lib } => {
                self.node_storage[from as usize].persist_irreversible(&blocks, lib);
            }

            Action::RemoveBlocks { ids } => {
                self.node_storage[from as usize].remove_blocks(&ids);
            }

            Action::EmitNotification { notification } => {
                trace!(node = from, notification = notification.type_name(), "Notification");
                self.notifications[from as usize].push((self.now, notification));
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════

    /// Try to deliver a message, accounting for partitions and packet loss.
    fn try_deliver_message(&mut self, from: NodeIndex, to: NodeIndex, message: OutboundMessage) {
        if to as usize >= self.nodes.len() {
            return;
        }

        let latency = match self.network.route(from, to, &mut self.rng) {
            Delivery::After(latency) => latency,
            Delivery::Partitioned => {
                self.stats.messages_dropped_partition += 1;
                trace!(from, to, "Message dropped due to partition");
                return;
            }
            Delivery::Lost => {
                self.stats.messages_dropped_loss += 1;
                trace!(from, to, "Message dropped due to packet loss");
                return;
            }
        };
        let delivery_time = self.now + latency;
        match message {
            OutboundMessage::Block(block) => {
                self.schedule_event(to, delivery_time, Event::BlockReceived { block, from });
            }
            OutboundMessage::Vote(vote) => {
                self.schedule_event(to, delivery_time, Event::VoteReceived { vote, from });
            }
            OutboundMessage::SyncRequest { from_num, to_num } => {
                self.sequence += 1;
                let key = EventKey::with_priority(
                    delivery_time,
                    EventPriority::Network,
                    to,
                    self.sequence,
                );
                self.event_queue.insert(
                    key,
                    Scheduled::SyncRequest {
                        from,
                        from_num,
                        to_num,
                    },
                );
            }
        }
        self.stats.messages_sent += 1;
    }

    /// Answer a block range request from the block log and the head branch
    /// of the serving node's fork database.
    fn serve_sync_request(
        &mut self,
        server: NodeIndex,
        peer: NodeIndex,
        from_num: BlockNum,
        to_num: BlockNum,
    ) {
        let Some(node) = self.node(server) else {
            self.stats.messages_dropped_dead += 1;
            return;
        };
        if from_num > to_num {
            return;
        }
        let to_num = to_num.min(from_num.saturating_add(MAX_SYNC_RESPONSE_BLOCKS - 1));
        let lib = node.bft().lib();

        let mut blocks: Vec<Arc<SignedBlock>> = Vec::new();
        let mut complete = true;
        if from_num <= lib {
            let end = to_num.min(lib);
            blocks = self.node_storage[server as usize].get_blocks_range(from_num, end);
            complete = blocks.len() as BlockNum == end - from_num + 1;
        }
        if complete {
            for num in from_num.max(lib + 1)..=to_num {
                match node.bft().get_block(num, Branch::Head) {
                    Some(state) => blocks.push(state.block().clone()),
                    None => break,
                }
            }
        }

        debug!(server, peer, from_num, to_num, served = blocks.len(), "Served sync request");
        self.stats.sync_requests_served += 1;
        for block in blocks {
            self.try_deliver_message(server, peer, OutboundMessage::Block(block));
        }
    }

    fn schedule_event(&mut self, node: NodeIndex, time: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, &event, node, self.sequence);
        self.event_queue.insert(key, Scheduled::Event(event));
        key
    }

    fn timer_to_event(id: TimerId) -> Event {
        match id {
            TimerId::Production => Event::ProductionTimer,
            TimerId::Cleanup => Event::CleanupTimer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::test_utils::{test_genesis, test_key, test_producer};

    fn single_node() -> SimulationRunner {
        let genesis = test_genesis(1, &[test_key(0)]);
        let role = NodeRole::producer(test_producer(0)).with_finalizer(test_key(0));
        SimulationRunner::new(
            genesis,
            vec![role],
            BftConfig::default(),
            NetworkConfig::default(),
            7,
        )
    }

    #[test]
    fn test_clock_starts_at_genesis() {
        let runner = single_node();
        assert_eq!(runner.now(), runner.genesis().initial_timestamp.to_duration());
        assert_eq!(runner.num_nodes(), 1);
        assert_eq!(runner.network().total_nodes(), 1);
    }

    #[test]
    fn test_single_node_finalizes_alone() {
        let mut runner = single_node();
        runner.initialize();
        runner.run_for(Duration::from_secs(5));

        let lib = runner.lib(0).unwrap();
        assert!(lib >= 5, "lib {lib}");
        let storage = runner.node_storage(0).unwrap();
        assert_eq!(storage.last_logged_block(), Some(lib));
        assert!(storage.safety_writes() > 0);
        assert!(runner
            .notifications(0)
            .iter()
            .any(|(_, n)| matches!(n, Notification::IrreversibleBlock { .. })));
    }

    #[test]
    fn test_kill_discards_timers() {
        let mut runner = single_node();
        runner.initialize();
        runner.run_for(Duration::from_secs(1));
        runner.kill_node(0);
        assert!(!runner.is_alive(0));
        assert!(runner.event_queue.is_empty());
        assert!(runner.timers.is_empty());

        let processed = runner.stats().events_processed;
        runner.run_for(Duration::from_secs(1));
        assert_eq!(runner.stats().events_processed, processed);
    }
}
