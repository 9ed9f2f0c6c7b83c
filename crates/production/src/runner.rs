//! Production runner implementation.

use crate::metrics;
use crate::network::{InboundMessage, NetworkError, Transport};
use crate::safety_store::{SafetyStore, SafetyStoreError};
use crate::snapshot_store::{write_snapshot, SnapshotFileError};
use crate::storage::{RocksDbStorage, StorageError};
use crate::thread_pools::{ThreadPoolError, ThreadPoolManager};
use crate::timers::TimerManager;
use keel_bft::{BftConfig, BftStats, Branch, ChainSnapshot, ChainStatus};
use keel_core::{Action, Event, NodeIndex, Notification, OutboundMessage, StateMachine};
use keel_node::{NodeRole, NodeStateMachine};
use keel_types::{
    BlockNum, FinalizerPolicy, FinalizerSafetyInfo, Genesis, ProducerName, PublicKey, SignedBlock,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};

/// Blocks returned for one sync request.
pub const MAX_SYNC_RESPONSE_BLOCKS: BlockNum = 256;

/// Attempts for a block storage write before the runner gives up.
const STORAGE_WRITE_ATTEMPTS: u32 = 4;
const STORAGE_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// LIB stall logged at info once it exceeds this.
const LIB_STALL_LOG_AFTER: Duration = Duration::from_secs(10);

/// Errors from the production runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Event channel closed")]
    ChannelClosed,

    #[error("Missing builder field: {0}")]
    MissingField(&'static str),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Safety file unusable, refusing to start: {0}")]
    SafetyCorrupt(String),

    #[error("Safety store error: {0}")]
    Safety(#[from] SafetyStoreError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotFileError),

    #[error("Snapshot rejected, refusing to start: {0}")]
    SnapshotRejected(#[from] keel_bft::SnapshotError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] ThreadPoolError),

    #[error("Blocking task failed: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for RunnerError {
    fn from(e: tokio::task::JoinError) -> Self {
        RunnerError::Join(e.to_string())
    }
}

/// Requests from operators and tooling.
#[derive(Debug)]
pub enum ControlRequest {
    /// A client-priority event (pause, resume, policy proposals).
    Event(Event),

    /// Write a snapshot of the current LIB.
    CreateSnapshot {
        reply: oneshot::Sender<Result<PathBuf, SnapshotFileError>>,
    },
}

/// Handle for shutting down a running ProductionRunner.
///
/// When dropped, signals the runner to exit gracefully.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Trigger shutdown (consumes the handle).
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Cloneable access to a running node: status, notifications and control.
///
/// Status reads never touch the state machine; the runner republishes a
/// [`ChainStatus`] after every handled event.
#[derive(Clone)]
pub struct RunnerHandle {
    control_tx: mpsc::Sender<ControlRequest>,
    status: Arc<RwLock<ChainStatus>>,
    notifications: broadcast::Sender<Notification>,
}

impl RunnerHandle {
    pub fn status(&self) -> ChainStatus {
        self.status.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    async fn send(&self, event: Event) -> Result<(), RunnerError> {
        self.control_tx
            .send(ControlRequest::Event(event))
            .await
            .map_err(|_| RunnerError::ChannelClosed)
    }

    pub async fn pause(&self) -> Result<(), RunnerError> {
        self.send(Event::PauseProduction).await
    }

    pub async fn resume(&self) -> Result<(), RunnerError> {
        self.send(Event::ResumeProduction).await
    }

    pub async fn pause_at_block(&self, block_num: BlockNum) -> Result<(), RunnerError> {
        self.send(Event::PauseAtBlock { block_num }).await
    }

    pub async fn propose_finalizer_policy(
        &self,
        policy: FinalizerPolicy,
    ) -> Result<(), RunnerError> {
        self.send(Event::ProposeFinalizerPolicy { policy }).await
    }

    pub async fn propose_producer_schedule(
        &self,
        producers: Vec<ProducerName>,
    ) -> Result<(), RunnerError> {
        self.send(Event::ProposeProducerSchedule { producers }).await
    }

    /// Write a snapshot of the current LIB and return its path.
    pub async fn create_snapshot(&self) -> Result<PathBuf, RunnerError> {
        let (reply, rx) = oneshot::channel();
        self.control_tx
            .send(ControlRequest::CreateSnapshot { reply })
            .await
            .map_err(|_| RunnerError::ChannelClosed)?;
        let path = rx.await.map_err(|_| RunnerError::ChannelClosed)??;
        Ok(path)
    }
}

/// Builder for constructing a [`ProductionRunner`].
///
/// Required fields:
/// - `genesis` - Chain parameters
/// - `storage` - RocksDB block storage
/// - `data_dir` - Directory holding the safety file and snapshots
/// - `network` - Transport and this node's inbound message stream
///
/// Optional fields:
/// - `role` - Producer accounts and finalizer keys (defaults to a relay node)
/// - `bft_config` - Consensus parameters (defaults to `BftConfig::default()`)
/// - `snapshot` - Snapshot to start from instead of genesis
/// - `thread_pools` - Thread pool manager (defaults to auto-configured)
/// - `channel_capacity` - Event channel capacity (defaults to 10,000)
pub struct ProductionRunnerBuilder {
    node_index: NodeIndex,
    role: NodeRole,
    genesis: Option<Genesis>,
    bft_config: BftConfig,
    storage: Option<Arc<RocksDbStorage>>,
    data_dir: Option<PathBuf>,
    snapshot: Option<ChainSnapshot>,
    thread_pools: Option<Arc<ThreadPoolManager>>,
    transport: Option<Arc<dyn Transport>>,
    inbound_rx: Option<mpsc::Receiver<InboundMessage>>,
    channel_capacity: usize,
}

impl Default for ProductionRunnerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductionRunnerBuilder {
    pub fn new() -> Self {
        Self {
            node_index: 0,
            role: NodeRole::default(),
            genesis: None,
            bft_config: BftConfig::default(),
            storage: None,
            data_dir: None,
            snapshot: None,
            thread_pools: None,
            transport: None,
            inbound_rx: None,
            channel_capacity: 10_000,
        }
    }

    pub fn node_index(mut self, index: NodeIndex) -> Self {
        self.node_index = index;
        self
    }

    pub fn role(mut self, role: NodeRole) -> Self {
        self.role = role;
        self
    }

    pub fn genesis(mut self, genesis: Genesis) -> Self {
        self.genesis = Some(genesis);
        self
    }

    pub fn bft_config(mut self, config: BftConfig) -> Self {
        self.bft_config = config;
        self
    }

    pub fn storage(mut self, storage: Arc<RocksDbStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn snapshot(mut self, snapshot: ChainSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn thread_pools(mut self, pools: Arc<ThreadPoolManager>) -> Self {
        self.thread_pools = Some(pools);
        self
    }

    pub fn network(
        mut self,
        transport: Arc<dyn Transport>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        self.transport = Some(transport);
        self.inbound_rx = Some(inbound_rx);
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Load persisted state and assemble the runner.
    ///
    /// Fails if the safety file is corrupt while this node holds finalizer
    /// keys: voting from an unknown lock could equivocate.
    pub fn build(self) -> Result<ProductionRunner, RunnerError> {
        let genesis = self.genesis.ok_or(RunnerError::MissingField("genesis"))?;
        let storage = self.storage.ok_or(RunnerError::MissingField("storage"))?;
        let data_dir = self.data_dir.ok_or(RunnerError::MissingField("data_dir"))?;
        let transport = self.transport.ok_or(RunnerError::MissingField("network"))?;
        let inbound_rx = self.inbound_rx.ok_or(RunnerError::MissingField("network"))?;
        let thread_pools = match self.thread_pools {
            Some(pools) => pools,
            None => Arc::new(ThreadPoolManager::auto()?),
        };

        storage.check_chain_id(genesis.chain_id())?;

        let safety_store = SafetyStore::new(&data_dir);
        let (safety_records, safety_corrupt) = safety_store.load().into_parts();
        if let (true, Some(reason)) = (self.role.can_finalize(), &safety_corrupt) {
            return Err(RunnerError::SafetyCorrupt(reason.clone()));
        }
        let recovered =
            storage.load_recovered_state(self.snapshot, safety_records, safety_corrupt)?;

        let state = NodeStateMachine::new(
            self.node_index,
            self.role,
            &genesis,
            self.bft_config,
            recovered,
        )?;

        // Channels by priority:
        // - timer_rx: production and cleanup timers, never starved by network load
        // - callback_rx: results of delegated work (vote verification) and
        //   internal events; unbounded so pool threads never block
        // - inbound_rx: peer messages
        // - control_rx: operator requests
        let (timer_tx, timer_rx) = mpsc::channel(16);
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::channel(self.channel_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (notifications, _) = broadcast::channel(self.channel_capacity);

        let status = Arc::new(RwLock::new(state.chain_status()));
        let last_stats = state.bft().stats();

        Ok(ProductionRunner {
            node_index: self.node_index,
            timer_rx,
            callback_rx,
            callback_tx,
            inbound_rx,
            control_rx,
            control_tx,
            state,
            thread_pools,
            timer_manager: TimerManager::new(timer_tx),
            transport,
            storage,
            safety_store,
            snapshot_dir: data_dir.join("snapshots"),
            status,
            notifications,
            last_stats,
            lib_stall_logged: false,
            shutdown_rx,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

/// Production runner with async I/O.
///
/// A single task owns the state machine and receives events from
/// priority-ordered channels. Vote signature checks run on the vote pool and
/// come back as callback events. Storage writes are awaited in action order.
pub struct ProductionRunner {
    node_index: NodeIndex,
    timer_rx: mpsc::Receiver<Event>,
    callback_rx: mpsc::UnboundedReceiver<Event>,
    callback_tx: mpsc::UnboundedSender<Event>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    control_rx: mpsc::Receiver<ControlRequest>,
    control_tx: mpsc::Sender<ControlRequest>,
    /// The state machine (owned, not shared).
    state: NodeStateMachine,
    thread_pools: Arc<ThreadPoolManager>,
    timer_manager: TimerManager,
    transport: Arc<dyn Transport>,
    /// RocksDB is internally thread-safe, so no external lock is needed.
    storage: Arc<RocksDbStorage>,
    safety_store: SafetyStore,
    snapshot_dir: PathBuf,
    status: Arc<RwLock<ChainStatus>>,
    notifications: broadcast::Sender<Notification>,
    last_stats: BftStats,
    lib_stall_logged: bool,
    shutdown_rx: oneshot::Receiver<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ProductionRunner {
    pub fn builder() -> ProductionRunnerBuilder {
        ProductionRunnerBuilder::new()
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            control_tx: self.control_tx.clone(),
            status: self.status.clone(),
            notifications: self.notifications.clone(),
        }
    }

    /// Take the shutdown handle.
    ///
    /// Returns a handle that when dropped triggers graceful shutdown.
    /// Can only be called once; subsequent calls return None.
    pub fn shutdown_handle(&mut self) -> Option<ShutdownHandle> {
        self.shutdown_tx
            .take()
            .map(|tx| ShutdownHandle { tx: Some(tx) })
    }

    pub fn state(&self) -> &NodeStateMachine {
        &self.state
    }

    fn wall_clock() -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }

    /// Run the main event loop until shutdown.
    ///
    /// Returns an error only for failures the node cannot continue past,
    /// such as block storage writes that keep failing.
    pub async fn run(mut self) -> Result<(), RunnerError> {
        let config = self.thread_pools.config();
        info!(
            node_index = self.node_index,
            vote_threads = config.vote_threads,
            io_threads = config.io_threads,
            head = self.state.bft().head().block_num(),
            lib = self.state.bft().lib(),
            "Starting production runner"
        );

        self.state.set_time(Self::wall_clock());
        let actions = self.state.initialize();
        self.process_actions(actions).await?;
        self.publish_status();

        let mut metrics_tick = tokio::time::interval(Duration::from_secs(1));
        metrics_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            // Biased select for priority ordering:
            // 1. Shutdown
            // 2. Timers
            // 3. Callbacks (vote verification results, internal events)
            // 4. Peer messages
            // 5. Operator requests
            // 6. Periodic metrics
            tokio::select! {
                biased;

                _ = &mut self.shutdown_rx => {
                    info!("Shutdown signal received");
                    break;
                }

                Some(event) = self.timer_rx.recv() => {
                    self.dispatch(event).await?;
                }

                Some(event) = self.callback_rx.recv() => {
                    self.dispatch(event).await?;
                }

                Some(inbound) = self.inbound_rx.recv() => {
                    metrics::record_network_message_received();
                    self.handle_inbound(inbound).await?;
                }

                Some(request) = self.control_rx.recv() => {
                    self.handle_control(request).await?;
                }

                _ = metrics_tick.tick() => {
                    self.update_metrics();
                }
            }
        }

        self.timer_manager.cancel_all();
        info!(node_index = self.node_index, "Production runner stopped");
        Ok(())
    }

    /// Feed one event through the state machine and execute its actions.
    async fn dispatch(&mut self, event: Event) -> Result<(), RunnerError> {
        let event_type = event.type_name();
        let event_span = span!(
            Level::DEBUG,
            "handle_event",
            event.type = %event_type,
            node = self.node_index,
        );
        async {
            self.state.set_time(Self::wall_clock());
            let actions = self.state.handle(event);
            if !actions.is_empty() {
                trace!(num_actions = actions.len(), "Event produced actions");
            }
            self.process_actions(actions).await?;
            self.publish_status();
            Ok::<(), RunnerError>(())
        }
        .instrument(event_span)
        .await
    }

    /// Execute actions in order.
    ///
    /// **BFT Safety Critical**: a safety write is awaited before anything
    /// after it runs, and when it fails the votes it was guarding are dropped.
    async fn process_actions(&mut self, actions: Vec<Action>) -> Result<(), RunnerError> {
        let mut safety_write_failed = false;
        for action in actions {
            if safety_write_failed && action.carries_vote() {
                debug!(action = action.type_name(), "Dropping vote after failed safety write");
                continue;
            }
            match action {
                Action::PersistSafetyState { records } => {
                    if let Err(e) = self.persist_safety(records).await {
                        error!(error = %e, "Safety state write failed, halting voting");
                        safety_write_failed = true;
                        let _ = self.callback_tx.send(Event::SafetyStateWriteFailed {
                            error: e.to_string(),
                        });
                    }
                }
                other => self.process_action(other).await?,
            }
        }
        Ok(())
    }

    async fn persist_safety(
        &self,
        records: BTreeMap<PublicKey, FinalizerSafetyInfo>,
    ) -> Result<(), RunnerError> {
        let store = self.safety_store.clone();
        tokio::task::spawn_blocking(move || store.store(&records)).await??;
        Ok(())
    }

    async fn process_action(&mut self, action: Action) -> Result<(), RunnerError> {
        match action {
            Action::Broadcast { message } => {
                if let OutboundMessage::Block(block) = &message {
                    if self.state.producers().contains(&block.header.producer) {
                        metrics::record_block_produced();
                    }
                }
                if let Err(e) = self.transport.broadcast(self.node_index, &message) {
                    warn!(error = %e, msg_type = message.type_name(), "Broadcast failed");
                }
            }

            Action::SendTo { peer, message } => {
                if let Err(e) = self.transport.send_to(self.node_index, peer, &message) {
                    warn!(error = %e, peer, msg_type = message.type_name(), "Send failed");
                }
            }

            Action::SetTimer { id, duration } => {
                self.timer_manager.set_timer(id, duration);
            }

            Action::CancelTimer { id } => {
                self.timer_manager.cancel_timer(id);
            }

            Action::EnqueueInternal { event } => {
                self.callback_tx
                    .send(event)
                    .map_err(|_| RunnerError::ChannelClosed)?;
            }

            Action::VerifyVoteSignature {
                vote,
                from,
                finality_digest,
            } => {
                let event_tx = self.callback_tx.clone();
                self.thread_pools.spawn_vote(move || {
                    let start = std::time::Instant::now();
                    let valid = vote.verify(&finality_digest);
                    metrics::record_vote_verification_latency(start.elapsed().as_secs_f64());
                    let _ = event_tx.send(Event::VoteSignatureVerified { vote, from, valid });
                });
            }

            Action::PersistSafetyState { records } => {
                self.persist_safety(records).await?;
            }

            Action::PersistBlock { block } => {
                self.storage_write("persist block", move |s| s.put_reversible_block(&block))
                    .await?;
            }

            Action::PersistIrreversibleBlocks { blocks, lib } => {
                self.storage_write("persist irreversible blocks", move |s| {
                    s.persist_irreversible(&blocks, lib)
                })
                .await?;
            }

            Action::RemoveBlocks { ids } => {
                self.storage_write("remove blocks", move |s| s.remove_blocks(&ids))
                    .await?;
            }

            Action::EmitNotification { notification } => {
                record_notification(&notification);
                // No subscribers is fine.
                let _ = self.notifications.send(notification);
            }
        }
        Ok(())
    }

    /// Run a storage write on a blocking thread, retrying with exponential
    /// backoff. Persistent failure stops the runner.
    async fn storage_write<F>(&self, what: &'static str, op: F) -> Result<(), RunnerError>
    where
        F: Fn(&RocksDbStorage) -> Result<(), StorageError> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let mut attempt = 1;
        loop {
            let storage = self.storage.clone();
            let op_ref = op.clone();
            let result = tokio::task::spawn_blocking(move || op_ref(&storage)).await?;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < STORAGE_WRITE_ATTEMPTS => {
                    let backoff = STORAGE_RETRY_BACKOFF * 2u32.pow(attempt - 1);
                    warn!(what, attempt, error = %e, ?backoff, "Storage write failed, retrying");
                    metrics::record_storage_retry();
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        what,
                        attempts = attempt,
                        error = %e,
                        "Storage write failed permanently"
                    );
                    return Err(e.into());
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inbound messages
    // ═══════════════════════════════════════════════════════════════════════

    async fn handle_inbound(&mut self, inbound: InboundMessage) -> Result<(), RunnerError> {
        let from = inbound.from;
        match inbound.message {
            OutboundMessage::Block(block) => {
                self.dispatch(Event::BlockReceived { block, from }).await
            }
            OutboundMessage::Vote(vote) => self.dispatch(Event::VoteReceived { vote, from }).await,
            OutboundMessage::SyncRequest { from_num, to_num } => {
                self.serve_sync_request(from, from_num, to_num).await;
                Ok(())
            }
        }
    }

    /// Answer a peer's block range request from the block log and the head
    /// branch of the fork database. Stops at the first missing block.
    async fn serve_sync_request(&self, peer: NodeIndex, from_num: BlockNum, to_num: BlockNum) {
        if from_num > to_num {
            return;
        }
        let to_num = to_num.min(from_num.saturating_add(MAX_SYNC_RESPONSE_BLOCKS - 1));
        let lib = self.state.bft().lib();
        let mut blocks: Vec<Arc<SignedBlock>> = Vec::new();

        if from_num <= lib {
            let storage = self.storage.clone();
            let end = to_num.min(lib);
            let read = tokio::task::spawn_blocking(move || storage.get_blocks_range(from_num, end));
            match read.await {
                Ok(Ok(logged)) => blocks.extend(logged.into_iter().map(Arc::new)),
                Ok(Err(e)) => warn!(peer, error = %e, "Block log read failed for sync request"),
                Err(e) => warn!(peer, error = %e, "Block log read task failed"),
            }
            if blocks.len() as BlockNum != end - from_num + 1 {
                // The log has a hole for this range (e.g. started from a snapshot).
                self.send_blocks(peer, blocks);
                return;
            }
        }

        for num in from_num.max(lib + 1)..=to_num {
            match self.state.bft().get_block(num, Branch::Head) {
                Some(state) => blocks.push(state.block().clone()),
                None => break,
            }
        }

        debug!(peer, from_num, to_num, served = blocks.len(), "Served sync request");
        metrics::record_sync_request_served();
        self.send_blocks(peer, blocks);
    }

    fn send_blocks(&self, peer: NodeIndex, blocks: Vec<Arc<SignedBlock>>) {
        for block in blocks {
            if let Err(e) = self
                .transport
                .send_to(self.node_index, peer, &OutboundMessage::Block(block))
            {
                warn!(peer, error = %e, "Failed to send sync response");
                return;
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Control
    // ═══════════════════════════════════════════════════════════════════════

    async fn handle_control(&mut self, request: ControlRequest) -> Result<(), RunnerError> {
        match request {
            ControlRequest::Event(event) => self.dispatch(event).await,
            ControlRequest::CreateSnapshot { reply } => {
                let snapshot = self.state.bft().snapshot();
                let dir = self.snapshot_dir.clone();
                info!(
                    block_num = snapshot.header.head_block_num,
                    "Creating snapshot"
                );
                // Written off the event loop; block application continues.
                tokio::task::spawn_blocking(move || {
                    let _ = reply.send(write_snapshot(&dir, &snapshot));
                });
                Ok(())
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Status and metrics
    // ═══════════════════════════════════════════════════════════════════════

    fn publish_status(&mut self) {
        let status = self.state.chain_status();
        metrics::set_chain_heights(status.head_block_num, status.lib_block_num);
        *self.status.write() = status;
    }

    fn update_metrics(&mut self) {
        let bft = self.state.bft();
        let stats = bft.stats();
        metrics::record_blocks_rejected(
            stats
                .blocks_rejected
                .saturating_sub(self.last_stats.blocks_rejected),
        );
        metrics::record_qcs_formed(stats.qcs_formed.saturating_sub(self.last_stats.qcs_formed));
        self.last_stats = stats;

        metrics::set_vote_pool_queue_depth(self.thread_pools.vote_queue_depth());

        let stall = Self::wall_clock().saturating_sub(bft.last_lib_advance());
        metrics::set_lib_stall(stall.as_secs_f64());
        if stall > LIB_STALL_LOG_AFTER {
            if !self.lib_stall_logged {
                info!(
                    lib = bft.lib(),
                    head = bft.head().block_num(),
                    stall_secs = stall.as_secs(),
                    "LIB not advancing"
                );
                self.lib_stall_logged = true;
            }
        } else {
            self.lib_stall_logged = false;
        }
    }
}

fn record_notification(notification: &Notification) {
    match notification {
        Notification::AcceptedBlock { .. } => metrics::record_block_applied(),
        Notification::VotedBlock { .. } => metrics::record_vote_cast(),
        Notification::AggregatedVote { status, .. } => {
            metrics::record_vote_aggregated(&status.to_string())
        }
        Notification::ForkSwitch { .. } => metrics::record_fork_switch(),
        Notification::ProductionPaused { reason } => {
            metrics::record_production_paused(&reason.to_string())
        }
        Notification::ProductionResumed => metrics::record_production_resumed(),
        Notification::IrreversibleBlock { .. } | Notification::PolicyActivated { .. } => {}
    }
}
