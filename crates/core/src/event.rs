//! Event types for the deterministic state machine.

use crate::NodeIndex;
use keel_types::{BlockId, BlockNum, FinalizerPolicy, ProducerName, SignedBlock, Vote};
use std::sync::Arc;

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// This ensures causality is preserved: internal events (consequences of
/// processing an event) are handled before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    Internal = 0,

    /// Timer events: scheduled by the node itself.
    Timer = 1,

    /// Network events: external inputs from other nodes.
    Network = 2,

    /// Operator control requests.
    Client = 3,
}

/// All possible events a node can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// Start of a production slot.
    ProductionTimer,

    /// Periodic cleanup of buffered votes and orphan blocks.
    CleanupTimer,

    // ═══════════════════════════════════════════════════════════════════════
    // Network (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// A block arrived from a peer (`applyBlock`).
    BlockReceived {
        block: Arc<SignedBlock>,
        from: NodeIndex,
    },

    /// A vote arrived from a peer (`applyVote`).
    VoteReceived { vote: Vote, from: NodeIndex },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// Result of a delegated vote signature check.
    VoteSignatureVerified {
        vote: Vote,
        from: NodeIndex,
        valid: bool,
    },

    /// A local finalizer's vote, fed back after broadcast so it is
    /// aggregated like any other vote.
    LocalVoteCast { vote: Vote },

    /// A QC on `block_id` became available locally, or upgraded to strong.
    QuorumCertificateFormed { block_id: BlockId, strong: bool },

    /// The runner failed to persist the safety state; voting must halt.
    SafetyStateWriteFailed { error: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Operator control (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// Propose a new finalizer policy in the next locally produced block.
    ProposeFinalizerPolicy { policy: FinalizerPolicy },

    /// Propose a new producer schedule in the next locally produced block.
    ProposeProducerSchedule { producers: Vec<ProducerName> },

    PauseProduction,

    /// Clears operator pause and any `pause_at_block`.
    ResumeProduction,

    /// Stop producing and applying blocks above `block_num`.
    PauseAtBlock { block_num: BlockNum },
}

impl Event {
    /// Get the priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::VoteSignatureVerified { .. }
            | Event::LocalVoteCast { .. }
            | Event::QuorumCertificateFormed { .. }
            | Event::SafetyStateWriteFailed { .. } => EventPriority::Internal,

            Event::ProductionTimer | Event::CleanupTimer => EventPriority::Timer,

            Event::BlockReceived { .. } | Event::VoteReceived { .. } => EventPriority::Network,

            Event::ProposeFinalizerPolicy { .. }
            | Event::ProposeProducerSchedule { .. }
            | Event::PauseProduction
            | Event::ResumeProduction
            | Event::PauseAtBlock { .. } => EventPriority::Client,
        }
    }

    /// Check if this is an internal event (consequence of prior processing).
    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }

    /// Check if this is a network event (from another node).
    pub fn is_network(&self) -> bool {
        self.priority() == EventPriority::Network
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::ProductionTimer => "ProductionTimer",
            Event::CleanupTimer => "CleanupTimer",
            Event::BlockReceived { .. } => "BlockReceived",
            Event::VoteReceived { .. } => "VoteReceived",
            Event::VoteSignatureVerified { .. } => "VoteSignatureVerified",
            Event::LocalVoteCast { .. } => "LocalVoteCast",
            Event::QuorumCertificateFormed { .. } => "QuorumCertificateFormed",
            Event::SafetyStateWriteFailed { .. } => "SafetyStateWriteFailed",
            Event::ProposeFinalizerPolicy { .. } => "ProposeFinalizerPolicy",
            Event::ProposeProducerSchedule { .. } => "ProposeProducerSchedule",
            Event::PauseProduction => "PauseProduction",
            Event::ResumeProduction => "ResumeProduction",
            Event::PauseAtBlock { .. } => "PauseAtBlock",
        }
    }
}
