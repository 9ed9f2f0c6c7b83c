//! Action types for the deterministic state machine.

use crate::{message::OutboundMessage, Event, NodeIndex, Notification, TimerId};
use keel_types::{BlockId, FinalizerSafetyInfo, Hash, PublicKey, SignedBlock, Vote};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do.
/// The runner executes actions in order and may convert results back into
/// events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Broadcast a message to all connected peers.
    Broadcast { message: OutboundMessage },

    /// Send a message to a single peer.
    SendTo {
        peer: NodeIndex,
        message: OutboundMessage,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════════
    // Delegated Work (async, returns callback event)
    // ═══════════════════════════════════════════════════════════════════════
    /// Verify a vote signature.
    ///
    /// Delegated to the vote-thread pool in production, inline in simulation.
    /// Returns `Event::VoteSignatureVerified` when complete.
    VerifyVoteSignature {
        vote: Vote,
        from: NodeIndex,
        /// Finality digest of the voted block; weak votes sign its weak form.
        finality_digest: Hash,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Storage
    // ═══════════════════════════════════════════════════════════════════════
    /// Durably persist the safety state of all local finalizers.
    ///
    /// BFT SAFETY CRITICAL: the runner must complete this write before it
    /// processes any later action. Votes follow this action in the same batch.
    /// On failure the runner skips the remaining broadcasts of the batch and
    /// reports `Event::SafetyStateWriteFailed`.
    PersistSafetyState {
        records: BTreeMap<PublicKey, FinalizerSafetyInfo>,
    },

    /// Persist a reversible block to the fork database store.
    PersistBlock { block: Arc<SignedBlock> },

    /// Append newly irreversible blocks to the block log and drop them from
    /// the fork database store in one atomic batch.
    PersistIrreversibleBlocks {
        blocks: Vec<Arc<SignedBlock>>,
        lib: BlockId,
    },

    /// Remove pruned or rejected reversible blocks from the fork database store.
    RemoveBlocks { ids: Vec<BlockId> },

    // ═══════════════════════════════════════════════════════════════════════
    // Notifications
    // ═══════════════════════════════════════════════════════════════════════
    /// Publish a notification to subscribers.
    EmitNotification { notification: Notification },
}

impl Action {
    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::SendTo { .. } => "SendTo",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::VerifyVoteSignature { .. } => "VerifyVoteSignature",
            Action::PersistSafetyState { .. } => "PersistSafetyState",
            Action::PersistBlock { .. } => "PersistBlock",
            Action::PersistIrreversibleBlocks { .. } => "PersistIrreversibleBlocks",
            Action::RemoveBlocks { .. } => "RemoveBlocks",
            Action::EmitNotification { .. } => "EmitNotification",
        }
    }

    /// Shorthand for wrapping a notification.
    pub fn notify(notification: Notification) -> Self {
        Action::EmitNotification { notification }
    }

    /// Whether this action releases or records a local vote.
    ///
    /// The runner drops these when the preceding safety write failed.
    pub fn carries_vote(&self) -> bool {
        matches!(
            self,
            Action::Broadcast {
                message: OutboundMessage::Vote(_)
            } | Action::EnqueueInternal {
                event: Event::LocalVoteCast { .. }
            } | Action::EmitNotification {
                notification: Notification::VotedBlock { .. }
            }
        )
    }
}
