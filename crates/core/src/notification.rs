//! Typed notifications emitted by the finality engine.
//!
//! Telemetry, the state-history consumer and tests subscribe to these
//! instead of parsing log output.

use keel_types::{BlockId, BlockNum, PublicKey, VoteKind};
use std::fmt;

/// Outcome of processing one incoming vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoteStatus {
    Success,
    /// Same vote already aggregated; no effect.
    Duplicate,
    /// Same finalizer already voted on this block with the other strength.
    Conflicting,
    UnknownPublicKey,
    InvalidSignature,
    /// Block not known; the vote was buffered or dropped.
    UnknownBlock,
    /// Per-connection or global buffer limit reached.
    MaxExceeded,
}

impl VoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteStatus::Success => "success",
            VoteStatus::Duplicate => "duplicate",
            VoteStatus::Conflicting => "conflicting",
            VoteStatus::UnknownPublicKey => "unknown_public_key",
            VoteStatus::InvalidSignature => "invalid_signature",
            VoteStatus::UnknownBlock => "unknown_block",
            VoteStatus::MaxExceeded => "max_exceeded",
        }
    }
}

impl fmt::Display for VoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why block production is suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PauseReason {
    /// Operator called `pause()`.
    Operator,
    /// Head reached the configured `pause_at_block`.
    AtBlock(BlockNum),
    /// No votes arrived and LIB did not move within the vote timeout.
    VoteTimeout,
    /// `head - lib` exceeds the reversible block cap.
    MaxReversibleBlocks,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::Operator => f.write_str("operator"),
            PauseReason::AtBlock(n) => write!(f, "pause-at-block {n}"),
            PauseReason::VoteTimeout => f.write_str("vote timeout"),
            PauseReason::MaxReversibleBlocks => f.write_str("max reversible blocks"),
        }
    }
}

/// Events published by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A block was validated and added to the fork database.
    AcceptedBlock { block_num: BlockNum, block_id: BlockId },

    /// A block became irreversible.
    IrreversibleBlock { block_num: BlockNum, block_id: BlockId },

    /// Head moved to a block that does not descend from the previous head.
    ForkSwitch { from: BlockId, to: BlockId },

    /// A local finalizer voted.
    VotedBlock {
        finalizer_key: PublicKey,
        block_id: BlockId,
        kind: VoteKind,
    },

    /// An incoming vote was processed.
    AggregatedVote {
        finalizer_key: PublicKey,
        block_id: BlockId,
        status: VoteStatus,
    },

    /// A finalizer policy became active.
    PolicyActivated { generation: u32, block_num: BlockNum },

    ProductionPaused { reason: PauseReason },

    ProductionResumed,
}

impl Notification {
    pub fn type_name(&self) -> &'static str {
        match self {
            Notification::AcceptedBlock { .. } => "AcceptedBlock",
            Notification::IrreversibleBlock { .. } => "IrreversibleBlock",
            Notification::ForkSwitch { .. } => "ForkSwitch",
            Notification::VotedBlock { .. } => "VotedBlock",
            Notification::AggregatedVote { .. } => "AggregatedVote",
            Notification::PolicyActivated { .. } => "PolicyActivated",
            Notification::ProductionPaused { .. } => "ProductionPaused",
            Notification::ProductionResumed => "ProductionResumed",
        }
    }
}
