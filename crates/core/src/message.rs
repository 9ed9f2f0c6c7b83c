//! Outbound message types for network communication.

use keel_types::{BlockNum, SignedBlock, Vote};
use std::sync::Arc;

/// Outbound network messages.
///
/// These are the messages that a node can send to other nodes.
/// The runner handles the actual network I/O.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// A produced or relayed block.
    Block(Arc<SignedBlock>),

    /// A finalizer vote.
    Vote(Vote),

    /// Ask a peer for the blocks `from_num..=to_num` on its best branch.
    ///
    /// The runner answers from the peer's block log and fork database; the
    /// response arrives as a sequence of `Block` messages.
    SyncRequest { from_num: BlockNum, to_num: BlockNum },
}

impl OutboundMessage {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::Block(_) => "Block",
            OutboundMessage::Vote(_) => "Vote",
            OutboundMessage::SyncRequest { .. } => "SyncRequest",
        }
    }
}
