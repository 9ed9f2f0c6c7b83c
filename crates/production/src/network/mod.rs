//! Network seam between the runner and a peer-to-peer transport.
//!
//! The runner only needs to broadcast, send to one peer, and receive
//! messages tagged with the sender. [`LocalNetwork`] wires several runners
//! together inside one process over the wire codec.

mod codec;
mod local;

pub use codec::{decode_message, encode_message, CodecError, WIRE_VERSION};
pub use local::LocalNetwork;

use keel_core::{NodeIndex, OutboundMessage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Unknown peer {0}")]
    UnknownPeer(NodeIndex),

    #[error("Node {0} already registered")]
    AlreadyRegistered(NodeIndex),
}

/// A message received from a peer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from: NodeIndex,
    pub message: OutboundMessage,
}

/// Outbound side of a peer-to-peer transport.
///
/// Delivery is best effort: the consensus engine tolerates loss and
/// re-requests missing blocks.
pub trait Transport: Send + Sync + 'static {
    fn broadcast(&self, from: NodeIndex, message: &OutboundMessage) -> Result<(), NetworkError>;

    fn send_to(
        &self,
        from: NodeIndex,
        peer: NodeIndex,
        message: &OutboundMessage,
    ) -> Result<(), NetworkError>;
}
