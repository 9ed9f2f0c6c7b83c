//! In-process transport connecting runners through bounded channels.

use super::{decode_message, encode_message, InboundMessage, NetworkError, Transport};
use crate::metrics;
use keel_core::{NodeIndex, OutboundMessage};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// A hub that delivers encoded messages between registered nodes.
///
/// Every message passes through the wire codec, so what a peer receives is
/// exactly what a remote peer would decode.
pub struct LocalNetwork {
    peers: RwLock<HashMap<NodeIndex, mpsc::Sender<InboundMessage>>>,
    capacity: usize,
}

impl LocalNetwork {
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Attach a node and return its inbound message stream.
    pub fn register(
        &self,
        node: NodeIndex,
    ) -> Result<mpsc::Receiver<InboundMessage>, NetworkError> {
        let mut peers = self.peers.write();
        if peers.contains_key(&node) {
            return Err(NetworkError::AlreadyRegistered(node));
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        peers.insert(node, tx);
        Ok(rx)
    }

    /// Detach a node; messages to it are dropped from now on.
    pub fn disconnect(&self, node: NodeIndex) {
        self.peers.write().remove(&node);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    fn deliver(
        &self,
        from: NodeIndex,
        to: NodeIndex,
        tx: &mpsc::Sender<InboundMessage>,
        bytes: &[u8],
    ) -> Result<(), NetworkError> {
        let message = decode_message(bytes)?;
        match tx.try_send(InboundMessage { from, message }) {
            Ok(()) => {
                metrics::record_network_message_sent();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(from, to, "Peer inbound queue full, dropping message");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(from, to, "Peer gone, dropping message");
                Ok(())
            }
        }
    }
}

impl Transport for LocalNetwork {
    fn broadcast(&self, from: NodeIndex, message: &OutboundMessage) -> Result<(), NetworkError> {
        let bytes = encode_message(message)?;
        let peers = self.peers.read();
        for (&to, tx) in peers.iter() {
            if to != from {
                self.deliver(from, to, tx, &bytes)?;
            }
        }
        Ok(())
    }

    fn send_to(
        &self,
        from: NodeIndex,
        peer: NodeIndex,
        message: &OutboundMessage,
    ) -> Result<(), NetworkError> {
        let bytes = encode_message(message)?;
        let peers = self.peers.read();
        let tx = peers.get(&peer).ok_or(NetworkError::UnknownPeer(peer))?;
        self.deliver(from, peer, tx, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_request() -> OutboundMessage {
        OutboundMessage::SyncRequest {
            from_num: 1,
            to_num: 3,
        }
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let network = LocalNetwork::new(8);
        let mut rx0 = network.register(0).unwrap();
        let mut rx1 = network.register(1).unwrap();
        let mut rx2 = network.register(2).unwrap();

        network.broadcast(0, &sync_request()).unwrap();

        assert_eq!(rx1.recv().await.unwrap().from, 0);
        assert_eq!(rx2.recv().await.unwrap().from, 0);
        assert!(rx0.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_and_disconnect() {
        let network = LocalNetwork::new(8);
        let _rx0 = network.register(0).unwrap();
        let mut rx1 = network.register(1).unwrap();
        assert!(matches!(
            network.register(1),
            Err(NetworkError::AlreadyRegistered(1))
        ));

        network.send_to(0, 1, &sync_request()).unwrap();
        let inbound = rx1.recv().await.unwrap();
        assert!(matches!(
            inbound.message,
            OutboundMessage::SyncRequest { from_num: 1, to_num: 3 }
        ));

        network.disconnect(1);
        assert_eq!(network.peer_count(), 1);
        assert!(matches!(
            network.send_to(0, 1, &sync_request()),
            Err(NetworkError::UnknownPeer(1))
        ));
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let network = LocalNetwork::new(1);
        let _rx0 = network.register(0).unwrap();
        let mut rx1 = network.register(1).unwrap();

        network.send_to(0, 1, &sync_request()).unwrap();
        network.send_to(0, 1, &sync_request()).unwrap();

        assert!(rx1.recv().await.is_some());
        assert!(rx1.try_recv().is_err());
    }
}
