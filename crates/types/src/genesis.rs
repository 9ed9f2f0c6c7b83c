//! Genesis parameters.

use crate::{BlockTimestamp, ChainId, FinalizerPolicy, Hash, ProducerName};
use sbor::prelude::BasicSbor;

/// Parameters fixed at chain creation.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Genesis {
    pub initial_timestamp: BlockTimestamp,
    pub initial_producers: Vec<ProducerName>,
    /// When `None` the chain starts without finality and a policy must be
    /// proposed to activate it.
    pub initial_finalizer_policy: Option<FinalizerPolicy>,
}

impl Genesis {
    pub fn chain_id(&self) -> ChainId {
        let digest = match sbor::basic_encode(self) {
            Ok(bytes) => Hash::from_bytes(&bytes),
            Err(_) => Hash::ZERO,
        };
        ChainId(digest)
    }
}
