//! Block header and block.

use crate::{
    BlockId, BlockNum, BlockTimestamp, FinalizerPolicy, Hash, ProducerName, ProposerPolicy,
    QcClaim, QuorumCertificate,
};
use sbor::prelude::BasicSbor;

/// Block header.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct BlockHeader {
    pub block_num: BlockNum,
    /// Id of the parent block.
    pub previous: BlockId,
    pub timestamp: BlockTimestamp,
    pub producer: ProducerName,
    /// Highest QC this block claims over its ancestors.
    pub qc_claim: QcClaim,
    /// Finalizer policy proposed by this block.
    pub new_finalizer_policy: Option<FinalizerPolicy>,
    /// Producer schedule proposed by this block.
    pub new_proposer_policy: Option<ProposerPolicy>,
    /// Digest of the block payload. Transactions are carried elsewhere.
    pub payload_root: Hash,
}

impl BlockHeader {
    /// Compute the id of this header.
    pub fn calculate_id(&self) -> BlockId {
        let digest = match sbor::basic_encode(self) {
            Ok(bytes) => Hash::from_bytes(&bytes),
            Err(_) => Hash::ZERO,
        };
        BlockId::new(self.block_num, &digest)
    }
}

/// A block as exchanged on the network and stored in the block log.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct SignedBlock {
    pub header: BlockHeader,
    /// QC over the claimed ancestor; required whenever the claim advances.
    pub qc: Option<QuorumCertificate>,
}

impl SignedBlock {
    pub fn new(header: BlockHeader, qc: Option<QuorumCertificate>) -> Self {
        Self { header, qc }
    }

    pub fn id(&self) -> BlockId {
        self.header.calculate_id()
    }

    pub fn block_num(&self) -> BlockNum {
        self.header.block_num
    }

    pub fn previous(&self) -> BlockId {
        self.header.previous
    }

    pub fn timestamp(&self) -> BlockTimestamp {
        self.header.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(num: BlockNum) -> BlockHeader {
        BlockHeader {
            block_num: num,
            previous: BlockId::NONE,
            timestamp: BlockTimestamp(num),
            producer: ProducerName::new("alice"),
            qc_claim: QcClaim::new(num.saturating_sub(1), false),
            new_finalizer_policy: None,
            new_proposer_policy: None,
            payload_root: Hash::ZERO,
        }
    }

    #[test]
    fn test_id_changes_with_content() {
        let a = header(7);
        let mut b = header(7);
        b.producer = ProducerName::new("bob");
        assert_eq!(a.calculate_id().block_num(), 7);
        assert_ne!(a.calculate_id(), b.calculate_id());
        assert_eq!(a.calculate_id(), header(7).calculate_id());
    }
}
