//! Finalizer votes.

use crate::{weak_digest, BlockId, BlockNum, Hash, KeyPair, PublicKey, Signature};
use sbor::prelude::BasicSbor;
use std::fmt;

/// Strength of a finalizer vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BasicSbor)]
pub enum VoteKind {
    Strong,
    Weak,
}

impl fmt::Display for VoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteKind::Strong => f.write_str("strong"),
            VoteKind::Weak => f.write_str("weak"),
        }
    }
}

/// A vote by one finalizer on one block.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Vote {
    pub block_id: BlockId,
    pub kind: VoteKind,
    pub finalizer_key: PublicKey,
    pub signature: Signature,
}

impl Vote {
    /// Sign a vote on a block with the given finality digest.
    pub fn sign(key: &KeyPair, block_id: BlockId, finality_digest: &Hash, kind: VoteKind) -> Self {
        let msg = Self::signing_message(finality_digest, kind);
        Self {
            block_id,
            kind,
            finalizer_key: key.public_key(),
            signature: key.sign(msg.as_bytes()),
        }
    }

    /// The digest a vote of `kind` signs.
    pub fn signing_message(finality_digest: &Hash, kind: VoteKind) -> Hash {
        match kind {
            VoteKind::Strong => *finality_digest,
            VoteKind::Weak => weak_digest(finality_digest),
        }
    }

    pub fn block_num(&self) -> BlockNum {
        self.block_id.block_num()
    }

    pub fn is_strong(&self) -> bool {
        self.kind == VoteKind::Strong
    }

    pub fn verify(&self, finality_digest: &Hash) -> bool {
        let msg = Self::signing_message(finality_digest, self.kind);
        self.finalizer_key.verify(msg.as_bytes(), &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_signature_binds_kind() {
        let key = KeyPair::from_seed(&[4u8; 32]);
        let id = BlockId::new(9, &Hash::from_bytes(b"b9"));
        let digest = Hash::from_bytes(b"finality");

        let mut vote = Vote::sign(&key, id, &digest, VoteKind::Strong);
        assert!(vote.verify(&digest));
        assert_eq!(vote.block_num(), 9);

        vote.kind = VoteKind::Weak;
        assert!(!vote.verify(&digest));
    }
}
