//! Quorum certificates.

use crate::{
    weak_digest, BlockId, BlockNum, FinalizerPolicy, Hash, PublicKey, Signature, VoteBitset,
};
use sbor::prelude::BasicSbor;
use std::cmp::Ordering;
use thiserror::Error;

/// Reasons a QC fails verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QcError {
    #[error("qc carries no votes")]
    NoVotes,
    #[error("vote bitset sized {got} for a policy of {expected} finalizers")]
    BitsetSize { expected: usize, got: usize },
    #[error("finalizer voted both strong and weak")]
    DoubleVote,
    #[error("voting weight {weight} below threshold {threshold}")]
    InsufficientWeight { weight: u64, threshold: u64 },
    #[error("aggregate signature does not verify")]
    InvalidSignature,
    #[error("qc requires a signature for the pending policy")]
    MissingPendingSig,
    #[error("qc carries a pending policy signature but no policy is pending")]
    UnexpectedPendingSig,
}

/// A claim, made by a block header, that a QC exists for an ancestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BasicSbor)]
pub struct QcClaim {
    pub block_num: BlockNum,
    pub is_strong_qc: bool,
}

impl QcClaim {
    pub fn new(block_num: BlockNum, is_strong_qc: bool) -> Self {
        Self {
            block_num,
            is_strong_qc,
        }
    }
}

impl PartialOrd for QcClaim {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QcClaim {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.block_num, self.is_strong_qc).cmp(&(other.block_num, other.is_strong_qc))
    }
}

/// Aggregated votes of one finalizer policy.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct QcSig {
    pub strong_votes: Option<VoteBitset>,
    pub weak_votes: Option<VoteBitset>,
    pub signature: Signature,
}

impl QcSig {
    pub fn is_strong(&self) -> bool {
        self.weak_votes.is_none()
    }

    /// Check bitset shape and voting weight against `policy`.
    pub fn verify_weights(&self, policy: &FinalizerPolicy) -> Result<(), QcError> {
        let n = policy.finalizers.len();
        for bitset in [&self.strong_votes, &self.weak_votes].into_iter().flatten() {
            if bitset.len() != n {
                return Err(QcError::BitsetSize {
                    expected: n,
                    got: bitset.len(),
                });
            }
        }
        if let (Some(strong), Some(weak)) = (&self.strong_votes, &self.weak_votes) {
            if strong.intersects(weak) {
                return Err(QcError::DoubleVote);
            }
        }

        let weight_of = |bits: &Option<VoteBitset>| -> u64 {
            bits.as_ref()
                .map(|b| b.iter_set().map(|i| policy.finalizers[i].weight).sum())
                .unwrap_or(0)
        };
        let weight = weight_of(&self.strong_votes) + weight_of(&self.weak_votes);
        if self.strong_votes.is_none() && self.weak_votes.is_none() {
            return Err(QcError::NoVotes);
        }
        if weight < policy.threshold {
            return Err(QcError::InsufficientWeight {
                weight,
                threshold: policy.threshold,
            });
        }
        Ok(())
    }

    /// Verify the aggregate signature over the block's finality digest.
    pub fn verify_signature(
        &self,
        policy: &FinalizerPolicy,
        finality_digest: &Hash,
    ) -> Result<(), QcError> {
        let keys = |bits: &Option<VoteBitset>| -> Vec<PublicKey> {
            bits.as_ref()
                .map(|b| b.iter_set().map(|i| policy.finalizers[i].public_key).collect())
                .unwrap_or_default()
        };
        let strong_keys = keys(&self.strong_votes);
        let weak_keys = keys(&self.weak_votes);
        let weak = weak_digest(finality_digest);

        let groups: [(&[PublicKey], &[u8]); 2] = [
            (strong_keys.as_slice(), finality_digest.as_bytes().as_slice()),
            (weak_keys.as_slice(), weak.as_bytes().as_slice()),
        ];
        if self.signature.verify_aggregate(&groups) {
            Ok(())
        } else {
            Err(QcError::InvalidSignature)
        }
    }

    pub fn verify(&self, policy: &FinalizerPolicy, finality_digest: &Hash) -> Result<(), QcError> {
        self.verify_weights(policy)?;
        self.verify_signature(policy, finality_digest)
    }
}

/// Proof that a weighted quorum of finalizers voted for a block.
///
/// While a finalizer policy is pending, a QC needs a quorum of both the
/// active and the pending policy.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct QuorumCertificate {
    pub block_id: BlockId,
    pub active_policy_sig: QcSig,
    pub pending_policy_sig: Option<QcSig>,
}

impl QuorumCertificate {
    pub fn block_num(&self) -> BlockNum {
        self.block_id.block_num()
    }

    pub fn is_strong(&self) -> bool {
        self.active_policy_sig.is_strong()
            && self
                .pending_policy_sig
                .as_ref()
                .map(QcSig::is_strong)
                .unwrap_or(true)
    }

    pub fn to_claim(&self) -> QcClaim {
        QcClaim::new(self.block_num(), self.is_strong())
    }

    /// Verify against the policies in force at the certified block.
    pub fn verify(
        &self,
        active: &FinalizerPolicy,
        pending: Option<&FinalizerPolicy>,
        finality_digest: &Hash,
    ) -> Result<(), QcError> {
        self.active_policy_sig.verify(active, finality_digest)?;
        match (pending, &self.pending_policy_sig) {
            (Some(policy), Some(sig)) => sig.verify(policy, finality_digest),
            (Some(_), None) => Err(QcError::MissingPendingSig),
            (None, Some(_)) => Err(QcError::UnexpectedPendingSig),
            (None, None) => Ok(()),
        }
    }
}
