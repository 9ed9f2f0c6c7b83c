//! Core types for the Keel finality engine.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: Hash, BLS keys and signatures
//! - **Identifiers**: BlockId, BlockTimestamp, ProducerName, ChainId
//! - **Consensus types**: SignedBlock, FinalizerPolicy, Vote, QuorumCertificate
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend on
//! any other workspace crates, making it the foundation layer.

mod crypto;
mod hash;
mod identifiers;
mod signing;

// Consensus types
mod block;
mod genesis;
mod policy;
mod quorum_certificate;
mod safety_info;
mod vote;
mod vote_bitset;

pub use crypto::{CryptoError, KeyPair, PublicKey, Signature, BLS_DST};
pub use hash::{Hash, HexError};
pub use identifiers::{BlockId, BlockNum, BlockTimestamp, ChainId, ProducerName};
pub use signing::{finality_digest, weak_digest, DOMAIN_FINALITY, WEAK_SUFFIX};

pub use block::{BlockHeader, SignedBlock};
pub use genesis::Genesis;
pub use policy::{FinalizerAuthority, FinalizerPolicy, PolicyError, ProposerPolicy};
pub use quorum_certificate::{QcClaim, QcError, QcSig, QuorumCertificate};
pub use safety_info::{BlockRef, FinalizerSafetyInfo};
pub use vote::{Vote, VoteKind};
pub use vote_bitset::VoteBitset;

/// Number of consecutive slots assigned to each producer.
pub const PRODUCER_REPETITIONS: u32 = 12;

/// Test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;

    /// Deterministic finalizer key for index `i`.
    pub fn test_key(i: u8) -> KeyPair {
        KeyPair::from_seed(&[i.wrapping_add(1); 32])
    }

    /// Producer name for index `i` ("prod-a", "prod-b", ...).
    pub fn test_producer(i: u8) -> ProducerName {
        ProducerName::new(format!("prod-{}", (b'a' + i) as char))
    }

    /// Equal-weight policy over `keys` with a 2/3+1 threshold.
    pub fn test_policy(generation: u32, keys: &[KeyPair]) -> FinalizerPolicy {
        FinalizerPolicy::with_two_thirds_threshold(
            generation,
            keys.iter()
                .enumerate()
                .map(|(i, k)| FinalizerAuthority {
                    description: format!("finalizer-{i}"),
                    weight: 1,
                    public_key: k.public_key(),
                })
                .collect(),
        )
    }

    /// Genesis with `producers` producers and an equal-weight policy over `keys`.
    pub fn test_genesis(producers: u8, keys: &[KeyPair]) -> Genesis {
        Genesis {
            initial_timestamp: BlockTimestamp(1_000),
            initial_producers: (0..producers).map(test_producer).collect(),
            initial_finalizer_policy: if keys.is_empty() {
                None
            } else {
                Some(test_policy(1, keys))
            },
        }
    }
}
