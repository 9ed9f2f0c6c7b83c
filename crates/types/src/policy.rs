//! Finalizer and proposer policies.

use crate::{BlockTimestamp, Hash, ProducerName, PublicKey};
use sbor::prelude::BasicSbor;
use std::collections::HashSet;
use thiserror::Error;

/// Structural problems with a proposed policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("policy has no members")]
    Empty,
    #[error("finalizer {0} listed more than once")]
    DuplicateFinalizer(String),
    #[error("finalizer {0} has zero weight")]
    ZeroWeight(String),
    #[error("threshold {threshold} must exceed half of total weight {total}")]
    ThresholdTooLow { threshold: u64, total: u64 },
    #[error("threshold {threshold} exceeds total weight {total}")]
    ThresholdTooHigh { threshold: u64, total: u64 },
    #[error("producer {0} listed more than once")]
    DuplicateProducer(String),
}

/// One member of a finalizer policy.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct FinalizerAuthority {
    /// Human-readable label (operator name, host).
    pub description: String,
    pub weight: u64,
    pub public_key: PublicKey,
}

/// The set of finalizers entitled to vote, with weights and quorum threshold.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct FinalizerPolicy {
    /// Strictly increasing across proposals.
    pub generation: u32,
    /// Summed weight required for a quorum.
    pub threshold: u64,
    pub finalizers: Vec<FinalizerAuthority>,
}

impl FinalizerPolicy {
    /// A policy with threshold `2/3 * total + 1`.
    pub fn with_two_thirds_threshold(generation: u32, finalizers: Vec<FinalizerAuthority>) -> Self {
        let total: u64 = finalizers.iter().map(|f| f.weight).sum();
        Self {
            generation,
            threshold: total * 2 / 3 + 1,
            finalizers,
        }
    }

    pub fn total_weight(&self) -> u64 {
        self.finalizers.iter().map(|f| f.weight).sum()
    }

    /// Weak votes beyond this sum make a strong quorum impossible.
    pub fn max_weak_sum_before_weak_final(&self) -> u64 {
        self.total_weight().saturating_sub(self.threshold)
    }

    /// Position of `key` in the finalizer list.
    pub fn index_of(&self, key: &PublicKey) -> Option<usize> {
        self.finalizers.iter().position(|f| f.public_key == *key)
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.index_of(key).is_some()
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.finalizers.is_empty() {
            return Err(PolicyError::Empty);
        }
        let mut seen = HashSet::new();
        for f in &self.finalizers {
            if f.weight == 0 {
                return Err(PolicyError::ZeroWeight(f.description.clone()));
            }
            if !seen.insert(f.public_key) {
                return Err(PolicyError::DuplicateFinalizer(f.description.clone()));
            }
        }
        let total = self.total_weight();
        if self.threshold <= total / 2 {
            return Err(PolicyError::ThresholdTooLow {
                threshold: self.threshold,
                total,
            });
        }
        if self.threshold > total {
            return Err(PolicyError::ThresholdTooHigh {
                threshold: self.threshold,
                total,
            });
        }
        Ok(())
    }

    /// Digest committed to by blocks carrying this policy.
    pub fn digest(&self) -> Hash {
        match sbor::basic_encode(self) {
            Ok(bytes) => Hash::from_bytes(&bytes),
            Err(_) => Hash::ZERO,
        }
    }
}

/// The producer schedule.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ProposerPolicy {
    pub version: u32,
    /// Slot of the block that proposed this schedule.
    pub proposal_time: BlockTimestamp,
    pub producers: Vec<ProducerName>,
}

impl ProposerPolicy {
    pub fn new(version: u32, producers: Vec<ProducerName>) -> Self {
        Self {
            version,
            proposal_time: BlockTimestamp::default(),
            producers,
        }
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.producers.is_empty() {
            return Err(PolicyError::Empty);
        }
        let mut seen = HashSet::new();
        for p in &self.producers {
            if !seen.insert(p) {
                return Err(PolicyError::DuplicateProducer(p.0.clone()));
            }
        }
        Ok(())
    }
}
