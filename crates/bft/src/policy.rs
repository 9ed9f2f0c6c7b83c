//! Finalizer policy lifecycle.
//!
//! A policy moves through `Proposed → Pending → Active → Retired`:
//!
//! - proposed when a block carries it;
//! - pending once the proposing block is irreversible (at most one at a time);
//! - active once the block where it became pending is irreversible, retiring
//!   the previously active policy.

use keel_types::{BlockNum, FinalizerPolicy};
use sbor::prelude::BasicSbor;
use std::fmt;
use std::sync::Arc;

/// Finality phase of the protocol as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor)]
pub enum ProtocolPhase {
    /// No finalizer policy yet; LIB follows producer confirmations.
    NoPolicy,
    /// The first policy is pending; finalizers vote but LIB still follows
    /// producer confirmations until the activation block is irreversible.
    ActivationPending,
    /// LIB follows the QC commit rule.
    Active,
}

impl fmt::Display for ProtocolPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolPhase::NoPolicy => write!(f, "no-policy"),
            ProtocolPhase::ActivationPending => write!(f, "activation-pending"),
            ProtocolPhase::Active => write!(f, "active"),
        }
    }
}

/// A policy together with the block number it entered its current state at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedPolicy {
    /// Proposing block for proposed policies; the block where it became
    /// pending for pending policies.
    pub block_num: BlockNum,
    pub policy: Arc<FinalizerPolicy>,
}

impl TrackedPolicy {
    pub fn new(block_num: BlockNum, policy: Arc<FinalizerPolicy>) -> Self {
        Self { block_num, policy }
    }
}

/// Result of [`evaluate_policy_promotion`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyPromotion {
    pub active: Option<Arc<FinalizerPolicy>>,
    pub pending: Option<TrackedPolicy>,
    pub proposed: Vec<TrackedPolicy>,
    /// Previously active policy retired by this evaluation.
    pub retired: Option<Arc<FinalizerPolicy>>,
    /// Set when the pending policy was promoted to active.
    pub activated: bool,
}

/// Apply the lifecycle transitions for a new block.
///
/// `lib` is the last irreversible block number as seen by the new block and
/// `current_block_num` the new block's number (recorded as the block where a
/// promoted proposal became pending).
pub fn evaluate_policy_promotion(
    active: Option<&Arc<FinalizerPolicy>>,
    pending: Option<&TrackedPolicy>,
    proposed: &[TrackedPolicy],
    lib: BlockNum,
    current_block_num: BlockNum,
) -> PolicyPromotion {
    let mut result = PolicyPromotion {
        active: active.cloned(),
        pending: pending.cloned(),
        proposed: Vec::new(),
        retired: None,
        activated: false,
    };

    if let Some(p) = pending {
        if p.block_num <= lib {
            result.retired = result.active.replace(p.policy.clone());
            result.pending = None;
            result.activated = true;
        }
    }

    // Greatest proposing block at or below LIB.
    let target = proposed
        .iter()
        .enumerate()
        .filter(|(_, p)| p.block_num <= lib)
        .max_by_key(|(_, p)| p.block_num)
        .map(|(i, _)| i);

    match target {
        Some(index) => {
            let chosen = &proposed[index];
            let keep_target = if result.pending.is_none() {
                result.pending =
                    Some(TrackedPolicy::new(current_block_num, chosen.policy.clone()));
                false
            } else {
                true
            };
            result.proposed = proposed
                .iter()
                .filter(|p| {
                    p.block_num > chosen.block_num || (keep_target && std::ptr::eq(*p, chosen))
                })
                .cloned()
                .collect();
        }
        None => result.proposed = proposed.to_vec(),
    }

    result
}
