//! Digests signed by finalizer votes.
//!
//! A strong vote signs the block's finality digest. A weak vote signs the
//! weak digest derived from it, so strong and weak signatures over the same
//! block can never be confused.

use crate::{BlockId, Hash};

/// Domain tag for finality digests.
pub const DOMAIN_FINALITY: &[u8] = b"keel/finality/v1";

/// Suffix appended to the finality digest for weak votes.
pub const WEAK_SUFFIX: &[u8] = b"WEAK";

/// Finality digest of a block.
///
/// Commits to the block id and to the finalizer policies that vote on it, so
/// a vote cannot be replayed under a different policy.
pub fn finality_digest(
    block_id: &BlockId,
    active_policy_digest: &Hash,
    pending_policy_digest: Option<&Hash>,
) -> Hash {
    let pending = pending_policy_digest.copied().unwrap_or(Hash::ZERO);
    Hash::from_parts(&[
        DOMAIN_FINALITY,
        block_id.as_bytes(),
        active_policy_digest.as_bytes(),
        pending.as_bytes(),
    ])
}

/// Digest signed by a weak vote.
pub fn weak_digest(finality_digest: &Hash) -> Hash {
    Hash::from_parts(&[finality_digest.as_bytes(), WEAK_SUFFIX])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weak_digest_differs() {
        let id = BlockId::new(5, &Hash::from_bytes(b"b5"));
        let d = finality_digest(&id, &Hash::from_bytes(b"policy"), None);
        assert_ne!(weak_digest(&d), d);
    }

    #[test]
    fn test_pending_policy_changes_digest() {
        let id = BlockId::new(5, &Hash::from_bytes(b"b5"));
        let active = Hash::from_bytes(b"active");
        let pending = Hash::from_bytes(b"pending");
        assert_ne!(
            finality_digest(&id, &active, None),
            finality_digest(&id, &active, Some(&pending))
        );
    }
}
