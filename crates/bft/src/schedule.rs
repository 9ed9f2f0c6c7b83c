//! Rotating producer schedule.
//!
//! Each producer of the active proposer policy owns
//! [`PRODUCER_REPETITIONS`] consecutive slots, in policy order:
//! `index = (slot mod (n * 12)) / 12`.

use keel_types::{BlockTimestamp, ProducerName, ProposerPolicy, PRODUCER_REPETITIONS};

/// Number of slots in one full rotation of `policy`.
pub fn round_len(policy: &ProposerPolicy) -> u32 {
    (policy.producers.len() as u32).max(1) * PRODUCER_REPETITIONS
}

/// First slot of the round containing `timestamp`.
pub fn round_start(policy: &ProposerPolicy, timestamp: BlockTimestamp) -> BlockTimestamp {
    let len = round_len(policy);
    BlockTimestamp(timestamp.slot() - timestamp.slot() % len)
}

/// Producer owning `timestamp`.
pub fn scheduled_producer(
    policy: &ProposerPolicy,
    timestamp: BlockTimestamp,
) -> Option<&ProducerName> {
    if policy.producers.is_empty() {
        return None;
    }
    let index = (timestamp.slot() % round_len(policy)) / PRODUCER_REPETITIONS;
    policy.producers.get(index as usize)
}

/// First slot strictly after `after` owned by `producer`.
pub fn next_scheduled_slot(
    policy: &ProposerPolicy,
    producer: &ProducerName,
    after: BlockTimestamp,
) -> Option<BlockTimestamp> {
    let index = policy.producers.iter().position(|p| p == producer)? as u32;
    let len = round_len(policy);
    let window_start = index * PRODUCER_REPETITIONS;
    let window_end = window_start + PRODUCER_REPETITIONS;

    let slot = after.slot().checked_add(1)?;
    let round = slot - slot % len;
    let offset = slot % len;

    let next = if offset < window_start {
        round + window_start
    } else if offset < window_end {
        slot
    } else {
        round + len + window_start
    };
    Some(BlockTimestamp(next))
}

/// Activation slot of a proposer policy proposed at `proposal_time` while
/// `active` is in force: the start of the second round after the proposal.
pub fn proposer_policy_activation(
    active: &ProposerPolicy,
    proposal_time: BlockTimestamp,
) -> BlockTimestamp {
    let start = round_start(active, proposal_time);
    BlockTimestamp(start.slot() + 2 * round_len(active))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::test_utils::test_producer;

    fn policy(n: u8) -> ProposerPolicy {
        ProposerPolicy::new(1, (0..n).map(test_producer).collect())
    }

    #[test]
    fn test_rotation_twelve_slots_each() {
        let p = policy(3);
        assert_eq!(scheduled_producer(&p, BlockTimestamp(0)), Some(&test_producer(0)));
        assert_eq!(scheduled_producer(&p, BlockTimestamp(11)), Some(&test_producer(0)));
        assert_eq!(scheduled_producer(&p, BlockTimestamp(12)), Some(&test_producer(1)));
        assert_eq!(scheduled_producer(&p, BlockTimestamp(35)), Some(&test_producer(2)));
        assert_eq!(scheduled_producer(&p, BlockTimestamp(36)), Some(&test_producer(0)));
    }

    #[test]
    fn test_next_scheduled_slot() {
        let p = policy(3);
        let b = test_producer(1);
        assert_eq!(next_scheduled_slot(&p, &b, BlockTimestamp(0)), Some(BlockTimestamp(12)));
        assert_eq!(next_scheduled_slot(&p, &b, BlockTimestamp(12)), Some(BlockTimestamp(13)));
        assert_eq!(next_scheduled_slot(&p, &b, BlockTimestamp(23)), Some(BlockTimestamp(48)));
        assert_eq!(next_scheduled_slot(&p, &test_producer(7), BlockTimestamp(0)), None);
    }

    #[test]
    fn test_single_producer_owns_every_slot() {
        let p = policy(1);
        let a = test_producer(0);
        assert_eq!(next_scheduled_slot(&p, &a, BlockTimestamp(11)), Some(BlockTimestamp(12)));
        assert_eq!(scheduled_producer(&p, BlockTimestamp(1_000_001)), Some(&a));
    }

    #[test]
    fn test_activation_two_rounds_out() {
        let p = policy(2);
        // round_len = 24; proposal at slot 30 is in round starting at 24.
        assert_eq!(round_start(&p, BlockTimestamp(30)), BlockTimestamp(24));
        assert_eq!(proposer_policy_activation(&p, BlockTimestamp(30)), BlockTimestamp(72));
    }
}
