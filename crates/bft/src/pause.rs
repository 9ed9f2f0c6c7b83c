//! Production pause controller.
//!
//! Four independent conditions suppress block production: operator pause,
//! `pause_at_block`, vote timeout and the reversible block cap. The operator
//! conditions are cleared by [`PauseController::resume`]; the automatic ones
//! are re-evaluated from [`PauseInputs`] on every head or LIB change and
//! every slot tick.
//!
//! The vote timeout fires when a block arrived after the latest vote and no
//! vote followed within the timeout. A chain where nothing is produced never
//! times out.

use keel_core::PauseReason;
use keel_types::BlockNum;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};

/// Blocks arriving this soon after a vote are treated as voted on; votes can
/// overtake the block they are for.
const BLOCK_ACCEPTANCE_TOLERANCE: Duration = Duration::from_millis(250);

/// Chain facts the automatic conditions depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseInputs {
    pub now: Duration,
    pub head: BlockNum,
    pub lib: BlockNum,
    /// Block the head's latest QC claim points at.
    pub head_claim: BlockNum,
    /// Highest block on the head branch with a locally available QC.
    pub best_qc_block: Option<BlockNum>,
    /// Finality is active and other finalizers are expected to vote.
    pub expects_votes: bool,
}

/// A change of the paused state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseTransition {
    Paused(PauseReason),
    Resumed,
}

#[derive(Debug)]
pub struct PauseController {
    vote_timeout: Duration,
    max_reversible_blocks: u32,
    operator_paused: bool,
    pause_at_block: Option<BlockNum>,
    last_vote_received: Duration,
    last_lib_advance: Duration,
    /// Earliest block received after the latest vote.
    first_block_after_vote: Option<Duration>,
    reasons: BTreeSet<PauseReason>,
}

impl PauseController {
    /// A zero `vote_timeout` or `max_reversible_blocks` disables that
    /// condition.
    pub fn new(vote_timeout: Duration, max_reversible_blocks: u32, now: Duration) -> Self {
        Self {
            vote_timeout,
            max_reversible_blocks,
            operator_paused: false,
            pause_at_block: None,
            last_vote_received: now,
            last_lib_advance: now,
            first_block_after_vote: None,
            reasons: BTreeSet::new(),
        }
    }

    pub fn pause(&mut self) {
        info!("Operator paused production");
        self.operator_paused = true;
    }

    /// Clear operator pause, `pause_at_block` and any pending vote timeout.
    pub fn resume(&mut self) {
        info!("Operator resumed production");
        self.operator_paused = false;
        self.pause_at_block = None;
        self.first_block_after_vote = None;
    }

    pub fn set_pause_at_block(&mut self, block_num: BlockNum) {
        info!(block_num, "Production will pause at block");
        self.pause_at_block = Some(block_num);
    }

    pub fn pause_at_block(&self) -> Option<BlockNum> {
        self.pause_at_block
    }

    pub fn record_vote_received(&mut self, now: Duration) {
        self.last_vote_received = self.last_vote_received.max(now);
    }

    pub fn record_lib_advance(&mut self, now: Duration) {
        self.last_lib_advance = self.last_lib_advance.max(now);
    }

    /// Note a new head, produced or received, at `now`.
    pub fn record_block_received(&mut self, now: Duration) {
        let progress = self.progress();
        if now.saturating_sub(BLOCK_ACCEPTANCE_TOLERANCE) <= progress {
            return;
        }
        if self.first_block_after_vote.is_some_and(|b| b > progress) {
            return;
        }
        self.first_block_after_vote = Some(now);
    }

    /// Latest evidence that finalizers are voting.
    fn progress(&self) -> Duration {
        self.last_vote_received.max(self.last_lib_advance)
    }

    pub fn last_vote_received(&self) -> Duration {
        self.last_vote_received
    }

    pub fn last_lib_advance(&self) -> Duration {
        self.last_lib_advance
    }

    /// Whether blocks numbered `block_num` may not be applied.
    pub fn blocks_application(&self, block_num: BlockNum) -> bool {
        self.pause_at_block.is_some_and(|n| block_num > n)
    }

    pub fn is_paused(&self) -> bool {
        !self.reasons.is_empty()
    }

    pub fn reasons(&self) -> impl Iterator<Item = &PauseReason> {
        self.reasons.iter()
    }

    /// Recompute the pause reasons; returns the transitions since the last
    /// evaluation.
    pub fn evaluate(&mut self, inputs: &PauseInputs) -> Vec<PauseTransition> {
        let mut next = BTreeSet::new();
        if self.operator_paused {
            next.insert(PauseReason::Operator);
        }
        if let Some(n) = self.pause_at_block {
            if inputs.head >= n {
                next.insert(PauseReason::AtBlock(n));
            }
        }
        if !self.vote_timeout.is_zero() && inputs.expects_votes {
            let unvoted = self
                .first_block_after_vote
                .filter(|b| *b > self.progress());
            if unvoted.is_some_and(|b| inputs.now.saturating_sub(b) > self.vote_timeout) {
                next.insert(PauseReason::VoteTimeout);
            }
        }
        if self.max_reversible_blocks > 0
            && inputs.head.saturating_sub(inputs.lib) > self.max_reversible_blocks
        {
            // A QC newer than the head's claim lets the next block advance
            // LIB, so production continues.
            let can_advance = inputs
                .best_qc_block
                .is_some_and(|qc| qc > inputs.head_claim);
            if !can_advance {
                next.insert(PauseReason::MaxReversibleBlocks);
            }
        }

        let mut transitions = Vec::new();
        for reason in next.difference(&self.reasons) {
            warn!(%reason, head = inputs.head, lib = inputs.lib, "Production paused");
            transitions.push(PauseTransition::Paused(*reason));
        }
        if !self.reasons.is_empty() && next.is_empty() {
            info!(head = inputs.head, lib = inputs.lib, "Production resumed");
            transitions.push(PauseTransition::Resumed);
        }
        self.reasons = next;
        transitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(now_secs: u64, head: BlockNum, lib: BlockNum) -> PauseInputs {
        PauseInputs {
            now: Duration::from_secs(now_secs),
            head,
            lib,
            head_claim: head.saturating_sub(1),
            best_qc_block: None,
            expects_votes: true,
        }
    }

    #[test]
    fn test_operator_pause_and_resume() {
        let mut pc = PauseController::new(Duration::ZERO, 0, Duration::ZERO);
        pc.pause();
        assert_eq!(
            pc.evaluate(&inputs(0, 10, 9)),
            vec![PauseTransition::Paused(PauseReason::Operator)]
        );
        assert!(pc.evaluate(&inputs(1, 10, 9)).is_empty());
        pc.resume();
        assert_eq!(pc.evaluate(&inputs(2, 10, 9)), vec![PauseTransition::Resumed]);
        assert!(!pc.is_paused());
    }

    #[test]
    fn test_pause_at_block() {
        let mut pc = PauseController::new(Duration::ZERO, 0, Duration::ZERO);
        pc.set_pause_at_block(20);
        assert!(pc.evaluate(&inputs(0, 19, 10)).is_empty());
        assert!(!pc.blocks_application(20));
        assert!(pc.blocks_application(21));
        assert_eq!(
            pc.evaluate(&inputs(0, 20, 10)),
            vec![PauseTransition::Paused(PauseReason::AtBlock(20))]
        );
        pc.resume();
        assert!(!pc.blocks_application(21));
        assert_eq!(pc.evaluate(&inputs(0, 20, 10)), vec![PauseTransition::Resumed]);
    }

    #[test]
    fn test_vote_timeout() {
        let mut pc = PauseController::new(Duration::from_secs(6), 0, Duration::ZERO);
        // Nothing produced, nothing to vote on.
        assert!(pc.evaluate(&inputs(100, 10, 9)).is_empty());

        pc.record_block_received(Duration::from_secs(101));
        assert!(pc.evaluate(&inputs(107, 10, 9)).is_empty());
        assert_eq!(
            pc.evaluate(&inputs(108, 10, 9)),
            vec![PauseTransition::Paused(PauseReason::VoteTimeout)]
        );
        pc.record_vote_received(Duration::from_secs(109));
        assert_eq!(pc.evaluate(&inputs(109, 10, 9)), vec![PauseTransition::Resumed]);

        pc.record_block_received(Duration::from_secs(110));
        let mut solo = inputs(200, 10, 9);
        solo.expects_votes = false;
        assert!(pc.evaluate(&solo).is_empty());
    }

    #[test]
    fn test_vote_timeout_tracks_earliest_unvoted_block() {
        let mut pc = PauseController::new(Duration::from_secs(6), 0, Duration::ZERO);
        pc.record_vote_received(Duration::from_secs(10));
        // Within tolerance of the vote.
        pc.record_block_received(Duration::from_millis(10_100));
        assert!(pc.evaluate(&inputs(20, 10, 9)).is_empty());

        pc.record_block_received(Duration::from_secs(11));
        pc.record_block_received(Duration::from_secs(15));
        assert_eq!(
            pc.evaluate(&inputs(18, 10, 9)),
            vec![PauseTransition::Paused(PauseReason::VoteTimeout)]
        );

        pc.resume();
        assert_eq!(pc.evaluate(&inputs(19, 10, 9)), vec![PauseTransition::Resumed]);
    }

    #[test]
    fn test_max_reversible_blocks() {
        let mut pc = PauseController::new(Duration::ZERO, 5, Duration::ZERO);
        assert!(pc.evaluate(&inputs(0, 15, 10)).is_empty());
        assert_eq!(
            pc.evaluate(&inputs(0, 16, 10)),
            vec![PauseTransition::Paused(PauseReason::MaxReversibleBlocks)]
        );

        // A fresh QC on the head lets the next block finalize more.
        let mut with_qc = inputs(0, 16, 10);
        with_qc.best_qc_block = Some(16);
        assert_eq!(pc.evaluate(&with_qc), vec![PauseTransition::Resumed]);
    }

    #[test]
    fn test_multiple_reasons_resume_once() {
        let mut pc = PauseController::new(Duration::ZERO, 5, Duration::ZERO);
        pc.pause();
        let t = pc.evaluate(&inputs(0, 20, 10));
        assert_eq!(t.len(), 2);
        assert_eq!(pc.reasons().count(), 2);
        pc.resume();
        assert!(pc.evaluate(&inputs(0, 20, 10)).is_empty());
        assert!(pc.is_paused());
        assert_eq!(pc.evaluate(&inputs(0, 20, 16)), vec![PauseTransition::Resumed]);
    }
}
