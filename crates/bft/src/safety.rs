//! Finalizer safety: the voting rule, local finalizer bookkeeping and the
//! safety file codec.

use crate::block_state::BlockState;
use keel_types::{
    BlockRef, BlockTimestamp, FinalizerSafetyInfo, KeyPair, PublicKey, Vote, VoteKind,
};
use sbor::prelude::BasicSbor;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, error, warn};

// ═══════════════════════════════════════════════════════════════════════════
// Voting rule
// ═══════════════════════════════════════════════════════════════════════════

/// Why a finalizer declined to vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoVoteReason {
    /// Block is not newer than the last vote.
    Monotony,
    /// Block neither extends the lock nor carries a newer QC.
    LockedElsewhere,
}

/// Outcome of [`decide_vote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteDecision {
    NoVote(NoVoteReason),
    Strong,
    Weak,
}

impl VoteDecision {
    pub fn kind(self) -> Option<VoteKind> {
        match self {
            VoteDecision::Strong => Some(VoteKind::Strong),
            VoteDecision::Weak => Some(VoteKind::Weak),
            VoteDecision::NoVote(_) => None,
        }
    }
}

/// Decide whether and how a finalizer with safety record `fsi` votes on
/// `block`.
pub fn decide_vote(fsi: &FinalizerSafetyInfo, block: &BlockState) -> VoteDecision {
    let core = block.core();
    let latest_qc_timestamp = core.latest_qc_block_timestamp();

    let monotony = block.timestamp() > fsi.last_vote.timestamp;
    if !monotony {
        return VoteDecision::NoVote(NoVoteReason::Monotony);
    }
    let liveness = latest_qc_timestamp > fsi.lock.timestamp;
    let safety = fsi.lock.is_empty() || core.extends(&fsi.lock.block_id);
    if !liveness && !safety {
        return VoteDecision::NoVote(NoVoteReason::LockedElsewhere);
    }

    // An empty last vote has timestamp zero, so its range is always disjoint.
    let disjoint = fsi.last_vote.timestamp <= latest_qc_timestamp;
    let same_branch = core.extends(&fsi.last_vote.block_id)
        && fsi.other_branch_latest_time <= latest_qc_timestamp;
    if disjoint || same_branch {
        VoteDecision::Strong
    } else {
        VoteDecision::Weak
    }
}

/// Safety record after voting `kind` on `block`.
///
/// A weak vote that leaves the branch of the last vote records when that
/// branch was last voted on. Votes on the new branch stay weak until one of
/// its blocks claims a QC at or after that time.
pub fn record_vote(
    fsi: &FinalizerSafetyInfo,
    block: &BlockState,
    kind: VoteKind,
) -> FinalizerSafetyInfo {
    let mut next = *fsi;
    next.last_vote = block.block_ref();
    next.highest_qc_seen = block.core().latest_qc_block_timestamp();
    match kind {
        VoteKind::Strong => {
            next.other_branch_latest_time = BlockTimestamp(0);
            if let Some(claimed) = block.ancestor_ref(block.latest_qc_claim().block_num) {
                if claimed.timestamp > next.lock.timestamp {
                    next.lock = claimed;
                }
            }
        }
        VoteKind::Weak => {
            if !fsi.last_vote.is_empty() && !block.core().extends(&fsi.last_vote.block_id) {
                next.other_branch_latest_time = fsi.last_vote.timestamp;
            }
        }
    }
    next
}

// ═══════════════════════════════════════════════════════════════════════════
// Local finalizers
// ═══════════════════════════════════════════════════════════════════════════

/// Finalizer keys held by this node together with their safety records.
///
/// Records for keys outside the current policies are kept so they survive a
/// rewrite of the safety file.
#[derive(Debug)]
pub struct MyFinalizers {
    keys: BTreeMap<PublicKey, KeyPair>,
    safety: BTreeMap<PublicKey, FinalizerSafetyInfo>,
    halted: Option<String>,
}

impl MyFinalizers {
    pub fn new(keys: Vec<KeyPair>, safety: BTreeMap<PublicKey, FinalizerSafetyInfo>) -> Self {
        Self {
            keys: keys.into_iter().map(|k| (k.public_key(), k)).collect(),
            safety,
            halted: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Stop all voting until restart.
    pub fn halt(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(reason = %reason, "Finalizer voting halted");
        self.halted = Some(reason);
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.keys.contains_key(key)
    }

    pub fn public_keys(&self) -> impl Iterator<Item = &PublicKey> {
        self.keys.keys()
    }

    pub fn safety_info(&self, key: &PublicKey) -> Option<&FinalizerSafetyInfo> {
        self.safety.get(key)
    }

    /// All safety records, including those of keys not held locally.
    pub fn records(&self) -> &BTreeMap<PublicKey, FinalizerSafetyInfo> {
        &self.safety
    }

    /// Vote on `block` with every local key in its voting policies.
    ///
    /// Unset records are anchored at `lib` first. Returns the votes cast; the
    /// caller must persist [`records`](Self::records) before releasing them.
    pub fn vote(&mut self, block: &BlockState, lib: BlockRef) -> Vec<Vote> {
        if self.is_halted() {
            return Vec::new();
        }
        let Some((active, pending)) = block.voting_policies() else {
            return Vec::new();
        };

        let mut voters: Vec<PublicKey> = active
            .finalizers
            .iter()
            .chain(pending.into_iter().flat_map(|p| p.finalizers.iter()))
            .map(|f| f.public_key)
            .filter(|k| self.keys.contains_key(k))
            .collect();
        voters.sort();
        voters.dedup();

        let mut votes = Vec::with_capacity(voters.len());
        for key in voters {
            let fsi = match self.safety.get(&key) {
                Some(fsi) if !fsi.is_unset() => *fsi,
                _ => FinalizerSafetyInfo::anchored_at(lib),
            };
            let decision = decide_vote(&fsi, block);
            let Some(kind) = decision.kind() else {
                debug!(
                    block_num = block.block_num(),
                    finalizer = %key,
                    ?decision,
                    "Not voting"
                );
                continue;
            };
            let Some(pair) = self.keys.get(&key) else {
                continue;
            };
            self.safety.insert(key, record_vote(&fsi, block, kind));
            votes.push(Vote::sign(pair, block.id(), block.strong_digest(), kind));
        }
        votes
    }

    /// Check an incoming vote signed with one of our keys.
    ///
    /// A vote we did not cast, on a block at or above our last vote, means
    /// another process holds the key. Voting halts. Returns true when the
    /// vote is an equivocation.
    pub fn check_equivocation(&mut self, vote: &Vote, block_timestamp: BlockTimestamp) -> bool {
        if !self.keys.contains_key(&vote.finalizer_key) {
            return false;
        }
        let Some(fsi) = self.safety.get(&vote.finalizer_key) else {
            return false;
        };
        if fsi.last_vote.is_empty() || fsi.last_vote.block_id == vote.block_id {
            return false;
        }
        if block_timestamp < fsi.last_vote.timestamp {
            return false;
        }
        warn!(
            finalizer = %vote.finalizer_key,
            block_num = vote.block_num(),
            last_vote = fsi.last_vote.block_num(),
            "Vote signed with a local key that this node did not cast"
        );
        self.halt(format!(
            "equivocation detected for finalizer {}",
            vote.finalizer_key
        ));
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Safety file codec
// ═══════════════════════════════════════════════════════════════════════════

pub const SAFETY_FILE_MAGIC: u64 = 0x5AFE_1111_5AFE_1112;
pub const SAFETY_FILE_VERSION: u32 = 1;

const HEADER_LEN: usize = 8 + 4 + 4 + 4;
const CHECKSUM_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyFileError {
    #[error("safety file corrupt: {0}")]
    Corrupt(String),
    #[error("failed to encode safety file: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
struct SafetyEntry {
    public_key: PublicKey,
    info: FinalizerSafetyInfo,
}

/// Encode safety records.
///
/// Layout: magic (u64 LE), version (u32 LE), entry count (u32 LE), body
/// length (u32 LE), SBOR body, blake3 of everything before it.
pub fn encode_safety_file(
    records: &BTreeMap<PublicKey, FinalizerSafetyInfo>,
) -> Result<Vec<u8>, SafetyFileError> {
    let entries: Vec<SafetyEntry> = records
        .iter()
        .map(|(k, v)| SafetyEntry {
            public_key: *k,
            info: *v,
        })
        .collect();
    let body =
        sbor::basic_encode(&entries).map_err(|e| SafetyFileError::Encode(format!("{e:?}")))?;

    let mut out = Vec::with_capacity(HEADER_LEN + body.len() + CHECKSUM_LEN);
    out.extend_from_slice(&SAFETY_FILE_MAGIC.to_le_bytes());
    out.extend_from_slice(&SAFETY_FILE_VERSION.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    let checksum = blake3::hash(&out);
    out.extend_from_slice(checksum.as_bytes());
    Ok(out)
}

/// Decode a safety file written by [`encode_safety_file`].
pub fn decode_safety_file(
    bytes: &[u8],
) -> Result<BTreeMap<PublicKey, FinalizerSafetyInfo>, SafetyFileError> {
    let corrupt = |msg: &str| SafetyFileError::Corrupt(msg.to_string());
    if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(corrupt("truncated header"));
    }
    let (content, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    if blake3::hash(content).as_bytes() != checksum {
        return Err(corrupt("checksum mismatch"));
    }

    let u32_at = |offset: usize| -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&content[offset..offset + 4]);
        u32::from_le_bytes(buf)
    };
    let mut magic = [0u8; 8];
    magic.copy_from_slice(&content[..8]);
    if u64::from_le_bytes(magic) != SAFETY_FILE_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = u32_at(8);
    if version != SAFETY_FILE_VERSION {
        return Err(SafetyFileError::Corrupt(format!(
            "unsupported version {version}"
        )));
    }
    let count = u32_at(12) as usize;
    let body_len = u32_at(16) as usize;
    let body = &content[HEADER_LEN..];
    if body.len() != body_len {
        return Err(corrupt("body length mismatch"));
    }

    let entries: Vec<SafetyEntry> = sbor::basic_decode(body)
        .map_err(|e| SafetyFileError::Corrupt(format!("undecodable body: {e:?}")))?;
    if entries.len() != count {
        return Err(corrupt("entry count mismatch"));
    }
    Ok(entries.into_iter().map(|e| (e.public_key, e.info)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_state::test_chain::{child_block, extend, extend_with_qc};
    use keel_types::test_utils::{test_genesis, test_key};

    fn keys() -> Vec<KeyPair> {
        (0..4).map(test_key).collect()
    }

    #[test]
    fn test_first_vote_is_strong_and_locks() {
        let keys = keys();
        let genesis = BlockState::genesis(&test_genesis(1, &keys));
        let b2 = extend_with_qc(&genesis, &keys);
        let fsi = FinalizerSafetyInfo::anchored_at(genesis.block_ref());

        assert_eq!(decide_vote(&fsi, &b2), VoteDecision::Strong);
        let next = record_vote(&fsi, &b2, VoteKind::Strong);
        assert_eq!(next.last_vote, b2.block_ref());
        assert_eq!(next.lock.block_id, genesis.id());
    }

    #[test]
    fn test_monotony() {
        let keys = keys();
        let genesis = BlockState::genesis(&test_genesis(1, &keys));
        let b2 = extend_with_qc(&genesis, &keys);
        let fsi = record_vote(
            &FinalizerSafetyInfo::anchored_at(genesis.block_ref()),
            &b2,
            VoteKind::Strong,
        );
        assert_eq!(
            decide_vote(&fsi, &b2),
            VoteDecision::NoVote(NoVoteReason::Monotony)
        );
    }

    #[test]
    fn test_fork_without_newer_qc_is_weak_or_refused() {
        let keys = keys();
        let genesis = BlockState::genesis(&test_genesis(1, &keys));
        let b2 = extend_with_qc(&genesis, &keys);
        let b3 = extend_with_qc(&b2, &keys);
        // Vote on b3: lock moves to b2.
        let fsi = record_vote(
            &FinalizerSafetyInfo::anchored_at(genesis.block_ref()),
            &b3,
            VoteKind::Strong,
        );
        assert_eq!(fsi.lock.block_id, b2.id());

        // A sibling of b3 on b2 claiming only b1: extends the lock, but its
        // range overlaps the last vote, so the vote is weak.
        let sibling = crate::block_state::test_chain::child_block_at(
            &b2,
            BlockTimestamp(b3.timestamp().slot() + 1),
            b2.latest_qc_claim(),
            None,
            None,
        );
        let sibling = b2.next(sibling, 2).unwrap();
        assert_eq!(decide_vote(&fsi, &sibling), VoteDecision::Weak);

        // A fork from genesis that does not extend the lock and claims
        // nothing newer is refused.
        let fork = child_block(&genesis, genesis.latest_qc_claim(), None, None);
        let mut fork = genesis.next(fork, 2).unwrap();
        while fork.timestamp() <= b3.timestamp() {
            fork = extend(&fork);
        }
        assert_eq!(
            decide_vote(&fsi, &fork),
            VoteDecision::NoVote(NoVoteReason::LockedElsewhere)
        );
    }

    #[test]
    fn test_branch_switch_stays_weak_until_newer_qc() {
        let keys = keys();
        let genesis = BlockState::genesis(&test_genesis(1, &keys));
        let b2 = extend_with_qc(&genesis, &keys);
        let a3 = extend(&b2);
        let bb3 = crate::block_state::test_chain::child_block_at(
            &b2,
            BlockTimestamp(a3.timestamp().slot() + 1),
            b2.latest_qc_claim(),
            None,
            None,
        );
        let bb3 = b2.next(bb3, 2).unwrap();
        let bb4 = extend(&bb3);

        let fsi = FinalizerSafetyInfo::anchored_at(genesis.block_ref());
        assert_eq!(decide_vote(&fsi, &a3), VoteDecision::Strong);
        let fsi = record_vote(&fsi, &a3, VoteKind::Strong);
        assert_eq!(fsi.other_branch_latest_time, BlockTimestamp(0));

        // Switching branches without a newer QC is weak and remembers a3.
        assert_eq!(decide_vote(&fsi, &bb3), VoteDecision::Weak);
        let fsi = record_vote(&fsi, &bb3, VoteKind::Weak);
        assert_eq!(fsi.other_branch_latest_time, a3.timestamp());

        // bb4 extends the last vote, but its QC range still overlaps a3.
        assert!(bb4.core().latest_qc_block_timestamp() < a3.timestamp());
        assert_eq!(decide_vote(&fsi, &bb4), VoteDecision::Weak);
        let fsi = record_vote(&fsi, &bb4, VoteKind::Weak);
        assert_eq!(fsi.other_branch_latest_time, a3.timestamp());

        // A QC on bb4 clears the overlap and the strong vote resets the marker.
        let bb5 = extend_with_qc(&bb4, &keys);
        assert_eq!(decide_vote(&fsi, &bb5), VoteDecision::Strong);
        let fsi = record_vote(&fsi, &bb5, VoteKind::Strong);
        assert_eq!(fsi.other_branch_latest_time, BlockTimestamp(0));
        assert_eq!(fsi.lock.block_id, bb4.id());
    }

    #[test]
    fn test_my_finalizers_votes_and_persists_records() {
        let keys = keys();
        let genesis = BlockState::genesis(&test_genesis(1, &keys));
        let b2 = extend_with_qc(&genesis, &keys);
        let mut mine = MyFinalizers::new(keys[..2].to_vec(), BTreeMap::new());

        let votes = mine.vote(&b2, genesis.block_ref());
        assert_eq!(votes.len(), 2);
        assert!(votes.iter().all(|v| v.verify(b2.strong_digest())));
        assert_eq!(mine.records().len(), 2);

        // Second attempt on the same block is refused by monotony.
        assert!(mine.vote(&b2, genesis.block_ref()).is_empty());
    }

    #[test]
    fn test_equivocation_halts() {
        let keys = keys();
        let genesis = BlockState::genesis(&test_genesis(1, &keys));
        let b2 = extend_with_qc(&genesis, &keys);
        let b3 = extend(&b2);
        let mut mine = MyFinalizers::new(vec![keys[0].clone()], BTreeMap::new());
        mine.vote(&b2, genesis.block_ref());

        let echo = Vote::sign(&keys[0], b2.id(), b2.strong_digest(), VoteKind::Strong);
        assert!(!mine.check_equivocation(&echo, b2.timestamp()));

        let foreign = Vote::sign(&keys[0], b3.id(), b3.strong_digest(), VoteKind::Strong);
        assert!(mine.check_equivocation(&foreign, b3.timestamp()));
        assert!(mine.is_halted());
        assert!(mine.vote(&extend(&b3), genesis.block_ref()).is_empty());
    }

    #[test]
    fn test_safety_file_roundtrip_keeps_foreign_entries() {
        let keys = keys();
        let genesis = BlockState::genesis(&test_genesis(1, &keys));
        let mut records = BTreeMap::new();
        records.insert(
            keys[0].public_key(),
            FinalizerSafetyInfo::anchored_at(genesis.block_ref()),
        );
        records.insert(test_key(42).public_key(), FinalizerSafetyInfo::UNSET);

        let bytes = encode_safety_file(&records).unwrap();
        assert_eq!(&bytes[..8], &SAFETY_FILE_MAGIC.to_le_bytes());
        assert_eq!(decode_safety_file(&bytes).unwrap(), records);
    }

    #[test]
    fn test_safety_file_corruption_detected() {
        let records = BTreeMap::new();
        let mut bytes = encode_safety_file(&records).unwrap();

        assert!(matches!(
            decode_safety_file(&bytes[..bytes.len() - 1]),
            Err(SafetyFileError::Corrupt(_))
        ));
        bytes[9] ^= 0xFF;
        assert!(matches!(
            decode_safety_file(&bytes),
            Err(SafetyFileError::Corrupt(_))
        ));
        assert!(matches!(
            decode_safety_file(&[0u8; 10]),
            Err(SafetyFileError::Corrupt(_))
        ));
    }
}
