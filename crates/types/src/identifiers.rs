//! Block identifiers, timestamps and producer names.

use crate::Hash;
use sbor::prelude::BasicSbor;
use std::fmt;
use std::time::Duration;

/// Block number. Genesis is block 1.
pub type BlockNum = u32;

/// Block identifier.
///
/// The first four bytes hold the big-endian block number so that the number
/// can be recovered from the id alone; the remainder is taken from the hash
/// of the block header.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor)]
#[sbor(transparent)]
pub struct BlockId([u8; 32]);

impl BlockId {
    /// Placeholder id used as the parent of the genesis block.
    pub const NONE: BlockId = BlockId([0u8; 32]);

    /// Build an id from a block number and the header digest.
    pub fn new(block_num: BlockNum, header_digest: &Hash) -> Self {
        let mut bytes = *header_digest.as_bytes();
        bytes[..4].copy_from_slice(&block_num.to_be_bytes());
        BlockId(bytes)
    }

    pub const fn from_raw(bytes: [u8; 32]) -> Self {
        BlockId(bytes)
    }

    pub fn block_num(&self) -> BlockNum {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.block_num(), &self.to_hex()[8..20])
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Block timestamp measured in production slots since the unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor,
)]
#[sbor(transparent)]
pub struct BlockTimestamp(pub u32);

impl BlockTimestamp {
    /// Length of one production slot.
    pub const SLOT_MS: u64 = 500;

    /// Slot containing the given time since epoch (rounded down).
    pub fn from_duration(since_epoch: Duration) -> Self {
        BlockTimestamp((since_epoch.as_millis() as u64 / Self::SLOT_MS) as u32)
    }

    pub fn slot(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Self {
        BlockTimestamp(self.0 + 1)
    }

    /// Start of this slot as time since epoch.
    pub fn to_duration(&self) -> Duration {
        Duration::from_millis(self.0 as u64 * Self::SLOT_MS)
    }
}

impl fmt::Display for BlockTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// Account name of a block producer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor)]
#[sbor(transparent)]
pub struct ProducerName(pub String);

impl ProducerName {
    pub fn new(name: impl Into<String>) -> Self {
        ProducerName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProducerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a chain; derived from the genesis parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BasicSbor)]
#[sbor(transparent)]
pub struct ChainId(pub Hash);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
