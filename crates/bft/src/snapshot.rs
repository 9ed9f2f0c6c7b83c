//! Chain snapshots: the root block state with a versioned header.

use crate::block_state::{BlockState, BlockStateSnapshot};
use keel_types::{BlockNum, BlockTimestamp, ChainId};
use sbor::prelude::BasicSbor;
use thiserror::Error;

pub const SNAPSHOT_MAGIC: [u8; 8] = *b"KEELSNAP";
pub const SNAPSHOT_VERSION: u32 = 1;

const CHECKSUM_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("snapshot corrupt: {0}")]
    Corrupt(String),
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("snapshot is for chain {got}, node runs {expected}")]
    ChainMismatch { expected: ChainId, got: ChainId },
    #[error("failed to encode snapshot: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct SnapshotHeader {
    pub version: u32,
    pub chain_id: ChainId,
    pub head_block_num: BlockNum,
    pub head_block_time: BlockTimestamp,
}

/// A snapshot taken at the root (LIB) of the fork database.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ChainSnapshot {
    pub header: SnapshotHeader,
    pub root: BlockStateSnapshot,
}

impl ChainSnapshot {
    pub fn from_root(chain_id: ChainId, root: &BlockState) -> Self {
        Self {
            header: SnapshotHeader {
                version: SNAPSHOT_VERSION,
                chain_id,
                head_block_num: root.block_num(),
                head_block_time: root.timestamp(),
            },
            root: root.to_snapshot(),
        }
    }

    /// Rebuild the root block state, checking it belongs to `chain_id`.
    pub fn into_block_state(self, chain_id: ChainId) -> Result<BlockState, SnapshotError> {
        if self.header.chain_id != chain_id {
            return Err(SnapshotError::ChainMismatch {
                expected: chain_id,
                got: self.header.chain_id,
            });
        }
        let state = BlockState::from_snapshot(self.root);
        if state.block_num() != self.header.head_block_num
            || state.timestamp() != self.header.head_block_time
        {
            return Err(SnapshotError::Corrupt(
                "header does not match root block".into(),
            ));
        }
        Ok(state)
    }

    /// `magic ‖ sbor(snapshot) ‖ blake3(magic ‖ sbor)`.
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        let body = sbor::basic_encode(self).map_err(|e| SnapshotError::Encode(format!("{e:?}")))?;
        let mut out = Vec::with_capacity(SNAPSHOT_MAGIC.len() + body.len() + CHECKSUM_LEN);
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        out.extend_from_slice(&body);
        let checksum = blake3::hash(&out);
        out.extend_from_slice(checksum.as_bytes());
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        if bytes.len() < SNAPSHOT_MAGIC.len() + CHECKSUM_LEN {
            return Err(SnapshotError::Corrupt("truncated".into()));
        }
        let (content, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if blake3::hash(content).as_bytes() != checksum {
            return Err(SnapshotError::Corrupt("checksum mismatch".into()));
        }
        let (magic, body) = content.split_at(SNAPSHOT_MAGIC.len());
        if magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::Corrupt("bad magic".into()));
        }
        let snapshot: ChainSnapshot = sbor::basic_decode(body)
            .map_err(|e| SnapshotError::Corrupt(format!("undecodable body: {e:?}")))?;
        if snapshot.header.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.header.version));
        }
        Ok(snapshot)
    }
}
