//! Snapshot files.
//!
//! A snapshot captures the fork database root (LIB) so a node can start
//! without replaying the block log from genesis. Files are named by block
//! number and written atomically.

use crate::safety_store::write_atomic;
use keel_bft::{ChainSnapshot, SnapshotError};
use keel_types::BlockNum;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SnapshotFileError {
    #[error("snapshot I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Format(#[from] SnapshotError),
}

/// Path of the snapshot for `block_num` inside `dir`.
pub fn snapshot_path(dir: &Path, block_num: BlockNum) -> PathBuf {
    dir.join(format!("snapshot-{block_num:010}.bin"))
}

/// Encode and write `snapshot` into `dir`. Returns the file path.
pub fn write_snapshot(dir: &Path, snapshot: &ChainSnapshot) -> Result<PathBuf, SnapshotFileError> {
    let path = snapshot_path(dir, snapshot.header.head_block_num);
    let bytes = snapshot.encode()?;
    let io_err = |source| SnapshotFileError::Io {
        path: path.clone(),
        source,
    };
    fs::create_dir_all(dir).map_err(io_err)?;
    write_atomic(&path, &bytes).map_err(io_err)?;
    info!(
        path = %path.display(),
        block_num = snapshot.header.head_block_num,
        bytes = bytes.len(),
        "Snapshot written"
    );
    Ok(path)
}

/// Read and verify a snapshot file.
pub fn load_snapshot(path: &Path) -> Result<ChainSnapshot, SnapshotFileError> {
    let bytes = fs::read(path).map_err(|source| SnapshotFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(ChainSnapshot::decode(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_bft::BlockState;
    use keel_types::test_utils::{test_genesis, test_key};
    use tempfile::TempDir;

    #[test]
    fn test_write_and_load() {
        let dir = TempDir::new().unwrap();
        let genesis = test_genesis(1, &[test_key(0)]);
        let root = BlockState::genesis(&genesis);
        let snapshot = ChainSnapshot::from_root(genesis.chain_id(), &root);

        let path = write_snapshot(dir.path(), &snapshot).unwrap();
        assert_eq!(path, snapshot_path(dir.path(), root.block_num()));
        assert_eq!(load_snapshot(&path).unwrap(), snapshot);
    }

    #[test]
    fn test_damaged_snapshot_rejected() {
        let dir = TempDir::new().unwrap();
        let genesis = test_genesis(1, &[test_key(0)]);
        let snapshot =
            ChainSnapshot::from_root(genesis.chain_id(), &BlockState::genesis(&genesis));
        let path = write_snapshot(dir.path(), &snapshot).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 5);
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            load_snapshot(&path),
            Err(SnapshotFileError::Format(SnapshotError::Corrupt(_)))
        ));
        assert!(matches!(
            load_snapshot(&dir.path().join("absent.bin")),
            Err(SnapshotFileError::Io { .. })
        ));
    }
}
