//! On-disk finalizer safety file.
//!
//! **BFT Safety Critical**: the safety file is what stops a restarted
//! finalizer from voting against its own lock. Writes go to a temp file
//! which is fsynced, renamed over the live file, and followed by an fsync of
//! the directory, so a crash leaves either the old or the new records.

use crate::metrics;
use keel_bft::{decode_safety_file, encode_safety_file, SafetyFileError};
use keel_types::{FinalizerSafetyInfo, PublicKey};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const SAFETY_FILE_NAME: &str = "safety.dat";

#[derive(Debug, Error)]
pub enum SafetyStoreError {
    #[error("safety file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Format(#[from] SafetyFileError),
}

/// Result of reading the safety file at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyLoad {
    /// No file yet: finalizers start unlocked.
    Missing,
    Loaded(BTreeMap<PublicKey, FinalizerSafetyInfo>),
    /// Unreadable file. Voting must not start from this state.
    Corrupt(String),
}

impl SafetyLoad {
    /// Split into the records and corruption reason the engine expects.
    pub fn into_parts(self) -> (BTreeMap<PublicKey, FinalizerSafetyInfo>, Option<String>) {
        match self {
            SafetyLoad::Missing => (BTreeMap::new(), None),
            SafetyLoad::Loaded(records) => (records, None),
            SafetyLoad::Corrupt(reason) => (BTreeMap::new(), Some(reason)),
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, SafetyLoad::Corrupt(_))
    }
}

/// Write `bytes` to `path` through a synced temp file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    if let Some(dir) = path.parent() {
        // Directory fsync makes the rename itself durable.
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

/// Safety file in a node's data directory.
#[derive(Debug, Clone)]
pub struct SafetyStore {
    path: PathBuf,
}

impl SafetyStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(SAFETY_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the safety file.
    ///
    /// I/O failures other than a missing file are reported as corruption:
    /// the node must not vote without knowing its lock.
    pub fn load(&self) -> SafetyLoad {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No safety file, finalizers start unlocked");
                return SafetyLoad::Missing;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Safety file unreadable");
                return SafetyLoad::Corrupt(e.to_string());
            }
        };
        match decode_safety_file(&bytes) {
            Ok(records) => {
                info!(
                    path = %self.path.display(),
                    records = records.len(),
                    "Loaded safety file"
                );
                SafetyLoad::Loaded(records)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Safety file corrupt");
                SafetyLoad::Corrupt(e.to_string())
            }
        }
    }

    /// Durably replace the safety file with `records`.
    pub fn store(
        &self,
        records: &BTreeMap<PublicKey, FinalizerSafetyInfo>,
    ) -> Result<(), SafetyStoreError> {
        let start = Instant::now();
        let bytes = encode_safety_file(records)?;
        write_atomic(&self.path, &bytes).map_err(|source| {
            metrics::record_safety_write_failure();
            SafetyStoreError::Io {
                path: self.path.clone(),
                source,
            }
        })?;
        metrics::record_safety_write(start.elapsed().as_secs_f64());
        debug!(records = records.len(), "Safety file written");
        Ok(())
    }
}
