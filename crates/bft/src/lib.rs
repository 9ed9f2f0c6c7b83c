//! Instant-finality consensus state machine.
//!
//! This crate provides a synchronous finality engine that can be used for
//! both simulation and production.
//!
//! # Architecture
//!
//! The engine processes events synchronously:
//!
//! - `Event::BlockReceived` → Link, validate and insert the block, reselect
//!   head, vote with local finalizers
//! - `Event::VoteReceived` → Buffer or verify, then aggregate
//! - `Event::QuorumCertificateFormed` → Advance LIB on a strong QC
//!
//! All I/O is performed by the runner via returned `Action`s.
//!
//! # Terminology
//!
//! - **Block number**: Position in the chain. Genesis is block 1.
//!
//! - **Finality core**: Per-block record of QC links and block references
//!   from which the last final block and the next block's finality are
//!   derived.
//!
//! - **QC (Quorum Certificate)**: Aggregated finalizer signatures on a
//!   block's finality digest. Strong QCs contain only strong votes; weak QCs
//!   also count weak votes.
//!
//! - **LIB**: Last irreversible block, the root of the fork database.
//!
//! # Finality Protocol
//!
//! ## Safety
//!
//! - **Lock**: A finalizer votes strong only for blocks extending its lock,
//!   or when it has seen a QC newer than the lock.
//!
//! - **Weak votes**: A vote on a block that does not extend the finalizer's
//!   last vote is weak. Weak votes can form QCs for liveness but never make a
//!   block final.
//!
//! - **Commit rule**: A strong QC on block B, where B claims a strong QC on
//!   A, makes A final (two-chain).
//!
//! ## Liveness
//!
//! - **Fork choice**: The head is the tip claiming the highest QC block,
//!   then the longest, then the first to arrive.
//!
//! - **Production pause**: Producers stop when votes or LIB stall, so the
//!   reversible chain stays bounded.

mod aggregator;
mod block_state;
mod config;
mod finality_core;
mod fork_db;
mod pause;
mod policy;
mod safety;
mod schedule;
mod snapshot;
mod state;
mod sync;
mod vote_buffer;

pub use aggregator::{OpenQc, OpenQcSig, PendingQcState, QcUpdate, VoteAggregator};
pub use block_state::{BlockError, BlockState, BlockStateSnapshot, PendingProposerPolicy};
pub use config::BftConfig;
pub use finality_core::{CoreError, CoreMetadata, FinalityCore, QcLink};
pub use fork_db::{Branch, ForkDatabase, ForkDbError, RootAdvance};
pub use pause::{PauseController, PauseInputs, PauseTransition};
pub use policy::{ProtocolPhase, TrackedPolicy};
pub use safety::{
    decide_vote, decode_safety_file, encode_safety_file, MyFinalizers, NoVoteReason,
    SafetyFileError, VoteDecision,
};
pub use schedule::{next_scheduled_slot, round_len, scheduled_producer};
pub use snapshot::{ChainSnapshot, SnapshotError, SnapshotHeader, SNAPSHOT_MAGIC};
pub use state::{
    BftState, BftStats, ChainStatus, FinalityMetadata, ProductionRequest, RecoveredState,
};
pub use sync::{OrphanPool, SyncTracker};
pub use vote_buffer::VoteBuffer;
