//! Production runner with async I/O.
//!
//! This crate wraps the deterministic node state machine with real I/O:
//!
//! - Peer messages through a [`network::Transport`]
//! - Timers via tokio
//! - Vote signature verification on a dedicated rayon pool
//! - Blocks in RocksDB, finalizer safety records in an fsynced file
//! - Snapshots of the LIB for fast startup
//!
//! # Architecture
//!
//! A single task owns the state machine and receives events from
//! priority-ordered channels. This avoids mutex contention and keeps every
//! consensus decision on one thread.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Keel Node                                    │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │  ProductionRunner                                                   ││
//! │  │    └─ loop { event = recv(); actions = state.handle(event); }       ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                │                                        │
//! │           ┌────────────────────┼──────────────────────┐                 │
//! │           ▼                    ▼                      ▼                 │
//! │   Vote Pool (rayon)     Blocking I/O (tokio)     Transport              │
//! │   - BLS verification    - RocksDB writes         - Blocks, votes        │
//! │                         - Safety file            - Sync requests        │
//! │                         - Snapshots                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use keel_production::network::LocalNetwork;
//! use keel_production::{ProductionRunner, RocksDbStorage, ThreadPoolConfig, ThreadPoolManager};
//! use keel_node::NodeRole;
//! use keel_types::{BlockTimestamp, Genesis, KeyPair, ProducerName};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pools = Arc::new(ThreadPoolManager::new(ThreadPoolConfig::minimal())?);
//! let network = Arc::new(LocalNetwork::new(1024));
//! let genesis = Genesis {
//!     initial_timestamp: BlockTimestamp(0),
//!     initial_producers: vec![ProducerName::new("alice")],
//!     initial_finalizer_policy: None,
//! };
//!
//! let runner = ProductionRunner::builder()
//!     .role(NodeRole::producer(ProducerName::new("alice")))
//!     .genesis(genesis)
//!     .storage(Arc::new(RocksDbStorage::open("./data/db")?))
//!     .data_dir("./data")
//!     .thread_pools(pools)
//!     .network(network.clone(), network.register(0)?)
//!     .build()?;
//! runner.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod metrics;
pub mod network;
mod runner;
mod safety_store;
mod snapshot_store;
mod storage;
pub mod telemetry;
mod thread_pools;
mod timers;

pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryError, TelemetryGuard};
pub use timers::TimerManager;

pub use runner::{
    ControlRequest, ProductionRunner, ProductionRunnerBuilder, RunnerError, RunnerHandle,
    ShutdownHandle, MAX_SYNC_RESPONSE_BLOCKS,
};
pub use safety_store::{SafetyLoad, SafetyStore, SafetyStoreError, SAFETY_FILE_NAME};
pub use snapshot_store::{load_snapshot, snapshot_path, write_snapshot, SnapshotFileError};
pub use storage::{CompressionType, RocksDbConfig, RocksDbStorage, StorageError};
pub use thread_pools::{
    ThreadPoolConfig, ThreadPoolConfigBuilder, ThreadPoolError, ThreadPoolManager,
};
