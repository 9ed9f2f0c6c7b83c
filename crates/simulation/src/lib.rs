//! Deterministic simulation of a Keel network.
//!
//! All nodes run in one thread against a shared virtual clock. Messages,
//! timers and internal events go through a single time-ordered queue, and
//! network conditions (latency, jitter, loss, partitions) are drawn from a
//! seeded RNG, so the same seed reproduces the same run exactly.
//!
//! Nodes can be killed and relaunched; their [`SimStorage`] survives, which
//! models a crash with durable block and safety storage.

mod event_queue;
mod network;
mod runner;
mod storage;

pub use keel_core::NodeIndex;

pub use event_queue::EventKey;
pub use network::{Delivery, NetworkConfig, SimulatedNetwork};
pub use runner::{SimulationRunner, SimulationStats};
pub use storage::SimStorage;
