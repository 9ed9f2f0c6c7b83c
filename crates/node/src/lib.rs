//! Node state machine.
//!
//! [`NodeStateMachine`] composes the finality engine with the block
//! production scheduler and the production pause controller. Producers and
//! finalizers are independent roles described by [`NodeRole`].

mod state;

pub use state::{NodeRole, NodeStateMachine};
