//! State machine traits.

use crate::{Action, Event};
use std::time::Duration;

/// A deterministic, synchronous state machine.
///
/// Implementations mutate themselves in `handle` and perform no I/O; all
/// effects are returned as actions for the runner to execute.
pub trait StateMachine {
    /// Process one event.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Advance the state machine's notion of time.
    fn set_time(&mut self, now: Duration);

    /// Current time as last set by the runner.
    fn now(&self) -> Duration;
}

/// A component of a composed state machine.
///
/// Returns `None` for events it does not handle so the parent can route the
/// event elsewhere.
pub trait SubStateMachine {
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>>;

    fn set_time(&mut self, now: Duration);
}
