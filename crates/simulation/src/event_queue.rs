//! Ordering key for the simulation event queue.

use crate::NodeIndex;
use keel_core::{Event, EventPriority};
use std::time::Duration;

/// Position of a scheduled item in the global queue.
///
/// Items are ordered by time, then priority, then node, then insertion
/// sequence. The sequence makes every key unique, so ties never depend on
/// map internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub time: Duration,
    pub priority: EventPriority,
    pub node_index: NodeIndex,
    pub sequence: u64,
}

impl EventKey {
    pub fn new(time: Duration, event: &Event, node_index: NodeIndex, sequence: u64) -> Self {
        Self::with_priority(time, event.priority(), node_index, sequence)
    }

    pub fn with_priority(
        time: Duration,
        priority: EventPriority,
        node_index: NodeIndex,
        sequence: u64,
    ) -> Self {
        Self {
            time,
            priority,
            node_index,
            sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_ordering() {
        let t = Duration::from_millis(500);
        let mut queue = BTreeMap::new();
        queue.insert(EventKey::new(t, &Event::PauseProduction, 0, 1), "client");
        queue.insert(EventKey::new(t, &Event::ProductionTimer, 1, 2), "timer-1");
        queue.insert(EventKey::new(t, &Event::ProductionTimer, 0, 3), "timer-0");
        queue.insert(
            EventKey::new(t - Duration::from_millis(1), &Event::PauseProduction, 3, 4),
            "earlier",
        );

        let order: Vec<_> = queue.into_values().collect();
        assert_eq!(order, vec!["earlier", "timer-0", "timer-1", "client"]);
    }
}
