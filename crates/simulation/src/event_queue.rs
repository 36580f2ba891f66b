//! Deterministic global event ordering.

use satswarm_core::{Event, EventPriority};
use std::time::Duration;

/// Node index within a simulation.
pub type NodeIndex = u32;

/// Ordering key for the global event queue: time first, then event priority
/// (internal before timers before network before client), then node, then an
/// insertion sequence number as the final tiebreak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventKey {
    pub time: Duration,
    pub priority: EventPriority,
    pub node: NodeIndex,
    pub seq: u64,
}

impl EventKey {
    pub fn new(time: Duration, event: &Event, node: NodeIndex, seq: u64) -> Self {
        Self {
            time,
            priority: event.priority(),
            node,
            seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_by_time_then_priority() {
        let t1 = Duration::from_millis(1);
        let t2 = Duration::from_millis(2);
        let internal = EventKey::new(t2, &Event::SolverStarted { job_id: satswarm_types::JobId(1) }, 0, 5);
        let timer = EventKey::new(t2, &Event::ComputeTimer, 0, 1);
        let earlier = EventKey::new(t1, &Event::ComputeTimer, 9, 9);

        let mut keys = [timer, internal, earlier];
        keys.sort();
        assert_eq!(keys[0], earlier);
        assert_eq!(keys[1], internal);
        assert_eq!(keys[2], timer);
    }
}
