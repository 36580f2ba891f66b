//! Timer management for the runtime event loop.

use satswarm_core::{Event, TimerId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::Watchdog => Event::WatchdogTimer,
        TimerId::Compute => Event::ComputeTimer,
        TimerId::Balance => Event::BalanceTimer,
    }
}

/// Arms and cancels the worker's timers, delivering fires into the event
/// aggregator channel.
pub struct TimerManager {
    events: UnboundedSender<Event>,
    pending: HashMap<TimerId, JoinHandle<()>>,
}

impl TimerManager {
    pub fn new(events: UnboundedSender<Event>) -> Self {
        Self {
            events,
            pending: HashMap::new(),
        }
    }

    /// Arm a timer; an already-pending timer with the same id is replaced.
    pub fn set(&mut self, id: TimerId, duration: Duration) {
        self.cancel(id);
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = events.send(timer_event(id));
        });
        self.pending.insert(id, handle);
    }

    pub fn cancel(&mut self, id: TimerId) {
        if let Some(handle) = self.pending.remove(&id) {
            handle.abort();
        }
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
    }
}
