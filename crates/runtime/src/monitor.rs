//! Stuck-transport watchdog.
//!
//! Network sends and connects register themselves here; a monitor task
//! checks once a second whether any single operation has been open longer
//! than the fatal threshold and, if so, terminates the process non-zero.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, trace};

const FATAL_STUCK_TIME: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct CurrentCall {
    name: &'static str,
    since: Instant,
}

/// Tracks the transport's currently outstanding blocking operation.
#[derive(Debug, Default)]
pub struct TransportMonitor {
    current: Mutex<Option<CurrentCall>>,
}

impl TransportMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark an operation as started. Guards drop to mark completion.
    pub fn enter(self: &Arc<Self>, name: &'static str) -> MonitorGuard {
        *self.current.lock() = Some(CurrentCall {
            name,
            since: Instant::now(),
        });
        MonitorGuard {
            monitor: self.clone(),
        }
    }

    /// Spawn the watcher task. Exits the process if a call is stuck.
    pub fn spawn_watcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let stuck = {
                    let current = monitor.current.lock();
                    match current.as_ref() {
                        None => {
                            trace!("monitor: not inside a transport call");
                            None
                        }
                        Some(call) => {
                            let elapsed = call.since.elapsed();
                            trace!(op = call.name, ?elapsed, "monitor: inside transport call");
                            (elapsed > FATAL_STUCK_TIME).then_some((call.name, elapsed))
                        }
                    }
                };
                if let Some((name, elapsed)) = stuck {
                    error!(op = name, ?elapsed, "transport call stuck too long - aborting");
                    std::process::exit(1);
                }
            }
        })
    }
}

/// Clears the monitor's current call on drop.
pub struct MonitorGuard {
    monitor: Arc<TransportMonitor>,
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        *self.monitor.current.lock() = None;
    }
}
