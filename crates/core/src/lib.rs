//! Core contract for the satswarm scheduler.
//!
//! This crate provides the event-driven skeleton every worker runs on:
//!
//! - [`Event`]: All possible inputs to the state machine
//! - [`Action`]: All possible outputs from the state machine
//! - [`EventPriority`]: Ordering priority for events at the same timestamp
//! - [`StateMachine`]: The trait the worker state machine implements
//!
//! # Architecture
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: No async, no .await
//! - **Deterministic**: Same state + event = same actions
//! - **Pure-ish**: Mutates self, but performs no I/O
//!
//! All I/O is handled by the runner (simulation or production) which:
//! 1. Delivers events to the state machine
//! 2. Executes the returned actions
//! 3. Converts action results back into events
//!
//! The control thread never blocks on a peer: all waits surface as events,
//! and the only suspension point is between `handle()` calls.

mod action;
mod event;
mod traits;

pub use action::Action;
pub use event::{Event, EventPriority};
pub use traits::StateMachine;

/// Timers a worker re-arms for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Memory/stats watchdog (~1 s).
    Watchdog,
    /// Compute tick: limit checks, clause-exchange cadence (~50 ms).
    Compute,
    /// Periodic balancing trigger (period p).
    Balance,
}
