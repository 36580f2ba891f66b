//! The per-worker scheduler state machine.
//!
//! [`WorkerState`] composes the whole scheduling surface of one fleet member:
//! the known-jobs registry, the placement protocol, volume application, the
//! balancer drive, result and termination cascades, the clause-exchange
//! overlay, and the memory/limit watchdogs. It implements
//! [`satswarm_core::StateMachine`]: events in, actions out, no I/O.

mod config;
mod placement;
mod result;
mod sharing;
mod state;
mod volume;

pub use config::{BalancerMode, WorkerConfig};
pub use state::WorkerState;
