//! Deterministic fleet simulation.
//!
//! Runs a whole fleet of [`satswarm_worker::WorkerState`] machines in one
//! process with simulated time, a seeded lossy network, and scripted
//! solvers. Given the same seed and scripts, a simulation produces identical
//! results every run.

mod event_queue;
mod network;
mod runner;
mod solver_pool;

pub use event_queue::EventKey;
pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{NodeIndex, SimulationConfig, SimulationRunner, SimulationStats};
pub use solver_pool::{SolverPool, SolverScript, SolverSimState};
