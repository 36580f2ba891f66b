//! Production runtime with async I/O.
//!
//! Wraps the deterministic worker state machine with real I/O:
//!
//! - Network messages over an all-to-all TCP mesh (typed envelopes,
//!   length-prefixed frames, per-peer FIFO, deferred delivery until a
//!   connection exists)
//! - Timers via tokio sleeps
//! - Solver portfolios on dedicated OS threads
//!
//! # Architecture
//!
//! Uses the event aggregator pattern: a single task owns the state machine
//! and receives events via an mpsc channel. This avoids mutex contention.
//!
//! ```text
//! transport ─┐
//! timers    ─┼─► mpsc<Event> ─► WorkerState::handle() ─► Actions ─► I/O
//! solvers   ─┘
//! ```
//!
//! A transport monitor watches for any single network operation stuck longer
//! than 60 seconds and terminates the process non-zero, mirroring the
//! fleet's fail-fast policy.

mod codec;
mod monitor;
mod runner;
mod solver_host;
mod timers;
mod transport;

pub use codec::{decode_frame, encode_frame, CodecError, WIRE_VERSION};
pub use monitor::TransportMonitor;
pub use runner::{RuntimeConfig, RuntimeError, RuntimeRunner};
pub use solver_host::{SolverFactory, SolverHost};
pub use timers::TimerManager;
pub use transport::{MeshTransport, PeerConfig, TransportError};
