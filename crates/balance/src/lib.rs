//! Distributed volume balancing.
//!
//! A balancer maps the set of live jobs to integer *volumes* (tree sizes)
//! whose sum approximates `N · L` for load factor `L`. Only the root of a job
//! contributes its demand and priority; the result is published fleet-wide at
//! the end of each balancing epoch.
//!
//! Two implementations share the [`Balancer`] contract:
//!
//! - [`CutoffPriorityBalancer`]: periodic; four phases of asynchronous tree
//!   collectives with priority-class adjustment and probabilistic or
//!   bisection rounding.
//! - [`EventDrivenBalancer`]: no period; demand/priority changes flow through
//!   two overlaid binary trees, and every worker derives the same allocation
//!   from its converged event map.
//!
//! Both are sans-I/O state machines: every send is a returned action and
//! every receipt enters through `handle_message`. At most one balancing
//! activity is in flight per worker.

mod alloc;
mod balancer;
mod cutoff;
mod event_driven;
mod reduce;

pub use alloc::{adjust_assignments, PriorityHistogram};
pub use balancer::{BalanceInput, BalanceJob, BalanceOutcome, Balancer, RoundingMode};
pub use cutoff::CutoffPriorityBalancer;
pub use event_driven::EventDrivenBalancer;
pub use reduce::{AllReduce, Reduceable};
