//! Core types for the satswarm scheduler.
//!
//! This crate provides the foundational types used throughout the scheduler:
//!
//! - **Identifiers**: `JobId`, `WorkerRank`, `TreeIndex`
//! - **Placement data**: `JobRequest`, `JobSignature`
//! - **Job payloads**: `JobDescription`, `JobResult`
//! - **Tree bookkeeping**: index math and per-fragment peer pointers
//! - **Balancing data**: `EventMap`, `EpochCounter`
//! - **Fleet permutations**: seeded rank orderings for request bouncing
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod description;
mod epoch;
mod event_map;
mod identifiers;
mod permutation;
mod request;
mod result;
mod tree;

pub use description::{DescriptionError, JobDescription, JobRevision};
pub use epoch::EpochCounter;
pub use event_map::{EventMap, JobEvent};
pub use identifiers::{JobId, TreeIndex, WorkerRank};
pub use permutation::{bounce_alternatives, bounce_permutation, fleet_permutation};
pub use request::{JobRequest, JobSignature};
pub use result::{JobResult, ResultCode};
pub use tree::{left_child_index, parent_index, preferred_rank, right_child_index, JobTree};
