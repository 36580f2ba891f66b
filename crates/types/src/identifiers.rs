//! Identifier newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Globally unique job identifier, assigned at submission.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Rank of a worker process within the fleet (0..fleet_size).
pub type WorkerRank = u32;

/// Position of a fragment in a job's conceptual binary tree.
///
/// Root is index 0; the left child of index `i` is `2i + 1`, the right child
/// is `2i + 2`.
pub type TreeIndex = u32;
