//! Intra-job tree messages for the clause-exchange overlay.

use satswarm_types::JobId;
use serde::{Deserialize, Serialize};

/// Direction of a clause-exchange message inside the job tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobMessageTag {
    /// Clause buffers flowing leaf → root.
    GatherClauses,
    /// Merged buffer flowing root → leaves.
    DistributeClauses,
}

/// A clause buffer in exchange format: the first integer is the number of VIP
/// clauses (each zero-terminated), followed per clause length ℓ = 1, 2, … by
/// a count and that many fixed-length groups of ℓ literals.
pub type ClauseBuffer = Vec<i32>;

/// One hop of a clause-exchange round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    /// Job-communication epoch of the round; stale epochs are discarded
    /// without digesting.
    pub epoch: u32,
    pub tag: JobMessageTag,
    /// Tree depth this buffer has traversed so far; bounds the merge cap.
    pub depth: u32,
    pub payload: ClauseBuffer,
}
