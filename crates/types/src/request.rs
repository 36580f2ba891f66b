//! Placement tokens exchanged during job placement.

use crate::{JobId, TreeIndex, WorkerRank};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A placement token hunting for a worker to fill one `(job, tree index)` slot.
///
/// Minted when a root activates, when the balancer raises a job's volume, or
/// when a defection vacates an index. The only field mutated in flight is
/// `num_hops`, incremented once per bounce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
    /// Rank hosting the job's root fragment.
    pub root_rank: WorkerRank,
    /// Rank that minted this request and will receive the adoption offer.
    pub requesting_node_rank: WorkerRank,
    /// Tree slot to be filled.
    pub requested_node_index: TreeIndex,
    /// Scheduler time at mint; used only to log clearly stale requests.
    pub time_of_birth: Duration,
    /// Bounces so far; strictly monotone along the forwarding path.
    pub num_hops: u32,
    /// Set by the adopting candidate: whether a full description transfer is
    /// needed.
    pub full_transfer: bool,
    /// Balancing epoch at mint; newer epochs obsolete this request.
    pub epoch: u32,
}

impl JobRequest {
    pub fn new(
        job_id: JobId,
        root_rank: WorkerRank,
        requesting_node_rank: WorkerRank,
        requested_node_index: TreeIndex,
        time_of_birth: Duration,
        epoch: u32,
    ) -> Self {
        Self {
            job_id,
            root_rank,
            requesting_node_rank,
            requested_node_index,
            time_of_birth,
            num_hops: 0,
            full_transfer: false,
            epoch,
        }
    }

    /// Whether this request targets a job's root slot.
    pub fn is_root_request(&self) -> bool {
        self.requested_node_index == 0
    }
}

/// Sent by a prospective parent accepting a candidate child: enough for the
/// candidate to decide whether it needs the description and to size the
/// incoming transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSignature {
    pub job_id: JobId,
    pub root_rank: WorkerRank,
    pub revision: u32,
    /// Serialized size of the description transfer, in bytes.
    pub transfer_size: u64,
}
