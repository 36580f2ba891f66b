//! Wire messages for the placement, balancing, and intra-job protocols.
//!
//! Every message travels as a tagged, length-prefixed payload over the
//! point-to-point transport. The transport guarantees FIFO between a pair of
//! peers and nothing more; every protocol here tolerates duplicates and
//! reordering across peers.

mod job_message;

pub use job_message::{ClauseBuffer, JobMessage, JobMessageTag};

use satswarm_types::{
    EventMap, JobId, JobRequest, JobResult, JobSignature, TreeIndex, WorkerRank,
};
use serde::{Deserialize, Serialize};

/// Which of the two overlay trees an event-driven balancing message travels
/// on: the normal tree is rooted at rank 0, the reversed tree at rank N−1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeSide {
    Normal,
    Reversed,
}

/// All messages a worker can receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // ── Placement ──
    /// Placement request bounce.
    FindNode(JobRequest),
    /// An idle candidate offers itself for the requested slot.
    RequestBecomeChild(JobRequest),
    /// Prospective parent accepts the candidate.
    AcceptBecomeChild(JobSignature),
    /// Prospective parent rejects; carries the original request back.
    RejectBecomeChild(JobRequest),
    /// Candidate is ready for the description transfer.
    AckAcceptBecomeChild(JobRequest),
    /// Full description transfer. An empty payload means the job already
    /// terminated and the receiver should uncommit.
    SendJobDescription { job_id: JobId, data: Vec<u8> },

    // ── Volume propagation ──
    UpdateVolume { job_id: JobId, volume: u32 },
    QueryVolume { job_id: JobId },
    /// A worker departs its non-root slot; the parent re-requests the index.
    WorkerDefecting { job_id: JobId, index: TreeIndex },

    // ── Intra-job communication ──
    JobCommunication(JobMessage),

    // ── Results ──
    WorkerFoundResult {
        job_id: JobId,
        revision: u32,
        result: satswarm_types::ResultCode,
    },
    /// Root tells the winning worker which rank to deliver to.
    ForwardClientRank { job_id: JobId, client_rank: WorkerRank },
    /// Client requests the full result from the winning worker.
    QueryJobResult { job_id: JobId },
    SendJobResult(JobResult),

    // ── Cascade controls ──
    Terminate { job_id: JobId },
    Interrupt { job_id: JobId },
    Abort { job_id: JobId },

    // ── Balancer traffic ──
    /// Butterfly reduce/broadcast payload; interpreted by the balancer's
    /// current phase.
    Collective { payload: Vec<u8> },
    AnytimeReduction { tree: TreeSide, events: EventMap },
    AnytimeBroadcast { tree: TreeSide, events: EventMap },

    // ── Fleet control ──
    /// Connectivity prime sent to bounce alternatives at startup.
    Warmup,
    /// Fleet shutdown.
    Exit,
}

impl Message {
    /// Message tag name for logging and telemetry.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::FindNode(_) => "FIND_NODE",
            Message::RequestBecomeChild(_) => "REQUEST_BECOME_CHILD",
            Message::AcceptBecomeChild(_) => "ACCEPT_BECOME_CHILD",
            Message::RejectBecomeChild(_) => "REJECT_BECOME_CHILD",
            Message::AckAcceptBecomeChild(_) => "ACK_ACCEPT_BECOME_CHILD",
            Message::SendJobDescription { .. } => "SEND_JOB_DESCRIPTION",
            Message::UpdateVolume { .. } => "UPDATE_VOLUME",
            Message::QueryVolume { .. } => "QUERY_VOLUME",
            Message::WorkerDefecting { .. } => "WORKER_DEFECTING",
            Message::JobCommunication(_) => "JOB_COMMUNICATION",
            Message::WorkerFoundResult { .. } => "WORKER_FOUND_RESULT",
            Message::ForwardClientRank { .. } => "FORWARD_CLIENT_RANK",
            Message::QueryJobResult { .. } => "QUERY_JOB_RESULT",
            Message::SendJobResult(_) => "SEND_JOB_RESULT",
            Message::Terminate { .. } => "TERMINATE",
            Message::Interrupt { .. } => "INTERRUPT",
            Message::Abort { .. } => "ABORT",
            Message::Collective { .. } => "COLLECTIVES",
            Message::AnytimeReduction { .. } => "ANYTIME_REDUCTION",
            Message::AnytimeBroadcast { .. } => "ANYTIME_BROADCAST",
            Message::Warmup => "WARMUP",
            Message::Exit => "EXIT",
        }
    }

    /// Whether this message is balancer traffic, routed straight to the
    /// balancer by the worker's dispatch loop.
    pub fn is_balancer_traffic(&self) -> bool {
        matches!(
            self,
            Message::Collective { .. }
                | Message::AnytimeReduction { .. }
                | Message::AnytimeBroadcast { .. }
        )
    }
}
