//! Action types for the deterministic worker state machine.

use crate::{Event, TimerId};
use satswarm_messages::Message;
use satswarm_types::{JobDescription, JobId, JobResult, WorkerRank};
use std::sync::Arc;
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do.
/// The runner executes actions and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ── Network ──
    /// Send a message to one worker. Self-sends are allowed and delivered
    /// through the same path as remote messages.
    SendTo { to: WorkerRank, message: Message },

    // ── Timers ──
    /// Set a timer to fire after a duration.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    // ── Internal (fed back as events with Internal priority) ──
    /// Enqueue an internal event for immediate processing.
    EnqueueInternal { event: Event },

    // ── Solver commands (async, some return callback events) ──
    /// Ingest the description and start the solver portfolio for a job.
    /// Returns `Event::SolverStarted` when initialization completes;
    /// a verdict later arrives as `Event::SolverResult`.
    StartSolver {
        job_id: JobId,
        description: Arc<JobDescription>,
        /// Diversification seed for the portfolio.
        seed: u64,
        num_threads: u32,
    },

    /// Pause the solver threads; safe to issue from the scheduling context.
    SuspendSolver { job_id: JobId },

    /// Resume previously suspended solver threads.
    ResumeSolver { job_id: JobId },

    /// Interrupt the search (solver reports `Unknown` and stops).
    InterruptSolver { job_id: JobId },

    /// Tear the solver down; no further callbacks for this job.
    TerminateSolver { job_id: JobId },

    /// Export up to `max_literals` of learned clauses.
    /// Returns `Event::SharingPrepared`.
    PrepareSharing { job_id: JobId, max_literals: usize },

    /// Import a merged clause buffer into the solver.
    DigestSharing { job_id: JobId, buffer: Vec<i32> },

    // ── Watchdog ──
    /// Sample this process's resident set.
    /// Returns `Event::MemorySampled`.
    SampleMemory,

    // ── External notifications ──
    /// A result is ready for pickup; the client side reacts by sending
    /// `QUERY_JOB_RESULT` to this worker.
    EmitJobDone {
        job_id: JobId,
        client_rank: WorkerRank,
        transfer_size: u64,
    },

    /// Full result handed to the local client side.
    EmitJobResult { result: JobResult },

    /// A job was aborted (limit exceeded or cascade); surfaced to the
    /// client side by the introducer.
    EmitJobAborted { job_id: JobId },

    /// Clean fleet shutdown was requested; the runner stops this worker.
    Shutdown,
}

impl Action {
    /// Check if this action is a network send.
    pub fn is_send(&self) -> bool {
        matches!(self, Action::SendTo { .. })
    }

    /// Check if this action is delegated solver work.
    pub fn is_solver(&self) -> bool {
        matches!(
            self,
            Action::StartSolver { .. }
                | Action::SuspendSolver { .. }
                | Action::ResumeSolver { .. }
                | Action::InterruptSolver { .. }
                | Action::TerminateSolver { .. }
                | Action::PrepareSharing { .. }
                | Action::DigestSharing { .. }
        )
    }

    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::SendTo { .. } => "SendTo",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::StartSolver { .. } => "StartSolver",
            Action::SuspendSolver { .. } => "SuspendSolver",
            Action::ResumeSolver { .. } => "ResumeSolver",
            Action::InterruptSolver { .. } => "InterruptSolver",
            Action::TerminateSolver { .. } => "TerminateSolver",
            Action::PrepareSharing { .. } => "PrepareSharing",
            Action::DigestSharing { .. } => "DigestSharing",
            Action::SampleMemory => "SampleMemory",
            Action::EmitJobDone { .. } => "EmitJobDone",
            Action::EmitJobResult { .. } => "EmitJobResult",
            Action::EmitJobAborted { .. } => "EmitJobAborted",
            Action::Shutdown => "Shutdown",
        }
    }
}
