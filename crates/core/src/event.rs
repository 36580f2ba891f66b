//! Event types for the deterministic worker state machine.

use satswarm_messages::Message;
use satswarm_types::{JobDescription, JobId, ResultCode, WorkerRank};

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// This ensures causality is preserved: internal events (consequences of
/// processing an event) are handled before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    Internal = 0,

    /// Timer events: scheduled by the worker itself.
    Timer = 1,

    /// Network events: messages from other workers.
    Network = 2,

    /// Client events: job submissions from users.
    Client = 3,
}

/// All possible events a worker can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ── Timers (priority: Timer) ──
    /// Memory/stats watchdog fired (~1 s cadence).
    WatchdogTimer,

    /// Compute tick fired (~50 ms cadence): limit checks, clause-exchange
    /// cadence, initialization follow-ups.
    ComputeTimer,

    /// Time to trigger periodic balancing.
    BalanceTimer,

    // ── Network (priority: Network) ──
    /// A message arrived from another worker (or from this worker itself —
    /// self-sends are delivered like any other).
    MessageReceived { from: WorkerRank, message: Message },

    // ── Solver callbacks (priority: Internal) ──
    /// The solver finished initializing and is searching.
    ///
    /// Callback from `Action::StartSolver`.
    SolverStarted { job_id: JobId },

    /// The solver produced a verdict.
    SolverResult {
        job_id: JobId,
        revision: u32,
        result: ResultCode,
        solution: Vec<i32>,
    },

    /// A clause export is ready.
    ///
    /// Callback from `Action::PrepareSharing`.
    SharingPrepared { job_id: JobId, buffer: Vec<i32> },

    /// Resident-set sample from the runner.
    ///
    /// Callback from `Action::SampleMemory`.
    MemorySampled { resident_gb: f64 },

    // ── Client (priority: Client) ──
    /// A client submitted a job to this worker; this worker becomes the
    /// job's introducer and mints the root placement request.
    SubmitJob {
        description: JobDescription,
        client_rank: WorkerRank,
    },
}

impl Event {
    /// Get the priority for this event type.
    ///
    /// Events at the same timestamp are processed in priority order,
    /// ensuring causality is preserved.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::SolverStarted { .. }
            | Event::SolverResult { .. }
            | Event::SharingPrepared { .. }
            | Event::MemorySampled { .. } => EventPriority::Internal,

            Event::WatchdogTimer | Event::ComputeTimer | Event::BalanceTimer => {
                EventPriority::Timer
            }

            Event::MessageReceived { .. } => EventPriority::Network,

            Event::SubmitJob { .. } => EventPriority::Client,
        }
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::WatchdogTimer => "WatchdogTimer",
            Event::ComputeTimer => "ComputeTimer",
            Event::BalanceTimer => "BalanceTimer",
            Event::MessageReceived { .. } => "MessageReceived",
            Event::SolverStarted { .. } => "SolverStarted",
            Event::SolverResult { .. } => "SolverResult",
            Event::SharingPrepared { .. } => "SharingPrepared",
            Event::MemorySampled { .. } => "MemorySampled",
            Event::SubmitJob { .. } => "SubmitJob",
        }
    }
}
