//! The balancer contract shared by both strategies.

use satswarm_core::Action;
use satswarm_messages::Message;
use satswarm_types::{JobId, WorkerRank};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// How fractional assignments become integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoundingMode {
    /// Round x up with probability `x − ⌊x⌋`, independently per worker.
    Probabilistic,
    /// Fleet-wide bisection over the sorted distinct fractional remainders.
    Bisection,
}

/// One locally rooted job entering a balancing epoch.
#[derive(Debug, Clone)]
pub struct BalanceJob {
    pub job_id: JobId,
    pub demand: u32,
    pub priority: f32,
}

/// This worker's contribution to a balancing epoch.
#[derive(Debug, Clone, Default)]
pub struct BalanceInput {
    /// Participating local roots, any order.
    pub jobs: Vec<BalanceJob>,
    /// Whether this worker currently computes on an active job.
    pub busy: bool,
    /// Active jobs counted locally, including roots that cannot participate
    /// yet (they carry an implicit demand of one).
    pub active_jobs: u32,
}

/// Result of driving a balancer one step.
#[derive(Debug, Default)]
pub struct BalanceOutcome {
    /// The epoch finished; `result()` is ready.
    pub done: bool,
    pub actions: Vec<Action>,
}

impl BalanceOutcome {
    pub fn pending(actions: Vec<Action>) -> Self {
        Self {
            done: false,
            actions,
        }
    }

    pub fn done(actions: Vec<Action>) -> Self {
        Self {
            done: true,
            actions,
        }
    }
}

/// The 6-operation balancing contract both strategies implement.
pub trait Balancer: Send {
    /// Start a balancing activity from this worker's current jobs.
    fn begin(&mut self, now: Duration, input: BalanceInput) -> BalanceOutcome;

    /// Whether a balancing activity is in flight on this worker.
    fn is_balancing(&self) -> bool;

    /// Whether a step can run without a new message.
    fn can_continue(&self) -> bool;

    /// Run a message-free step (only meaningful after `can_continue`).
    fn advance(&mut self) -> BalanceOutcome;

    /// Feed one piece of balancer traffic.
    fn handle_message(&mut self, from: WorkerRank, message: &Message) -> BalanceOutcome;

    /// The volumes of the finished epoch. Valid once an outcome reported
    /// `done`.
    fn result(&mut self) -> BTreeMap<JobId, u32>;

    fn has_volume(&self, job_id: JobId) -> bool {
        self.volume_of(job_id).is_some()
    }

    /// Most recent volume known for a job, from this worker's last epoch or
    /// from a volume update received out of band.
    fn volume_of(&self, job_id: JobId) -> Option<u32>;

    /// Record a volume learned from a peer (e.g. via `UPDATE_VOLUME`).
    fn update_volume(&mut self, job_id: JobId, volume: u32);

    /// The job is gone; stop accounting for it.
    fn forget(&mut self, job_id: JobId, now: Duration);
}
