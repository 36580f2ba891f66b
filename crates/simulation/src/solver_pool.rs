//! Scripted solver back-ends for the simulated fleet.

use crate::NodeIndex;
use satswarm_types::{JobId, ResultCode};
use std::collections::HashMap;
use std::time::Duration;

/// Scripted behavior of every solver instance of one job.
#[derive(Debug, Clone)]
pub struct SolverScript {
    /// Time between `StartSolver` and `SolverStarted`.
    pub init_delay: Duration,
    /// Verdict produced after this much running time, if any.
    pub verdict: Option<(Duration, ResultCode, Vec<i32>)>,
    /// Clause export returned by every `PrepareSharing`.
    pub export: Vec<i32>,
}

impl Default for SolverScript {
    fn default() -> Self {
        Self {
            init_delay: Duration::from_millis(20),
            verdict: None,
            export: Vec::new(),
        }
    }
}

/// Lifecycle of one simulated solver instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverSimState {
    Initializing,
    Running,
    Suspended,
    Interrupted,
}

/// All simulated solver instances, keyed by (node, job).
#[derive(Debug, Default)]
pub struct SolverPool {
    scripts: HashMap<JobId, SolverScript>,
    states: HashMap<(NodeIndex, JobId), SolverSimState>,
    digested: HashMap<(NodeIndex, JobId), usize>,
}

impl SolverPool {
    pub fn script(&mut self, job_id: JobId, script: SolverScript) {
        self.scripts.insert(job_id, script);
    }

    pub fn script_of(&self, job_id: JobId) -> SolverScript {
        self.scripts.get(&job_id).cloned().unwrap_or_default()
    }

    pub fn state(&self, node: NodeIndex, job_id: JobId) -> Option<SolverSimState> {
        self.states.get(&(node, job_id)).copied()
    }

    pub fn set_state(&mut self, node: NodeIndex, job_id: JobId, state: SolverSimState) {
        self.states.insert((node, job_id), state);
    }

    pub fn remove(&mut self, node: NodeIndex, job_id: JobId) {
        self.states.remove(&(node, job_id));
    }

    pub fn is_running(&self, node: NodeIndex, job_id: JobId) -> bool {
        self.state(node, job_id) == Some(SolverSimState::Running)
    }

    pub fn record_digest(&mut self, node: NodeIndex, job_id: JobId) {
        *self.digested.entry((node, job_id)).or_insert(0) += 1;
    }

    /// How many merged buffers this node's solver has digested for a job.
    pub fn digest_count(&self, node: NodeIndex, job_id: JobId) -> usize {
        self.digested.get(&(node, job_id)).copied().unwrap_or(0)
    }
}
