//! The per-fragment job lifecycle machine.

use crate::SharingState;
use satswarm_types::{JobDescription, JobId, JobRequest, JobResult, JobTree, WorkerRank};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Lifecycle state of a local job fragment.
///
/// Transitions:
///
/// | From | Event | To |
/// |---|---|---|
/// | Inactive | commit | Committed |
/// | Committed | uncommit / reject | Inactive |
/// | Committed | description received, start | Active |
/// | Active | suspend | Suspended |
/// | Suspended | resume | Active |
/// | Active | stop | Inactive |
/// | any non-Past | terminate | Past |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Inactive,
    Committed,
    Active,
    Suspended,
    /// Terminal; nothing but housekeeping timestamps mutates afterwards.
    Past,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Inactive => "INACTIVE",
            JobState::Committed => "COMMITTED",
            JobState::Active => "ACTIVE",
            JobState::Suspended => "SUSPENDED",
            JobState::Past => "PAST",
        }
    }
}

/// How a cascade wants a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationMode {
    /// Stop solvers and move to PAST.
    Terminate,
    /// Stop solvers but keep the job around (incremental jobs between
    /// revisions).
    Interrupt,
    /// Reckless terminate: the description may never arrive.
    Abort,
}

/// The local fragment of one distributed job.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    state: JobState,
    /// Solver start in flight; cleared by `Event::SolverStarted`.
    initializing: bool,
    tree: JobTree,
    description: Option<Arc<JobDescription>>,
    commitment: Option<JobRequest>,
    priority: f32,
    num_threads: u32,

    growth_period: f64,
    continuous_growth: bool,
    max_demand: u32,

    /// Most recent volume assigned by the balancer.
    last_volume: u32,
    /// Balancing epoch of the last volume update; older placement requests
    /// for this job are obsolete.
    volume_epoch: u32,

    time_of_arrival: Duration,
    time_of_activation: Option<Duration>,
    time_of_abort: Option<Duration>,

    result: Option<JobResult>,
    /// Set on the root fragment only: the introducer rank that receives the
    /// result notification.
    client_rank: Option<WorkerRank>,
    /// Children pruned or defected since the last cascade; still owed a
    /// propagated termination.
    past_children: Vec<WorkerRank>,
    /// Terminate/interrupt/abort received while COMMITTED is deferred here
    /// until the commitment resolves.
    pending_termination: Option<TerminationMode>,

    pub sharing: SharingState,

    last_temperature: f64,
    age_of_const_cooldown: Option<i64>,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: JobId,
        fleet_size: u32,
        own_rank: WorkerRank,
        now: Duration,
        growth_period: f64,
        continuous_growth: bool,
        max_demand: u32,
        num_threads: u32,
    ) -> Self {
        Self {
            id,
            state: JobState::Inactive,
            initializing: false,
            tree: JobTree::new(fleet_size, own_rank, id),
            description: None,
            commitment: None,
            priority: 1.0,
            num_threads,
            growth_period,
            continuous_growth,
            max_demand,
            last_volume: 0,
            volume_epoch: 0,
            time_of_arrival: now,
            time_of_activation: None,
            time_of_abort: None,
            result: None,
            client_rank: None,
            past_children: Vec::new(),
            pending_termination: None,
            sharing: SharingState::default(),
            last_temperature: 1.0,
            age_of_const_cooldown: None,
        }
    }

    // ─── Accessors ───

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_in_state(&self, states: &[JobState]) -> bool {
        states.contains(&self.state)
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing
    }

    pub fn set_initialized(&mut self) {
        self.initializing = false;
    }

    pub fn tree(&self) -> &JobTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut JobTree {
        &mut self.tree
    }

    pub fn is_root(&self) -> bool {
        self.tree.is_root()
    }

    pub fn has_description(&self) -> bool {
        self.description.is_some()
    }

    pub fn description(&self) -> Option<&Arc<JobDescription>> {
        self.description.as_ref()
    }

    pub fn priority(&self) -> f32 {
        self.priority
    }

    pub fn num_threads(&self) -> u32 {
        self.num_threads
    }

    pub fn set_num_threads(&mut self, threads: u32) {
        self.num_threads = threads;
    }

    pub fn revision(&self) -> u32 {
        self.description.as_ref().map(|d| d.revision()).unwrap_or(0)
    }

    pub fn last_volume(&self) -> u32 {
        self.last_volume
    }

    pub fn set_last_volume(&mut self, volume: u32, epoch: u32) {
        self.last_volume = volume;
        self.volume_epoch = epoch;
    }

    pub fn volume_epoch(&self) -> u32 {
        self.volume_epoch
    }

    pub fn commitment(&self) -> Option<&JobRequest> {
        self.commitment.as_ref()
    }

    pub fn client_rank(&self) -> Option<WorkerRank> {
        self.client_rank
    }

    pub fn set_client_rank(&mut self, rank: WorkerRank) {
        self.client_rank = Some(rank);
    }

    pub fn result(&self) -> Option<&JobResult> {
        self.result.as_ref()
    }

    pub fn set_result(&mut self, result: JobResult) {
        self.result = Some(result);
    }

    pub fn past_children(&self) -> &[WorkerRank] {
        &self.past_children
    }

    pub fn add_past_child(&mut self, rank: WorkerRank) {
        self.past_children.push(rank);
    }

    pub fn clear_past_children(&mut self) {
        self.past_children.clear();
    }

    pub fn pending_termination(&self) -> Option<TerminationMode> {
        self.pending_termination
    }

    pub fn set_pending_termination(&mut self, mode: TerminationMode) {
        self.pending_termination = Some(mode);
    }

    pub fn take_pending_termination(&mut self) -> Option<TerminationMode> {
        self.pending_termination.take()
    }

    pub fn time_of_activation(&self) -> Option<Duration> {
        self.time_of_activation
    }

    /// Seconds since first activation.
    pub fn age(&self, now: Duration) -> f64 {
        self.time_of_activation
            .map(|t| now.saturating_sub(t).as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Display form: `#id:index`.
    pub fn to_str(&self) -> String {
        format!("{}:{}", self.id, self.tree.index())
    }

    // ─── Transitions ───

    /// Commit to a placement request: remember it and re-seat the tree at the
    /// requested slot. A suspended fragment stays suspended (a successful
    /// handshake resumes it in place); an inactive one becomes COMMITTED.
    pub fn commit(&mut self, req: JobRequest) {
        if matches!(self.state, JobState::Active | JobState::Past) {
            error!(job = %self.to_str(), state = self.state.as_str(), "commit in illegal state");
            return;
        }
        self.tree.update(
            req.requested_node_index,
            req.root_rank,
            req.requesting_node_rank,
        );
        if req.requested_node_index == 0 {
            // The requester of a root slot is the job's introducer.
            self.client_rank = Some(req.requesting_node_rank);
        }
        self.commitment = Some(req);
        if self.state == JobState::Inactive {
            self.state = JobState::Committed;
        }
    }

    /// Drop the commitment after a rejection or an empty transfer.
    pub fn uncommit(&mut self) {
        if matches!(self.state, JobState::Active | JobState::Past) {
            error!(job = %self.to_str(), state = self.state.as_str(), "uncommit in illegal state");
            return;
        }
        self.commitment = None;
        if self.state == JobState::Committed {
            self.state = JobState::Inactive;
        }
    }

    pub fn take_commitment(&mut self) -> Option<JobRequest> {
        self.commitment.take()
    }

    pub fn set_description(&mut self, description: Arc<JobDescription>) {
        self.priority = description.priority;
        self.description = Some(description);
    }

    /// Drop the description to reclaim memory; a later adoption will request
    /// a full transfer again.
    pub fn forget_description(&mut self) {
        self.description = None;
    }

    /// Begin computing: the description is present and the solver start has
    /// been issued. A suspended fragment whose description was dropped under
    /// memory pressure restarts from scratch through this path.
    pub fn start(&mut self, now: Duration) {
        debug_assert!(self.description.is_some());
        if !matches!(
            self.state,
            JobState::Inactive | JobState::Committed | JobState::Suspended
        ) {
            error!(job = %self.to_str(), state = self.state.as_str(), "start in illegal state");
            return;
        }
        if self.time_of_activation.is_none() {
            self.time_of_activation = Some(now);
        }
        self.last_volume = 1;
        self.commitment = None;
        self.initializing = true;
        self.state = JobState::Active;
    }

    /// Stop computing without leaving the fleet (result found or interrupt).
    pub fn stop(&mut self) {
        if self.state != JobState::Active {
            error!(job = %self.to_str(), state = self.state.as_str(), "stop in illegal state");
            return;
        }
        self.state = JobState::Inactive;
    }

    /// Pause after a volume shrink or preemption.
    pub fn suspend(&mut self) {
        if self.state != JobState::Active {
            error!(job = %self.to_str(), state = self.state.as_str(), "suspend in illegal state");
            return;
        }
        self.state = JobState::Suspended;
        self.last_volume = 0;
        debug!(job = %self.to_str(), "suspended");
    }

    /// Resume at an existing slot after re-adoption. Resuming resolves any
    /// commitment that carried the fragment here.
    pub fn resume(&mut self, now: Duration) {
        if self.state != JobState::Suspended {
            error!(job = %self.to_str(), state = self.state.as_str(), "resume in illegal state");
            return;
        }
        self.commitment = None;
        self.state = JobState::Active;
        self.initializing = false;
        if self.time_of_activation.is_none() {
            self.time_of_activation = Some(now);
        }
        debug!(job = %self.to_str(), "resumed");
    }

    /// Terminal transition.
    pub fn terminate(&mut self, now: Duration) {
        if self.state == JobState::Past {
            return;
        }
        self.state = JobState::Past;
        self.initializing = false;
        self.last_volume = 0;
        self.commitment = None;
        self.tree.unset_left_child();
        self.tree.unset_right_child();
        self.time_of_abort = Some(now);
        debug!(job = %self.to_str(), "terminated");
    }

    // ─── Demand curve ───

    /// Demand of this job as seen by its root.
    ///
    /// While ACTIVE the demand follows the configured growth curve; otherwise
    /// it stays frozen at the previously reported volume.
    pub fn demand(&self, prev_volume: u32, now: Duration) -> u32 {
        let fleet = self.tree.fleet_size();
        if self.state != JobState::Active {
            return prev_volume;
        }

        let mut demand = if self.growth_period <= 0.0 {
            // Immediate growth
            fleet
        } else {
            match self.time_of_activation {
                None => 1,
                Some(t0) => {
                    let t = now.saturating_sub(t0).as_secs_f64();
                    let num_periods = t / self.growth_period;
                    if self.continuous_growth {
                        // d(0) = 1; doubling plus one every growth period
                        let d = 2f64.powf(num_periods + 1.0) - 1.0;
                        if d >= fleet as f64 {
                            fleet
                        } else {
                            d as u32
                        }
                    } else {
                        let exp = num_periods.floor() as u32 + 1;
                        if exp >= 31 {
                            fleet
                        } else {
                            fleet.min((1u32 << exp) - 1)
                        }
                    }
                }
            }
        };

        if self.max_demand > 0 {
            demand = demand.min(self.max_demand);
        }
        demand
    }

    // ─── Temperature ───

    /// Convergence-damping temperature, strictly decreasing with age.
    ///
    /// Exponentially converges from 1.0 towards 0.95; once the per-step delta
    /// falls below machine epsilon, switches to a linear epsilon-scale decay
    /// anchored at that age so the sequence keeps strictly decreasing.
    pub fn temperature(&mut self, now: Duration) -> f64 {
        let base_temp = 0.95;
        let decay = 0.99f64;

        let age = self
            .time_of_activation
            .map(|t| now.saturating_sub(t).as_secs() as i64)
            .unwrap_or(0);
        let eps = 2.0 * f64::EPSILON;

        let temp = base_temp + (1.0 - base_temp) * decay.powi(age as i32 + 1);

        if self.age_of_const_cooldown.is_none() && self.last_temperature - temp <= eps {
            self.age_of_const_cooldown = Some(age);
        }
        if let Some(anchor) = self.age_of_const_cooldown {
            base_temp + (1.0 - base_temp) * decay.powi(anchor as i32 + 1)
                - (age - anchor + 1) as f64 * eps
        } else {
            self.last_temperature = temp;
            temp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satswarm_types::JobRequest;

    fn job(fleet: u32, growth_period: f64) -> Job {
        Job::new(
            JobId(1),
            fleet,
            0,
            Duration::ZERO,
            growth_period,
            false,
            0,
            4,
        )
    }

    fn root_request(job_id: u64) -> JobRequest {
        JobRequest::new(JobId(job_id), 0, 3, 0, Duration::ZERO, 0)
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut j = job(4, 0.0);
        assert_eq!(j.state(), JobState::Inactive);

        j.commit(root_request(1));
        assert_eq!(j.state(), JobState::Committed);
        assert_eq!(j.client_rank(), Some(3));

        j.set_description(Arc::new(JobDescription::new(
            JobId(1),
            1.0,
            vec![1, 0],
            vec![],
        )));
        j.start(Duration::from_secs(1));
        assert_eq!(j.state(), JobState::Active);
        assert!(j.is_initializing());
        assert_eq!(j.last_volume(), 1);

        j.suspend();
        assert_eq!(j.state(), JobState::Suspended);
        assert_eq!(j.last_volume(), 0);

        j.resume(Duration::from_secs(2));
        assert_eq!(j.state(), JobState::Active);

        j.stop();
        assert_eq!(j.state(), JobState::Inactive);

        j.terminate(Duration::from_secs(3));
        assert_eq!(j.state(), JobState::Past);
    }

    #[test]
    fn test_uncommit_returns_to_inactive() {
        let mut j = job(4, 0.0);
        j.commit(root_request(1));
        j.uncommit();
        assert_eq!(j.state(), JobState::Inactive);
        assert!(j.commitment().is_none());
    }

    #[test]
    fn test_commit_keeps_suspended_fragment_suspended() {
        let mut j = job(8, 0.0);
        j.set_description(Arc::new(JobDescription::new(
            JobId(1),
            1.0,
            vec![1, 0],
            vec![],
        )));
        j.commit(root_request(1));
        j.start(Duration::ZERO);
        j.suspend();

        // Re-adoption at a different slot: the fragment stays suspended
        // until the handshake resumes it.
        let req = JobRequest::new(JobId(1), 0, 2, 5, Duration::from_secs(1), 1);
        j.commit(req);
        assert_eq!(j.state(), JobState::Suspended);
        assert_eq!(j.tree().index(), 5);
        assert_eq!(j.tree().parent_rank(), Some(2));

        j.resume(Duration::from_secs(2));
        assert_eq!(j.state(), JobState::Active);
        assert!(j.commitment().is_none());
    }

    #[test]
    fn test_demand_immediate_when_growth_period_zero() {
        let mut j = job(4, 0.0);
        j.set_description(Arc::new(JobDescription::new(
            JobId(1),
            1.0,
            vec![1, 0],
            vec![],
        )));
        j.commit(root_request(1));
        j.start(Duration::ZERO);
        assert_eq!(j.demand(1, Duration::from_millis(1)), 4);
    }

    #[test]
    fn test_demand_doubling_discrete() {
        let mut j = Job::new(JobId(1), 64, 0, Duration::ZERO, 2.0, false, 0, 4);
        j.set_description(Arc::new(JobDescription::new(
            JobId(1),
            1.0,
            vec![1, 0],
            vec![],
        )));
        j.commit(root_request(1));
        j.start(Duration::ZERO);

        // t < g: one period floor = 0 => 2^1 - 1 = 1
        assert_eq!(j.demand(1, Duration::from_secs(1)), 1);
        // t in [g, 2g): 2^2 - 1 = 3
        assert_eq!(j.demand(1, Duration::from_secs(2)), 3);
        // t in [2g, 3g): 2^3 - 1 = 7
        assert_eq!(j.demand(1, Duration::from_secs(4)), 7);
        // Far in the future: clamped to the fleet
        assert_eq!(j.demand(1, Duration::from_secs(1000)), 64);
    }

    #[test]
    fn test_demand_clamped_by_max_demand() {
        let mut j = Job::new(JobId(1), 64, 0, Duration::ZERO, 0.0, false, 5, 4);
        j.set_description(Arc::new(JobDescription::new(
            JobId(1),
            1.0,
            vec![1, 0],
            vec![],
        )));
        j.commit(root_request(1));
        j.start(Duration::ZERO);
        assert_eq!(j.demand(1, Duration::from_secs(1)), 5);
    }

    #[test]
    fn test_demand_frozen_when_not_active() {
        let mut j = job(16, 0.0);
        assert_eq!(j.demand(7, Duration::from_secs(5)), 7);
    }

    #[test]
    fn test_temperature_strictly_decreasing() {
        let mut j = job(4, 0.0);
        j.set_description(Arc::new(JobDescription::new(
            JobId(1),
            1.0,
            vec![1, 0],
            vec![],
        )));
        j.commit(root_request(1));
        j.start(Duration::ZERO);

        let mut last = f64::INFINITY;
        for age in 0..10_000u64 {
            let t = j.temperature(Duration::from_secs(age));
            assert!(t < last, "temperature must strictly decrease at age {age}");
            last = t;
        }
    }
}
