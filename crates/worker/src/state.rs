//! Worker state and the control-flow backbone.

use crate::{BalancerMode, WorkerConfig};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use satswarm_balance::{
    BalanceInput, BalanceJob, Balancer, CutoffPriorityBalancer, EventDrivenBalancer,
};
use satswarm_core::{Action, Event, StateMachine, TimerId};
use satswarm_messages::Message;
use satswarm_types::{bounce_alternatives, EpochCounter, JobDescription, JobId, WorkerRank};
use satswarm_job::{Job, JobState};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// A job this worker introduced on behalf of a client: it keeps the
/// description and answers the root-slot handshake.
#[derive(Debug)]
pub(crate) struct IntroducedJob {
    pub description: Arc<JobDescription>,
    pub root_rank: Option<WorkerRank>,
}

/// The complete scheduler state of one worker process.
pub struct WorkerState {
    pub(crate) rank: WorkerRank,
    pub(crate) fleet_size: u32,
    pub(crate) config: WorkerConfig,
    pub(crate) now: Duration,

    /// All locally known jobs, in any state. Ordered so that fleet-wide
    /// aggregations iterate deterministically.
    pub(crate) jobs: BTreeMap<JobId, Job>,
    /// In-flight adoption offers, keyed by job — at most one per job, which
    /// suppresses duplicate commits.
    pub(crate) commitments: HashMap<JobId, satswarm_types::JobRequest>,
    /// Jobs this worker introduced for a client.
    pub(crate) introduced: HashMap<JobId, IntroducedJob>,

    /// The single active job slot (invariant: at most one ACTIVE job).
    pub(crate) current_job: Option<JobId>,
    pub(crate) load: u32,
    pub(crate) last_load_change: Duration,

    pub(crate) epoch: EpochCounter,
    pub(crate) balancer: Box<dyn Balancer>,
    /// Volumes of the last published balancing epoch.
    pub(crate) volumes: HashMap<JobId, u32>,

    pub(crate) cpu_time_used: HashMap<JobId, f64>,
    pub(crate) last_limit_check: HashMap<JobId, Duration>,

    pub(crate) bounce_alts: Vec<WorkerRank>,
    pub(crate) rng: ChaCha8Rng,
    pub(crate) exiting: bool,
}

impl WorkerState {
    pub fn new(rank: WorkerRank, fleet_size: u32, config: WorkerConfig, seed: u64) -> Self {
        let balancer: Box<dyn Balancer> = match config.balancer_mode {
            BalancerMode::CutoffPriority => Box::new(CutoffPriorityBalancer::new(
                rank,
                fleet_size,
                config.load_factor,
                config.rounding_mode,
                seed,
            )),
            BalancerMode::EventDriven => Box::new(EventDrivenBalancer::new(
                rank,
                fleet_size,
                config.load_factor,
                config.broadcast_history,
            )),
        };

        let bounce_alts = if config.derandomize {
            bounce_alternatives(fleet_size, rank, config.bounce_alternatives)
        } else {
            Vec::new()
        };

        Self {
            rank,
            fleet_size,
            config,
            now: Duration::ZERO,
            jobs: BTreeMap::new(),
            commitments: HashMap::new(),
            introduced: HashMap::new(),
            current_job: None,
            load: 0,
            last_load_change: Duration::ZERO,
            epoch: EpochCounter::new(),
            balancer,
            volumes: HashMap::new(),
            cpu_time_used: HashMap::new(),
            last_limit_check: HashMap::new(),
            bounce_alts,
            rng: ChaCha8Rng::seed_from_u64(seed ^ (rank as u64) << 17),
            exiting: false,
        }
    }

    /// Arm the periodic timers and prime connectivity. Call once at startup.
    pub fn init(&mut self) -> Vec<Action> {
        let mut actions = vec![
            Action::SetTimer {
                id: TimerId::Watchdog,
                duration: self.config.watchdog_period(),
            },
            Action::SetTimer {
                id: TimerId::Compute,
                duration: self.config.compute_period(),
            },
            Action::SetTimer {
                id: TimerId::Balance,
                duration: self.config.balance_period(),
            },
        ];

        if self.config.derandomize && self.config.warmup {
            for _ in 0..5 {
                for &to in &self.bounce_alts {
                    actions.push(Action::SendTo {
                        to,
                        message: Message::Warmup,
                    });
                }
            }
        }
        actions
    }

    // ─── Accessors (used by tests and the runners) ───

    pub fn rank(&self) -> WorkerRank {
        self.rank
    }

    pub fn is_idle(&self) -> bool {
        self.load == 0
    }

    pub fn current_job(&self) -> Option<JobId> {
        self.current_job
    }

    pub fn job(&self, job_id: JobId) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    pub fn volume_of(&self, job_id: JobId) -> Option<u32> {
        self.balancer.volume_of(job_id)
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.epoch()
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting
    }

    pub(crate) fn has_commitments(&self) -> bool {
        !self.commitments.is_empty()
    }

    /// Flip the busy/idle load bit. The old and new values always differ
    /// (load transitions are write-once per change).
    pub(crate) fn set_load(&mut self, load: u32, job_id: JobId) {
        assert!(
            load + self.load == 1,
            "load transition must flip: {} -> {}",
            self.load,
            load
        );
        self.load = load;
        self.last_load_change = self.now;
        if load == 1 {
            debug_assert!(self.current_job.is_none());
            debug!(job = %job_id, "LOAD 1");
            self.current_job = Some(job_id);
        } else {
            debug_assert!(self.current_job.is_some());
            debug!(job = %job_id, "LOAD 0");
            self.current_job = None;
        }
    }

    /// Halt the whole fleet: broadcast EXIT to every peer, then stop this
    /// worker. Used by the global-timeout watchdog and as an operator hook;
    /// peers already exiting ignore the duplicate signals.
    pub fn request_fleet_shutdown(&mut self) -> Vec<Action> {
        self.exiting = true;
        let mut actions: Vec<Action> = (0..self.fleet_size)
            .filter(|&rank| rank != self.rank)
            .map(|rank| Action::SendTo {
                to: rank,
                message: Message::Exit,
            })
            .collect();
        actions.push(Action::Shutdown);
        actions
    }

    // ─── Watchdog ───

    fn on_watchdog(&mut self) -> Vec<Action> {
        let mut actions = vec![
            Action::SampleMemory,
            Action::SetTimer {
                id: TimerId::Watchdog,
                duration: self.config.watchdog_period(),
            },
        ];
        if self.config.global_timeout_secs > 0.0
            && self.now.as_secs_f64() > self.config.global_timeout_secs
        {
            info!("global timeout: halting the fleet");
            actions.extend(self.request_fleet_shutdown());
        }
        actions
    }

    fn on_memory_sampled(&mut self, resident_gb: f64) -> Vec<Action> {
        trace!(resident_gb, "memory sample");
        if self.config.memory_cap_gb <= 0.0 {
            return Vec::new();
        }
        if resident_gb > 0.9 * self.config.memory_cap_gb {
            if let Some(job_id) = self.pick_job_to_forget() {
                info!(job = %job_id, resident_gb, "memory pressure: forgetting description");
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.forget_description();
                }
            }
        }
        Vec::new()
    }

    /// A suspended or past non-root leaf with the largest serialized
    /// description; fall back to the current job if it is a non-root leaf.
    fn pick_job_to_forget(&self) -> Option<JobId> {
        let mut best: Option<(JobId, u64)> = None;
        for (&id, job) in &self.jobs {
            if !job.is_in_state(&[JobState::Suspended, JobState::Past]) {
                continue;
            }
            let Some(desc) = job.description() else {
                continue;
            };
            if job.is_root() || job.tree().has_left_child() || job.tree().has_right_child() {
                continue;
            }
            let size = desc.transfer_size();
            if best.map(|(_, s)| size > s).unwrap_or(true) {
                best = Some((id, size));
            }
        }
        if let Some((id, _)) = best {
            return Some(id);
        }

        let current = self.current_job?;
        let job = self.jobs.get(&current)?;
        if !job.is_root() && !job.tree().has_left_child() && !job.tree().has_right_child() {
            return Some(current);
        }
        None
    }

    // ─── Compute tick ───

    fn on_compute_tick(&mut self) -> Vec<Action> {
        let mut actions = vec![Action::SetTimer {
            id: TimerId::Compute,
            duration: self.config.compute_period(),
        }];

        if let Some(job_id) = self.current_job {
            let abort = self
                .jobs
                .get(&job_id)
                .map(|j| j.is_root())
                .unwrap_or(false)
                && self.check_computation_limits(job_id);
            if abort {
                actions.extend(self.timeout_job(job_id));
            } else {
                actions.extend(self.maybe_initiate_sharing(job_id));
            }
        }
        actions
    }

    /// CPU-seconds and wall-clock limits, checked at the root only.
    /// CPU time accrues as volume × threads × elapsed.
    fn check_computation_limits(&mut self, job_id: JobId) -> bool {
        let Some(job) = self.jobs.get(&job_id) else {
            return false;
        };
        if !job.is_root() {
            return false;
        }

        if !self.last_limit_check.contains_key(&job_id) || !self.cpu_time_used.contains_key(&job_id)
        {
            self.last_limit_check.insert(job_id, self.now);
            self.cpu_time_used.insert(job_id, 0.0);
            return false;
        }

        let elapsed = self
            .now
            .saturating_sub(self.last_limit_check[&job_id])
            .as_secs_f64();
        let volume = self.volumes.get(&job_id).copied().unwrap_or(1) as f64;
        let new_cpu_time = volume * self.config.threads_per_job as f64 * elapsed;
        let used = self.cpu_time_used.entry(job_id).or_insert(0.0);
        *used += new_cpu_time;

        let mut terminate = false;
        if self.config.cpu_limit_secs > 0.0 && *used > self.config.cpu_limit_secs {
            info!(job = %job_id, used = *used, "CPU limit exceeded: aborting");
            terminate = true;
        } else if self.config.wallclock_limit_secs > 0.0
            && job.age(self.now) > self.config.wallclock_limit_secs
        {
            info!(job = %job_id, age = job.age(self.now), "wall-clock limit exceeded: aborting");
            terminate = true;
        }

        if terminate {
            self.last_limit_check.remove(&job_id);
        } else {
            self.last_limit_check.insert(job_id, self.now);
        }
        terminate
    }

    // ─── Balancing drive ───

    fn on_balance_timer(&mut self) -> Vec<Action> {
        let mut actions = vec![Action::SetTimer {
            id: TimerId::Balance,
            duration: self.config.balance_period(),
        }];
        if self.balancer.is_balancing() {
            // The epoch's collectives are still in flight; advance any step
            // that is ready without a new message.
            if self.balancer.can_continue() {
                let outcome = self.balancer.advance();
                actions.extend(outcome.actions);
                if outcome.done {
                    actions.extend(self.finish_balancing());
                }
            }
            return actions;
        }
        if self.epoch.seconds_since_last_sync(self.now) < self.config.balance_period {
            return actions;
        }
        actions.extend(self.rebalance());
        actions
    }

    pub(crate) fn rebalance(&mut self) -> Vec<Action> {
        let input = self.build_balance_input();
        let outcome = self.balancer.begin(self.now, input);
        let mut actions = outcome.actions;
        if outcome.done {
            actions.extend(self.finish_balancing());
        }
        actions
    }

    fn build_balance_input(&mut self) -> BalanceInput {
        let mut input = BalanceInput::default();
        for (&id, job) in &self.jobs {
            // Only roots contribute demand and priority, and only once they
            // are active (or initializing with the description present).
            let participates = job.is_root()
                && job.is_in_state(&[JobState::Active])
                && (!job.is_initializing() || job.has_description());
            let is_active_root = job.is_root() && job.is_in_state(&[JobState::Active]);
            if participates {
                let prev = self.balancer.volume_of(id).unwrap_or(1);
                input.jobs.push(BalanceJob {
                    job_id: id,
                    demand: job.demand(prev, self.now).max(1),
                    priority: job.priority(),
                });
                input.active_jobs += 1;
            } else if is_active_root {
                // Cannot participate yet: an implicit demand of one.
                input.active_jobs += 1;
            }
            if job.is_in_state(&[JobState::Active]) {
                input.busy = true;
            }
        }
        input
    }

    pub(crate) fn finish_balancing(&mut self) -> Vec<Action> {
        self.epoch.reset_last_sync(self.now);
        let result = self.balancer.result();
        self.epoch.increment();
        trace!(epoch = self.epoch.epoch(), "advancing to next balancing epoch");

        let mut actions = Vec::new();
        for (&job_id, &volume) in &result {
            self.volumes.insert(job_id, volume);
        }
        for (job_id, volume) in result {
            if self
                .jobs
                .get(&job_id)
                .map(|j| j.last_volume() != volume)
                .unwrap_or(false)
            {
                info!(job = %job_id, volume, "volume update");
            }
            actions.extend(self.apply_volume(job_id, volume));
        }
        actions
    }

    // ─── Message dispatch ───

    fn on_message(&mut self, from: WorkerRank, message: Message) -> Vec<Action> {
        trace!(from, tag = message.tag(), "dispatching message");

        if message.is_balancer_traffic() {
            let outcome = self.balancer.handle_message(from, &message);
            let mut actions = outcome.actions;
            if outcome.done {
                actions.extend(self.finish_balancing());
            }
            return actions;
        }

        match message {
            Message::FindNode(req) => self.handle_find_node(from, req),
            Message::RequestBecomeChild(req) => self.handle_request_become_child(from, req),
            Message::AcceptBecomeChild(sig) => self.handle_accept_become_child(from, sig),
            Message::RejectBecomeChild(req) => self.handle_reject_become_child(from, req),
            Message::AckAcceptBecomeChild(req) => self.handle_ack_accept_become_child(from, req),
            Message::SendJobDescription { job_id, data } => {
                self.handle_send_description(from, job_id, data)
            }
            Message::UpdateVolume { job_id, volume } => {
                self.handle_update_volume(from, job_id, volume)
            }
            Message::QueryVolume { job_id } => self.handle_query_volume(from, job_id),
            Message::WorkerDefecting { job_id, index } => {
                self.handle_worker_defecting(from, job_id, index)
            }
            Message::JobCommunication(msg) => self.handle_job_communication(from, msg),
            Message::WorkerFoundResult {
                job_id,
                revision,
                result,
            } => self.handle_worker_found_result(from, job_id, revision, result),
            Message::ForwardClientRank {
                job_id,
                client_rank,
            } => self.handle_forward_client_rank(job_id, client_rank),
            Message::QueryJobResult { job_id } => self.handle_query_job_result(from, job_id),
            Message::SendJobResult(result) => {
                vec![Action::EmitJobResult { result }]
            }
            Message::Terminate { job_id } => self.interrupt_job(job_id, true, false),
            Message::Interrupt { job_id } => self.interrupt_job(job_id, false, false),
            Message::Abort { job_id } => self.handle_abort(job_id),
            Message::Warmup => {
                trace!(from, "warmup message");
                Vec::new()
            }
            Message::Exit => {
                debug!(from, "received exit signal");
                self.exiting = true;
                vec![Action::Shutdown]
            }
            Message::Collective { .. }
            | Message::AnytimeReduction { .. }
            | Message::AnytimeBroadcast { .. } => unreachable!("routed to the balancer above"),
        }
    }
}

impl StateMachine for WorkerState {
    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn handle(&mut self, event: Event) -> Vec<Action> {
        if self.exiting {
            return Vec::new();
        }
        match event {
            Event::WatchdogTimer => self.on_watchdog(),
            Event::MemorySampled { resident_gb } => self.on_memory_sampled(resident_gb),
            Event::ComputeTimer => self.on_compute_tick(),
            Event::BalanceTimer => self.on_balance_timer(),
            Event::MessageReceived { from, message } => self.on_message(from, message),
            Event::SolverStarted { job_id } => self.on_solver_started(job_id),
            Event::SolverResult {
                job_id,
                revision,
                result,
                solution,
            } => self.on_solver_result(job_id, revision, result, solution),
            Event::SharingPrepared { job_id, buffer } => self.on_sharing_prepared(job_id, buffer),
            Event::SubmitJob {
                description,
                client_rank,
            } => self.on_submit_job(description, client_rank),
        }
    }
}

impl WorkerState {
    /// Create the local job entry for a newly encountered job id.
    pub(crate) fn create_job(&mut self, job_id: JobId) -> &mut Job {
        let job = Job::new(
            job_id,
            self.fleet_size,
            self.rank,
            self.now,
            self.config.growth_period,
            self.config.continuous_growth,
            self.config.max_demand,
            self.config.threads_per_job,
        );
        self.jobs.entry(job_id).or_insert(job)
    }

    /// Log-and-drop guard for messages about unknown jobs.
    pub(crate) fn known_job(&mut self, job_id: JobId, context: &str) -> bool {
        if self.jobs.contains_key(&job_id) {
            true
        } else {
            warn!(job = %job_id, context, "message about unknown job");
            false
        }
    }
}
