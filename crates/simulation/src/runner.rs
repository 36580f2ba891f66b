//! Deterministic simulation runner.
//!
//! Owns a fleet of worker state machines, a global ordered event queue, the
//! simulated network, and the scripted solver pool. Actions execute inline;
//! given the same seed and scripts the run is bit-for-bit reproducible.

use crate::event_queue::EventKey;
use crate::network::{NetworkConfig, SimulatedNetwork};
use crate::solver_pool::{SolverPool, SolverScript, SolverSimState};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use satswarm_core::{Action, Event, StateMachine, TimerId};
use satswarm_job::JobState;
use satswarm_messages::Message;
use satswarm_types::{JobDescription, JobId, JobResult, TreeIndex};
use satswarm_worker::{WorkerConfig, WorkerState};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, trace};

pub use crate::event_queue::NodeIndex;

/// Configuration of one simulated fleet.
#[derive(Debug, Clone, Default)]
pub struct SimulationConfig {
    pub fleet_size: u32,
    pub network: NetworkConfig,
    pub worker: WorkerConfig,
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulationStats {
    pub events_processed: u64,
    pub actions_generated: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub timers_set: u64,
    pub timers_cancelled: u64,
}

/// Deterministic simulation runner.
pub struct SimulationRunner {
    workers: Vec<WorkerState>,
    event_queue: BTreeMap<EventKey, Event>,
    sequence: u64,
    now: Duration,
    network: SimulatedNetwork,
    rng: ChaCha8Rng,
    /// Timer registry for cancellation: (node, timer) -> queued key.
    timers: HashMap<(NodeIndex, TimerId), EventKey>,
    solvers: SolverPool,
    stats: SimulationStats,
    /// Nodes that executed `Action::Shutdown`.
    halted: HashSet<NodeIndex>,
    /// Results delivered to client-side introducers.
    results: Vec<(NodeIndex, JobResult)>,
    /// Jobs whose abort was surfaced to the client side.
    aborted: HashSet<JobId>,
}

impl SimulationRunner {
    pub fn new(config: SimulationConfig, seed: u64) -> Self {
        let network = SimulatedNetwork::new(config.network.clone());
        let rng = ChaCha8Rng::seed_from_u64(seed);

        let workers: Vec<WorkerState> = (0..config.fleet_size)
            .map(|rank| {
                WorkerState::new(
                    rank,
                    config.fleet_size,
                    config.worker.clone(),
                    seed.wrapping_add(rank as u64).wrapping_mul(0x517cc1b727220a95),
                )
            })
            .collect();

        info!(fleet_size = config.fleet_size, seed, "created simulation runner");

        let mut runner = Self {
            workers,
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            network,
            rng,
            timers: HashMap::new(),
            solvers: SolverPool::default(),
            stats: SimulationStats::default(),
            halted: HashSet::new(),
            results: Vec::new(),
            aborted: HashSet::new(),
        };

        // Arm every worker's periodic timers (and warmup traffic).
        for rank in 0..runner.workers.len() as NodeIndex {
            let actions = runner.workers[rank as usize].init();
            for action in actions {
                runner.process_action(rank, action);
            }
        }
        runner
    }

    // ─── Test and client-side hooks ───

    /// Script the solver behavior for a job (defaults: quick init, no
    /// verdict, empty clause exports).
    pub fn script_solver(&mut self, job_id: JobId, script: SolverScript) {
        self.solvers.script(job_id, script);
    }

    /// Submit a job to a worker, making it the introducer.
    pub fn submit_job(&mut self, node: NodeIndex, description: JobDescription) {
        let event = Event::SubmitJob {
            description,
            client_rank: node,
        };
        self.schedule_event(node, self.now, event);
    }

    /// Make a fragment voluntarily defect (simulates a departing worker).
    pub fn defect(&mut self, node: NodeIndex, job_id: JobId) {
        let actions = self.workers[node as usize].defect(job_id);
        for action in actions {
            self.process_action(node, action);
        }
    }

    /// Operator hook: have one worker broadcast the fleet-wide EXIT.
    pub fn shutdown_fleet(&mut self, node: NodeIndex) {
        let actions = self.workers[node as usize].request_fleet_shutdown();
        for action in actions {
            self.process_action(node, action);
        }
    }

    pub fn worker(&self, node: NodeIndex) -> &WorkerState {
        &self.workers[node as usize]
    }

    pub fn fleet_size(&self) -> u32 {
        self.workers.len() as u32
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    pub fn solvers(&self) -> &SolverPool {
        &self.solvers
    }

    /// Results that reached a client-side introducer.
    pub fn results(&self) -> &[(NodeIndex, JobResult)] {
        &self.results
    }

    pub fn result_of(&self, job_id: JobId) -> Option<&JobResult> {
        self.results
            .iter()
            .find(|(_, r)| r.job_id == job_id)
            .map(|(_, r)| r)
    }

    pub fn was_aborted(&self, job_id: JobId) -> bool {
        self.aborted.contains(&job_id)
    }

    /// All (node, tree index) pairs hosting an ACTIVE fragment of a job.
    pub fn active_fragments(&self, job_id: JobId) -> Vec<(NodeIndex, TreeIndex)> {
        self.fragments_in_states(job_id, &[JobState::Active])
    }

    /// All (node, tree index) pairs hosting an ACTIVE or SUSPENDED fragment.
    pub fn live_fragments(&self, job_id: JobId) -> Vec<(NodeIndex, TreeIndex)> {
        self.fragments_in_states(job_id, &[JobState::Active, JobState::Suspended])
    }

    fn fragments_in_states(
        &self,
        job_id: JobId,
        states: &[JobState],
    ) -> Vec<(NodeIndex, TreeIndex)> {
        let mut fragments = Vec::new();
        for (rank, worker) in self.workers.iter().enumerate() {
            if let Some(job) = worker.job(job_id) {
                if states.contains(&job.state()) {
                    fragments.push((rank as NodeIndex, job.tree().index()));
                }
            }
        }
        fragments.sort();
        fragments
    }

    /// Whether the ACTIVE fragments of a job form a prefix-connected subtree
    /// rooted at index 0.
    pub fn tree_is_connected(&self, job_id: JobId) -> bool {
        let indices: HashSet<TreeIndex> = self
            .active_fragments(job_id)
            .into_iter()
            .map(|(_, idx)| idx)
            .collect();
        indices
            .iter()
            .all(|&idx| idx == 0 || indices.contains(&((idx - 1) / 2)))
    }

    // ─── Main loop ───

    /// Run the simulation until the queue drains or `end_time` is reached.
    pub fn run_until(&mut self, end_time: Duration) {
        while let Some((&key, _)) = self.event_queue.first_key_value() {
            if key.time > end_time {
                break;
            }
            let (key, event) = self.event_queue.pop_first().expect("peeked above");
            self.now = key.time;
            let node = key.node;

            if self.halted.contains(&node) {
                continue;
            }
            if !self.admit_solver_event(node, &event) {
                continue;
            }

            self.stats.events_processed += 1;
            trace!(time = ?self.now, node, event = event.type_name(), "processing event");

            let worker = &mut self.workers[node as usize];
            worker.set_time(self.now);
            let actions = worker.handle(event);
            self.stats.actions_generated += actions.len() as u64;

            for action in actions {
                self.process_action(node, action);
            }
        }
        self.now = self.now.max(end_time);
    }

    /// Solver callbacks only reach the worker while the simulated solver
    /// instance is still in the matching state.
    fn admit_solver_event(&mut self, node: NodeIndex, event: &Event) -> bool {
        match event {
            Event::SolverStarted { job_id } => {
                if self.solvers.state(node, *job_id) == Some(SolverSimState::Initializing) {
                    self.solvers.set_state(node, *job_id, SolverSimState::Running);
                    true
                } else {
                    false
                }
            }
            Event::SolverResult { job_id, .. } => self.solvers.is_running(node, *job_id),
            _ => true,
        }
    }

    fn process_action(&mut self, from: NodeIndex, action: Action) {
        match action {
            Action::SendTo { to, message } => {
                // Self-sends bypass the network.
                if to == from {
                    let event = Event::MessageReceived { from, message };
                    self.schedule_event(to, self.now, event);
                    self.stats.messages_sent += 1;
                    return;
                }
                match self.network.should_deliver(from, to, &mut self.rng) {
                    Some(latency) => {
                        let event = Event::MessageReceived { from, message };
                        self.schedule_event(to, self.now + latency, event);
                        self.stats.messages_sent += 1;
                    }
                    None => {
                        trace!(from, to, "message dropped");
                        self.stats.messages_dropped += 1;
                    }
                }
            }

            Action::SetTimer { id, duration } => {
                let event = timer_to_event(id);
                let key = self.schedule_event(from, self.now + duration, event);
                self.timers.insert((from, id), key);
                self.stats.timers_set += 1;
            }

            Action::CancelTimer { id } => {
                if let Some(key) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&key);
                    self.stats.timers_cancelled += 1;
                }
            }

            Action::EnqueueInternal { event } => {
                self.schedule_event(from, self.now, event);
            }

            // ── Solver commands (instant and scripted in simulation) ──
            Action::StartSolver { job_id, .. } => {
                let script = self.solvers.script_of(job_id);
                self.solvers
                    .set_state(from, job_id, SolverSimState::Initializing);
                self.schedule_event(
                    from,
                    self.now + script.init_delay,
                    Event::SolverStarted { job_id },
                );
                if let Some((delay, code, solution)) = script.verdict {
                    let revision = self.workers[from as usize]
                        .job(job_id)
                        .map(|j| j.revision())
                        .unwrap_or(0);
                    self.schedule_event(
                        from,
                        self.now + script.init_delay + delay,
                        Event::SolverResult {
                            job_id,
                            revision,
                            result: code,
                            solution,
                        },
                    );
                }
            }
            Action::SuspendSolver { job_id } => {
                self.solvers
                    .set_state(from, job_id, SolverSimState::Suspended);
            }
            Action::ResumeSolver { job_id } => {
                self.solvers.set_state(from, job_id, SolverSimState::Running);
            }
            Action::InterruptSolver { job_id } => {
                self.solvers
                    .set_state(from, job_id, SolverSimState::Interrupted);
            }
            Action::TerminateSolver { job_id } => {
                self.solvers.remove(from, job_id);
            }
            Action::PrepareSharing { job_id, .. } => {
                let buffer = self.solvers.script_of(job_id).export;
                self.schedule_event(from, self.now, Event::SharingPrepared { job_id, buffer });
            }
            Action::DigestSharing { job_id, .. } => {
                self.solvers.record_digest(from, job_id);
            }

            Action::SampleMemory => {
                // Simulated processes stay small.
                self.schedule_event(
                    from,
                    self.now,
                    Event::MemorySampled { resident_gb: 0.05 },
                );
            }

            // ── Client side ──
            Action::EmitJobDone {
                job_id,
                client_rank,
                transfer_size,
            } => {
                debug!(job = %job_id, client_rank, transfer_size, "job done, client queries result");
                // The client side reacts by querying the full result.
                let latency = self.network.sample_latency(&mut self.rng);
                self.schedule_event(
                    from,
                    self.now + latency,
                    Event::MessageReceived {
                        from: client_rank,
                        message: Message::QueryJobResult { job_id },
                    },
                );
            }
            Action::EmitJobResult { result } => {
                info!(job = %result.job_id, code = ?result.code, "result delivered to client");
                self.results.push((from, result));
            }
            Action::EmitJobAborted { job_id } => {
                info!(job = %job_id, "job aborted");
                self.aborted.insert(job_id);
            }

            Action::Shutdown => {
                debug!(node = from, "worker halted");
                self.halted.insert(from);
            }
        }
    }

    fn schedule_event(&mut self, node: NodeIndex, time: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, &event, node, self.sequence);
        self.event_queue.insert(key, event);
        key
    }
}

fn timer_to_event(id: TimerId) -> Event {
    match id {
        TimerId::Watchdog => Event::WatchdogTimer,
        TimerId::Compute => Event::ComputeTimer,
        TimerId::Balance => Event::BalanceTimer,
    }
}
