//! The cutoff-priority balancer: periodic, four collective phases.

use crate::alloc::{adjust_assignments, PriorityHistogram};
use crate::balancer::{BalanceInput, BalanceOutcome, Balancer, RoundingMode};
use crate::reduce::{AllReduce, FloatVec, Reduceable, SortedRemainders};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use satswarm_core::Action;
use satswarm_messages::Message;
use satswarm_types::{JobId, WorkerRank};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tracing::{debug, trace};

/// Balancing phases, entered strictly in order. Remainder phases only run
/// under bisection rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    InitialDemand,
    ReduceResources,
    BroadcastResources,
    ReduceRemainders,
    BroadcastRemainders,
    GlobalRounding,
}

impl Stage {
    /// Collective tag: both halves of one all-reduce share a tag.
    fn tag(&self) -> u8 {
        match self {
            Stage::InitialDemand => 0,
            Stage::ReduceResources | Stage::BroadcastResources => 1,
            Stage::ReduceRemainders | Stage::BroadcastRemainders => 2,
            Stage::GlobalRounding => 3,
        }
    }
}

/// One phase-tagged collective payload. The sequence number separates
/// successive rounding iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectiveFrame {
    stage: u8,
    seq: u32,
    payload: Vec<u8>,
}

/// Fleet-wide resource aggregates: total fractionally assigned resources plus
/// per-priority-class still-demanded resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ResourcesInfo {
    assigned_resources: f64,
    /// (priority, demanded) per distinct priority, descending.
    classes: Vec<(f32, f64)>,
}

impl Reduceable for ResourcesInfo {
    fn merge(&mut self, other: &Self) {
        self.assigned_resources += other.assigned_resources;
        let mut merged: Vec<(f32, f64)> = Vec::with_capacity(self.classes.len());
        let (mut i, mut j) = (0, 0);
        while i < self.classes.len() || j < other.classes.len() {
            if i < self.classes.len() && j < other.classes.len() {
                let (pa, da) = self.classes[i];
                let (pb, db) = other.classes[j];
                if pa == pb {
                    merged.push((pa, da + db));
                    i += 1;
                    j += 1;
                } else if pa > pb {
                    merged.push((pa, da));
                    i += 1;
                } else {
                    merged.push((pb, db));
                    j += 1;
                }
            } else if i < self.classes.len() {
                merged.push(self.classes[i]);
                i += 1;
            } else {
                merged.push(other.classes[j]);
                j += 1;
            }
        }
        self.classes = merged;
    }

    fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct BestRounding {
    idx: i64,
    utilization: f64,
    diff: f64,
}

/// Periodic balancer: initial demand all-reduce, resource histogram
/// reduction, priority-class adjustment, and global rounding.
pub struct CutoffPriorityBalancer {
    rank: WorkerRank,
    size: u32,
    load_factor: f64,
    rounding_mode: RoundingMode,
    rng: ChaCha8Rng,

    balancing: bool,
    stage: Stage,

    demands: BTreeMap<JobId, u32>,
    priorities: BTreeMap<JobId, f32>,
    assignments: BTreeMap<JobId, f64>,
    total_avail_volume: f64,

    demand_allreduce: Option<AllReduce<FloatVec>>,
    resources_allreduce: Option<AllReduce<ResourcesInfo>>,
    remainders_allreduce: Option<AllReduce<SortedRemainders>>,
    utilization_allreduce: Option<AllReduce<FloatVec>>,

    remainders: SortedRemainders,
    lower_idx: i64,
    upper_idx: i64,
    rounding_iterations: u32,
    rounding_seq: u32,
    last_utilization: f64,
    best: Option<BestRounding>,

    /// Volumes known to this worker, merged across epochs and peer updates.
    volumes: BTreeMap<JobId, u32>,

    /// Frames that arrived ahead of this worker's phase; the posted-receive
    /// discipline of the collectives means they match a later phase exactly.
    inbox: VecDeque<(WorkerRank, CollectiveFrame)>,
}

impl CutoffPriorityBalancer {
    pub fn new(
        rank: WorkerRank,
        size: u32,
        load_factor: f64,
        rounding_mode: RoundingMode,
        seed: u64,
    ) -> Self {
        Self {
            rank,
            size,
            load_factor,
            rounding_mode,
            rng: ChaCha8Rng::seed_from_u64(seed ^ 0xba1a),
            balancing: false,
            stage: Stage::InitialDemand,
            demands: BTreeMap::new(),
            priorities: BTreeMap::new(),
            assignments: BTreeMap::new(),
            total_avail_volume: 0.0,
            demand_allreduce: None,
            resources_allreduce: None,
            remainders_allreduce: None,
            utilization_allreduce: None,
            remainders: SortedRemainders::default(),
            lower_idx: 0,
            upper_idx: 0,
            rounding_iterations: 0,
            rounding_seq: 0,
            last_utilization: 0.0,
            best: None,
            volumes: BTreeMap::new(),
            inbox: VecDeque::new(),
        }
    }

    fn target_utilization(&self) -> f64 {
        self.size as f64 * self.load_factor
    }

    fn wrap_sends(&self, sends: Vec<(u32, Vec<u8>)>, stage: Stage, seq: u32) -> Vec<Action> {
        sends
            .into_iter()
            .map(|(to, payload)| Action::SendTo {
                to,
                message: Message::Collective {
                    payload: bincode::serialize(&CollectiveFrame {
                        stage: stage.tag(),
                        seq,
                        payload,
                    })
                    .expect("collective frames are well-formed"),
                },
            })
            .collect()
    }

    /// Deliver every buffered frame that matches the current phase; each
    /// delivery may advance the phase, so rescan until quiescent.
    fn process_inbox(&mut self, actions: &mut Vec<Action>) -> bool {
        loop {
            let expected_tag = self.stage.tag();
            let expected_seq = if self.stage == Stage::GlobalRounding {
                self.rounding_seq
            } else {
                0
            };
            let pos = self
                .inbox
                .iter()
                .position(|(_, f)| f.stage == expected_tag && f.seq == expected_seq);
            let Some(pos) = pos else {
                return false;
            };
            let (from, frame) = self.inbox.remove(pos).unwrap();
            if self.deliver(from, frame, actions) {
                return true;
            }
        }
    }

    /// Feed one matching frame into the active collective. Returns true when
    /// the whole balancing epoch finished.
    fn deliver(&mut self, from: WorkerRank, frame: CollectiveFrame, actions: &mut Vec<Action>) -> bool {
        match self.stage {
            Stage::InitialDemand => {
                let ar = self.demand_allreduce.as_mut().expect("allreduce in flight");
                let (done, sends) = ar.handle(from, &frame.payload);
                actions.extend(self.wrap_sends(sends, Stage::InitialDemand, 0));
                if done {
                    return self.finish_initial_demand(actions);
                }
                false
            }
            Stage::ReduceResources | Stage::BroadcastResources => {
                let ar = self
                    .resources_allreduce
                    .as_mut()
                    .expect("allreduce in flight");
                let (done, sends) = ar.handle(from, &frame.payload);
                if ar.is_broadcasting() {
                    self.stage = Stage::BroadcastResources;
                }
                actions.extend(self.wrap_sends(sends, Stage::ReduceResources, 0));
                if done {
                    return self.finish_resources(actions);
                }
                false
            }
            Stage::ReduceRemainders | Stage::BroadcastRemainders => {
                let ar = self
                    .remainders_allreduce
                    .as_mut()
                    .expect("allreduce in flight");
                let (done, sends) = ar.handle(from, &frame.payload);
                if ar.is_broadcasting() {
                    self.stage = Stage::BroadcastRemainders;
                }
                actions.extend(self.wrap_sends(sends, Stage::ReduceRemainders, 0));
                if done {
                    return self.finish_remainders(actions);
                }
                false
            }
            Stage::GlobalRounding => {
                let ar = self
                    .utilization_allreduce
                    .as_mut()
                    .expect("allreduce in flight");
                let (done, sends) = ar.handle(from, &frame.payload);
                let seq = self.rounding_seq;
                actions.extend(self.wrap_sends(sends, Stage::GlobalRounding, seq));
                if done {
                    return self.finish_rounding_iteration(actions);
                }
                false
            }
        }
    }

    fn finish_initial_demand(&mut self, actions: &mut Vec<Action>) -> bool {
        let data = self
            .demand_allreduce
            .take()
            .expect("allreduce in flight")
            .data()
            .0
            .clone();
        let aggregated_demand = data[0];
        let busy_nodes = data[1];
        let num_jobs = data[2];
        debug!(
            aggregated_demand,
            busy_nodes, num_jobs, "initial demand reduction complete"
        );

        // The total available volume with each job's atomic demand already
        // subtracted.
        self.total_avail_volume = self.target_utilization() - num_jobs;

        let mut info = ResourcesInfo::default();
        let mut classes: BTreeMap<u64, (f32, f64)> = BTreeMap::new();
        for (&job_id, &demand) in &self.demands {
            let priority = self.priorities[&job_id] as f64;
            let remaining_demand = (demand - 1) as f64;
            let met_ratio = if aggregated_demand > 0.0 {
                (self.total_avail_volume * priority / aggregated_demand).min(1.0)
            } else {
                1.0
            };
            let assignment = 1.0 + met_ratio * remaining_demand;
            trace!(job = %job_id, assignment, "initial assignment");
            self.assignments.insert(job_id, assignment);

            info.assigned_resources += assignment - 1.0;
            let key = (self.priorities[&job_id].to_bits() as u64) ^ u64::MAX;
            let entry = classes
                .entry(key)
                .or_insert((self.priorities[&job_id], 0.0));
            entry.1 += demand as f64 - assignment;
        }
        // Descending priority order (positive floats sort by bit pattern).
        info.classes = classes.into_values().collect();

        let (ar, done, sends) = AllReduce::start(
            self.rank,
            self.size,
            info,
            std::collections::BTreeSet::new(),
            true,
        );
        self.stage = Stage::ReduceResources;
        self.resources_allreduce = Some(ar);
        actions.extend(self.wrap_sends(sends, Stage::ReduceResources, 0));
        if done {
            return self.finish_resources(actions);
        }
        false
    }

    fn finish_resources(&mut self, actions: &mut Vec<Action>) -> bool {
        let ar = self
            .resources_allreduce
            .take()
            .expect("allreduce in flight");
        let excluded = ar.excluded().clone();
        let info = ar.data().clone();

        if excluded.contains(&self.rank) && self.rounding_mode == RoundingMode::Probabilistic {
            // No contribution of our own: nothing to round locally.
            debug!("excluded from balancing, finishing early");
            self.assignments.clear();
            self.balancing = false;
            return true;
        }

        let mut remaining = self.total_avail_volume - info.assigned_resources;
        if remaining < 0.1 {
            // Too low a remainder to make a difference
            remaining = 0.0;
        }
        debug!(remaining, "adjusting assignments");

        let histogram = PriorityHistogram::from_classes(info.classes.clone());
        adjust_assignments(
            &mut self.assignments,
            &self.demands,
            &self.priorities,
            &histogram,
            remaining,
        );

        match self.rounding_mode {
            RoundingMode::Probabilistic => {
                self.balancing = false;
                true
            }
            RoundingMode::Bisection => {
                let mut local = SortedRemainders::default();
                for assignment in self.assignments.values() {
                    let remainder = assignment - assignment.floor();
                    if remainder > 0.0 && remainder < 1.0 {
                        local.add(remainder);
                    }
                }
                self.last_utilization = 0.0;
                self.best = None;

                let (ar, done, sends) =
                    AllReduce::start(self.rank, self.size, local, excluded, true);
                self.stage = Stage::ReduceRemainders;
                self.remainders_allreduce = Some(ar);
                actions.extend(self.wrap_sends(sends, Stage::ReduceRemainders, 0));
                if done {
                    return self.finish_remainders(actions);
                }
                false
            }
        }
    }

    fn finish_remainders(&mut self, actions: &mut Vec<Action>) -> bool {
        let ar = self
            .remainders_allreduce
            .take()
            .expect("allreduce in flight");
        self.remainders = ar.data().clone();
        trace!(remainders = ?self.remainders.0, "rounding remainders");
        self.stage = Stage::GlobalRounding;
        self.lower_idx = 0;
        self.upper_idx = self.remainders.len() as i64;
        self.start_rounding_iteration(actions)
    }

    fn threshold(&self, idx: i64) -> f64 {
        if idx >= 0 && (idx as usize) < self.remainders.len() {
            self.remainders.0[idx as usize]
        } else {
            1.0
        }
    }

    /// Round every local assignment against the remainder at `idx`.
    fn rounded_assignments(&self, idx: i64) -> (BTreeMap<JobId, u32>, u64) {
        let threshold = self.threshold(idx);
        let mut rounded = BTreeMap::new();
        let mut sum = 0u64;
        for (&job_id, &assignment) in &self.assignments {
            let remainder = assignment - assignment.floor();
            let value = if remainder < threshold {
                assignment.floor() as u32
            } else {
                assignment.ceil() as u32
            };
            rounded.insert(job_id, value);
            sum += value as u64;
        }
        (rounded, sum)
    }

    fn start_rounding_iteration(&mut self, actions: &mut Vec<Action>) -> bool {
        let idx = (self.lower_idx + self.upper_idx) / 2;
        let (_, local_sum) = self.rounded_assignments(idx);

        self.rounding_seq += 1;
        let seq = self.rounding_seq;
        let (ar, done, sends) = AllReduce::start(
            self.rank,
            self.size,
            FloatVec(vec![local_sum as f64]),
            std::collections::BTreeSet::new(),
            false,
        );
        self.utilization_allreduce = Some(ar);
        actions.extend(self.wrap_sends(sends, Stage::GlobalRounding, seq));
        if done {
            return self.finish_rounding_iteration(actions);
        }
        false
    }

    fn finish_rounding_iteration(&mut self, actions: &mut Vec<Action>) -> bool {
        let utilization = self
            .utilization_allreduce
            .take()
            .expect("allreduce in flight")
            .data()
            .0[0];
        self.rounding_iterations += 1;
        let diff_to_optimum = self.target_utilization() - utilization;
        let idx = (self.lower_idx + self.upper_idx) / 2;

        // Keep the best result so far: the first one, the first
        // not-oversubscribing one, a less-oversubscribing one, or a
        // not-oversubscribing one with lower absolute error.
        let replace = match self.best {
            None => true,
            Some(best) => {
                (diff_to_optimum > -1.0 && best.diff <= -1.0)
                    || (diff_to_optimum <= -1.0
                        && best.diff <= -1.0
                        && diff_to_optimum > best.diff)
                    || (diff_to_optimum > -1.0 && diff_to_optimum.abs() < best.diff.abs())
            }
        };
        if replace {
            self.best = Some(BestRounding {
                idx,
                utilization,
                diff: diff_to_optimum,
            });
        }

        trace!(
            it = self.rounding_iterations,
            lower = self.lower_idx,
            upper = self.upper_idx,
            idx,
            utilization,
            err = diff_to_optimum,
            "rounding iteration"
        );

        if utilization == self.last_utilization {
            // Two consecutive iterations agree: done.
            if let Some(best) = self.best {
                if !self.remainders.0.is_empty() && best.idx <= self.remainders.len() as i64 {
                    let (rounded, _) = self.rounded_assignments(best.idx);
                    for (job_id, value) in rounded {
                        self.assignments.insert(job_id, value as f64);
                    }
                    debug!(
                        its = self.rounding_iterations,
                        utilization = best.utilization,
                        err = best.diff,
                        "rounding done"
                    );
                }
            }
            self.best = None;
            self.rounding_iterations = 0;
            self.balancing = false;
            return true;
        }

        if self.lower_idx < self.upper_idx {
            if utilization < self.target_utilization() {
                // Too few resources utilized
                self.upper_idx = idx - 1;
            }
            if utilization > self.target_utilization() {
                // Too many resources utilized
                self.lower_idx = idx + 1;
            }
        }
        self.last_utilization = utilization;
        self.start_rounding_iteration(actions)
    }
}

impl Balancer for CutoffPriorityBalancer {
    fn begin(&mut self, _now: Duration, input: BalanceInput) -> BalanceOutcome {
        debug_assert!(!self.balancing, "one balancing activity at a time");
        self.assignments.clear();
        self.demands.clear();
        self.priorities.clear();
        self.remainders = SortedRemainders::default();
        self.rounding_seq = 0;
        self.stage = Stage::InitialDemand;
        self.balancing = true;

        let mut aggregated_demand = 0.0f64;
        for job in &input.jobs {
            self.demands.insert(job.job_id, job.demand.max(1));
            self.priorities.insert(job.job_id, job.priority);
            aggregated_demand += (job.demand.max(1) - 1) as f64 * job.priority as f64;
            debug!(job = %job.job_id, demand = job.demand, "balancing demand");
        }

        let contribution = FloatVec(vec![
            aggregated_demand,
            if input.busy { 1.0 } else { 0.0 },
            input.active_jobs as f64,
        ]);
        let (ar, done, sends) = AllReduce::start(
            self.rank,
            self.size,
            contribution,
            std::collections::BTreeSet::new(),
            false,
        );
        self.demand_allreduce = Some(ar);
        let mut actions = self.wrap_sends(sends, Stage::InitialDemand, 0);

        let mut finished = false;
        if done {
            finished = self.finish_initial_demand(&mut actions);
        }
        if !finished {
            finished = self.process_inbox(&mut actions);
        }
        BalanceOutcome {
            done: finished,
            actions,
        }
    }

    fn is_balancing(&self) -> bool {
        self.balancing
    }

    fn can_continue(&self) -> bool {
        false
    }

    fn advance(&mut self) -> BalanceOutcome {
        BalanceOutcome::default()
    }

    fn handle_message(&mut self, from: WorkerRank, message: &Message) -> BalanceOutcome {
        let Message::Collective { payload } = message else {
            return BalanceOutcome::default();
        };
        let Ok(frame) = bincode::deserialize::<CollectiveFrame>(payload) else {
            tracing::error!(from, "malformed collective frame");
            return BalanceOutcome::default();
        };
        self.inbox.push_back((from, frame));
        if !self.balancing {
            // Stale traffic from a previous epoch's stragglers.
            return BalanceOutcome::default();
        }
        let mut actions = Vec::new();
        let done = self.process_inbox(&mut actions);
        BalanceOutcome { done, actions }
    }

    fn result(&mut self) -> BTreeMap<JobId, u32> {
        let mut volumes = BTreeMap::new();
        for (&job_id, &assignment) in &self.assignments {
            let assignment = assignment.max(1.0);
            // Probabilistic rounding; identity for the integral assignments
            // bisection leaves behind.
            let floor = assignment.floor();
            let frac = assignment - floor;
            let volume = if self.rng.gen::<f64>() < frac {
                floor as u32 + 1
            } else {
                floor as u32
            };
            let volume = volume.max(1);
            volumes.insert(job_id, volume);
            self.volumes.insert(job_id, volume);
        }
        self.balancing = false;
        volumes
    }

    fn volume_of(&self, job_id: JobId) -> Option<u32> {
        self.volumes.get(&job_id).copied()
    }

    fn update_volume(&mut self, job_id: JobId, volume: u32) {
        if volume == 0 {
            self.volumes.remove(&job_id);
        } else {
            self.volumes.insert(job_id, volume);
        }
    }

    fn forget(&mut self, job_id: JobId, _now: Duration) {
        self.volumes.remove(&job_id);
        self.demands.remove(&job_id);
        self.priorities.remove(&job_id);
        self.assignments.remove(&job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::BalanceJob;

    /// Drive a whole fleet of balancers in memory, routing collective sends.
    fn run_epoch(
        size: u32,
        inputs: Vec<BalanceInput>,
        rounding: RoundingMode,
    ) -> Vec<BTreeMap<JobId, u32>> {
        let mut balancers: Vec<CutoffPriorityBalancer> = (0..size)
            .map(|r| CutoffPriorityBalancer::new(r, size, 1.0, rounding, 42))
            .collect();

        let mut queue: VecDeque<(u32, u32, Message)> = VecDeque::new();
        let mut done = vec![false; size as usize];

        for (rank, input) in inputs.into_iter().enumerate() {
            let outcome = balancers[rank].begin(Duration::ZERO, input);
            done[rank] = outcome.done;
            for action in outcome.actions {
                if let Action::SendTo { to, message } = action {
                    queue.push_back((rank as u32, to, message));
                }
            }
        }

        let mut steps = 0;
        while let Some((from, to, message)) = queue.pop_front() {
            steps += 1;
            assert!(steps < 100_000, "balancing did not converge");
            let outcome = balancers[to as usize].handle_message(from, &message);
            done[to as usize] |= outcome.done;
            for action in outcome.actions {
                if let Action::SendTo { to: next, message } = action {
                    queue.push_back((to, next, message));
                }
            }
        }

        assert!(done.iter().all(|&d| d), "every worker must finish");
        balancers.iter_mut().map(|b| b.result()).collect()
    }

    fn job(id: u64, demand: u32, priority: f32) -> BalanceJob {
        BalanceJob {
            job_id: JobId(id),
            demand,
            priority,
        }
    }

    fn input(jobs: Vec<BalanceJob>, busy: bool, active: u32) -> BalanceInput {
        BalanceInput {
            jobs,
            busy,
            active_jobs: active,
        }
    }

    #[test]
    fn test_single_job_takes_whole_fleet() {
        let mut inputs = vec![input(vec![job(1, 4, 1.0)], true, 1)];
        inputs.extend((1..4).map(|_| BalanceInput::default()));
        let results = run_epoch(4, inputs, RoundingMode::Bisection);
        assert_eq!(results[0][&JobId(1)], 4);
    }

    #[test]
    fn test_two_equal_jobs_split_evenly() {
        let mut inputs = vec![
            input(vec![job(1, 8, 1.0)], true, 1),
            input(vec![job(2, 8, 1.0)], true, 1),
        ];
        inputs.extend((2..8).map(|_| BalanceInput::default()));
        let results = run_epoch(8, inputs, RoundingMode::Bisection);
        assert_eq!(results[0][&JobId(1)], 4);
        assert_eq!(results[1][&JobId(2)], 4);
    }

    #[test]
    fn test_priority_weighted_split_under_bisection() {
        let mut inputs = vec![
            input(vec![job(1, 8, 3.0)], true, 1),
            input(vec![job(2, 8, 1.0)], true, 1),
        ];
        inputs.extend((2..8).map(|_| BalanceInput::default()));
        let results = run_epoch(8, inputs, RoundingMode::Bisection);

        let hi = results[0][&JobId(1)];
        let lo = results[1][&JobId(2)];
        let sum = hi + lo;
        // Never oversubscribed beyond ⌈N·L⌉, and close to it.
        assert!(sum <= 8, "sum {sum} oversubscribes");
        assert!(sum >= 7, "sum {sum} wastes capacity");
        assert!(hi > lo, "higher priority must receive more ({hi} vs {lo})");
        assert!((5..=6).contains(&hi));
        assert!((2..=3).contains(&lo));
    }

    #[test]
    fn test_probabilistic_rounding_bounded_error() {
        let mut inputs = vec![
            input(vec![job(1, 8, 1.0)], true, 1),
            input(vec![job(2, 8, 2.0)], true, 1),
        ];
        inputs.extend((2..8).map(|_| BalanceInput::default()));
        let results = run_epoch(8, inputs, RoundingMode::Probabilistic);
        let sum: u32 = results[0][&JobId(1)] + results[1][&JobId(2)];
        // Each of the two fractional assignments rounds off by at most one.
        assert!((6..=10).contains(&sum), "sum {sum} outside expected band");
    }

    #[test]
    fn test_single_worker_completes_synchronously() {
        let mut b = CutoffPriorityBalancer::new(0, 1, 1.0, RoundingMode::Bisection, 7);
        let outcome = b.begin(Duration::ZERO, input(vec![job(1, 5, 1.0)], true, 1));
        assert!(outcome.done);
        assert_eq!(b.result()[&JobId(1)], 1);
    }
}
