//! The event-driven balancer: no period, converging event maps.
//!
//! Demand or priority changes are injected as epoch-stamped events and
//! reduced up two overlaid binary trees — a *normal* tree rooted at rank 0
//! and a *reversed* tree rooted at rank N−1. Tree roots broadcast merged maps
//! back down; receivers that learn something new queue a diff to the *other*
//! tree to accelerate convergence. A bounded history of recent broadcasts
//! filters back-propagation of already-known information.
//!
//! Volumes are derived locally from the converged `states` map with the same
//! priority-weighted formula as the cutoff balancer's adjustment phases, so
//! identical maps yield identical volumes on every worker.

use crate::alloc::{adjust_assignments, PriorityHistogram};
use crate::balancer::{BalanceInput, BalanceOutcome, Balancer};
use satswarm_core::Action;
use satswarm_messages::{Message, TreeSide};
use satswarm_types::{EventMap, JobEvent, JobId, WorkerRank};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, trace};

/// Event-driven balancer state.
pub struct EventDrivenBalancer {
    rank: WorkerRank,
    size: u32,
    load_factor: f64,
    /// Bounded broadcast history depth per tree.
    history_size: usize,

    /// This worker's belief about every live job's last-seen event.
    states: EventMap,
    /// Changes known since the last reduction.
    diffs: EventMap,
    /// Per-job epoch counters, bumped by the local root on material change.
    job_epochs: HashMap<JobId, i64>,

    recent_broadcasts_normal: VecDeque<EventMap>,
    recent_broadcasts_reversed: VecDeque<EventMap>,

    volumes: BTreeMap<JobId, u32>,
    /// Volumes recomputed from a changed `states`, awaiting `result()`.
    fresh_volumes: Option<BTreeMap<JobId, u32>>,
}

impl EventDrivenBalancer {
    pub fn new(rank: WorkerRank, size: u32, load_factor: f64, history_size: usize) -> Self {
        Self {
            rank,
            size,
            load_factor,
            history_size,
            states: EventMap::new(),
            diffs: EventMap::new(),
            job_epochs: HashMap::new(),
            recent_broadcasts_normal: VecDeque::new(),
            recent_broadcasts_reversed: VecDeque::new(),
            volumes: BTreeMap::new(),
            fresh_volumes: None,
        }
    }

    // ─── Overlay tree geometry ───

    fn tree_index(&self, rank: WorkerRank, tree: TreeSide) -> u32 {
        match tree {
            TreeSide::Normal => rank,
            TreeSide::Reversed => self.size - 1 - rank,
        }
    }

    fn from_tree_index(&self, index: u32, tree: TreeSide) -> WorkerRank {
        match tree {
            TreeSide::Normal => index,
            TreeSide::Reversed => self.size - 1 - index,
        }
    }

    fn is_tree_root(&self, tree: TreeSide) -> bool {
        self.tree_index(self.rank, tree) == 0
    }

    fn parent_rank(&self, tree: TreeSide) -> Option<WorkerRank> {
        let index = self.tree_index(self.rank, tree);
        if index == 0 {
            return None;
        }
        Some(self.from_tree_index((index - 1) / 2, tree))
    }

    fn child_ranks(&self, tree: TreeSide) -> Vec<WorkerRank> {
        let index = self.tree_index(self.rank, tree);
        [2 * index + 1, 2 * index + 2]
            .into_iter()
            .filter(|&c| c < self.size)
            .map(|c| self.from_tree_index(c, tree))
            .collect()
    }

    fn history(&mut self, tree: TreeSide) -> &mut VecDeque<EventMap> {
        match tree {
            TreeSide::Normal => &mut self.recent_broadcasts_normal,
            TreeSide::Reversed => &mut self.recent_broadcasts_reversed,
        }
    }

    fn remember_broadcast(&mut self, tree: TreeSide, map: EventMap) {
        let cap = self.history_size;
        let history = self.history(tree);
        history.push_back(map);
        while history.len() > cap {
            history.pop_front();
        }
    }

    // ─── Reduction / broadcast plumbing ───

    /// Push pending diffs one level up both trees (digesting locally at tree
    /// roots). Returns whether `states` changed.
    fn flush_diffs(&mut self, actions: &mut Vec<Action>) -> bool {
        if self.diffs.is_empty() {
            return false;
        }
        let diffs = std::mem::take(&mut self.diffs);
        let mut changed = false;
        for tree in [TreeSide::Normal, TreeSide::Reversed] {
            changed |= self.reduce_up(tree, diffs.clone(), actions);
        }
        changed
    }

    /// Move a merged diff map towards the root of `tree`: forward to the
    /// parent, or digest-and-broadcast at the root.
    fn reduce_up(&mut self, tree: TreeSide, events: EventMap, actions: &mut Vec<Action>) -> bool {
        match self.parent_rank(tree) {
            Some(parent) => {
                actions.push(Action::SendTo {
                    to: parent,
                    message: Message::AnytimeReduction {
                        tree,
                        events,
                    },
                });
                false
            }
            None => {
                let changed = self.states.update_by(&events);
                self.broadcast_down(tree, events, actions);
                changed
            }
        }
    }

    fn broadcast_down(&mut self, tree: TreeSide, events: EventMap, actions: &mut Vec<Action>) {
        for child in self.child_ranks(tree) {
            actions.push(Action::SendTo {
                to: child,
                message: Message::AnytimeBroadcast {
                    tree,
                    events: events.clone(),
                },
            });
        }
        self.remember_broadcast(tree, events);
    }

    /// Apply a changed `states` map: derive new volumes. Tree roots collect
    /// tombstones whose broadcast has circulated.
    fn on_states_changed(&mut self) {
        if self.is_tree_root(TreeSide::Normal) || self.is_tree_root(TreeSide::Reversed) {
            self.states.remove_old_zeros();
        }
        let volumes = compute_volumes(&self.states, self.size, self.load_factor);
        trace!(?volumes, "derived volumes from event map");
        self.fresh_volumes = Some(volumes);
    }

    fn other_tree(tree: TreeSide) -> TreeSide {
        match tree {
            TreeSide::Normal => TreeSide::Reversed,
            TreeSide::Reversed => TreeSide::Normal,
        }
    }

    pub fn states(&self) -> &EventMap {
        &self.states
    }
}

impl Balancer for EventDrivenBalancer {
    fn begin(&mut self, _now: Duration, input: BalanceInput) -> BalanceOutcome {
        // Inject an event for every local root whose demand or priority
        // materially changed.
        for job in &input.jobs {
            let known = self.states.get(job.job_id);
            let unchanged = known.is_some_and(|ev| {
                ev.demand == job.demand as i32 && ev.priority == job.priority
            });
            if unchanged {
                continue;
            }
            let epoch = self
                .job_epochs
                .entry(job.job_id)
                .and_modify(|e| *e += 1)
                .or_insert(1);
            let base = known.map(|ev| ev.epoch).unwrap_or(0);
            let epoch = (*epoch).max(base + 1);
            self.job_epochs.insert(job.job_id, epoch);
            debug!(job = %job.job_id, demand = job.demand, epoch, "demand event");
            self.diffs.insert_if_novel(JobEvent {
                job_id: job.job_id,
                epoch,
                demand: job.demand as i32,
                priority: job.priority,
            });
        }

        let mut actions = Vec::new();
        // At a tree root the local view absorbs the diff immediately; other
        // workers learn their new volumes from the broadcasts.
        let changed = self.flush_diffs(&mut actions);
        if changed {
            self.on_states_changed();
        }
        BalanceOutcome {
            done: changed,
            actions,
        }
    }

    fn is_balancing(&self) -> bool {
        // Event-driven balancing is never "in flight": every message is
        // handled to completion and results appear whenever states change.
        false
    }

    fn can_continue(&self) -> bool {
        false
    }

    fn advance(&mut self) -> BalanceOutcome {
        BalanceOutcome::default()
    }

    fn handle_message(&mut self, from: WorkerRank, message: &Message) -> BalanceOutcome {
        let mut actions = Vec::new();
        let mut changed = false;
        match message {
            Message::AnytimeReduction { tree, events } => {
                trace!(from, ?tree, n = events.len(), "reduction received");
                let mut merged = events.clone();
                // Fold in anything this worker has not pushed yet.
                merged.merge(&std::mem::take(&mut self.diffs));
                changed = self.reduce_up(*tree, merged, &mut actions);
            }
            Message::AnytimeBroadcast { tree, events } => {
                trace!(from, ?tree, n = events.len(), "broadcast received");
                // Collect what is genuinely new before touching states.
                let mut novel = EventMap::new();
                for ev in events.entries().values() {
                    if self.states.insert_if_novel(*ev) {
                        novel.insert_if_novel(*ev);
                        changed = true;
                    }
                }
                // Keep the broadcast flowing down this tree.
                for child in self.child_ranks(*tree) {
                    actions.push(Action::SendTo {
                        to: child,
                        message: Message::AnytimeBroadcast {
                            tree: *tree,
                            events: events.clone(),
                        },
                    });
                }
                self.remember_broadcast(*tree, events.clone());

                // Accelerate convergence: push the news up the other tree,
                // unless its recent broadcasts already carried it.
                if !novel.is_empty() {
                    let other = Self::other_tree(*tree);
                    let history = match other {
                        TreeSide::Normal => &self.recent_broadcasts_normal,
                        TreeSide::Reversed => &self.recent_broadcasts_reversed,
                    };
                    for h in history {
                        novel.filter_by(h);
                    }
                    if !novel.is_empty() {
                        let c = self.reduce_up(other, novel, &mut actions);
                        changed |= c;
                    }
                }
            }
            _ => {}
        }

        if changed {
            self.on_states_changed();
        }
        BalanceOutcome {
            done: changed,
            actions,
        }
    }

    fn result(&mut self) -> BTreeMap<JobId, u32> {
        let volumes = self.fresh_volumes.take().unwrap_or_default();
        for (&job_id, &v) in &volumes {
            self.volumes.insert(job_id, v);
        }
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
        // Zero-demand zero-priority tombstone; the root garbage-collects it
        // once the broadcast has circulated.
        let epoch = self
            .job_epochs
            .entry(job_id)
            .and_modify(|e| *e += 1)
            .or_insert(1);
        let epoch = *epoch;
        let base = self.states.get(job_id).map(|ev| ev.epoch).unwrap_or(0);
        let epoch = epoch.max(base + 1);
        self.job_epochs.insert(job_id, epoch);
        self.diffs.insert_if_novel(JobEvent {
            job_id,
            epoch,
            demand: 0,
            priority: 0.0,
        });
        self.volumes.remove(&job_id);
    }
}

/// Derive volumes from a converged event map. Deterministic: identical maps
/// yield identical volumes on every worker.
fn compute_volumes(states: &EventMap, size: u32, load_factor: f64) -> BTreeMap<JobId, u32> {
    let live: Vec<&JobEvent> = states
        .entries()
        .values()
        .filter(|ev| ev.demand > 0)
        .collect();
    if live.is_empty() {
        return BTreeMap::new();
    }

    let num_jobs = live.len() as f64;
    let target = size as f64 * load_factor;
    let avail = target - num_jobs;
    let aggregated: f64 = live
        .iter()
        .map(|ev| (ev.demand as f64 - 1.0) * ev.priority as f64)
        .sum();

    let mut assignments: BTreeMap<JobId, f64> = BTreeMap::new();
    let mut demands: BTreeMap<JobId, u32> = BTreeMap::new();
    let mut priorities: BTreeMap<JobId, f32> = BTreeMap::new();
    let mut classes: BTreeMap<u64, (f32, f64)> = BTreeMap::new();
    for ev in &live {
        let met_ratio = if aggregated > 0.0 {
            (avail * ev.priority as f64 / aggregated).min(1.0)
        } else {
            1.0
        };
        let assignment = 1.0 + met_ratio.max(0.0) * (ev.demand as f64 - 1.0);
        assignments.insert(ev.job_id, assignment);
        demands.insert(ev.job_id, ev.demand as u32);
        priorities.insert(ev.job_id, ev.priority);
        let key = (ev.priority.to_bits() as u64) ^ u64::MAX;
        let entry = classes.entry(key).or_insert((ev.priority, 0.0));
        entry.1 += ev.demand as f64 - assignment;
    }

    let assigned: f64 = assignments.values().map(|a| a - 1.0).sum();
    let mut remaining = avail - assigned;
    if remaining < 0.1 {
        remaining = 0.0;
    }
    let histogram = PriorityHistogram::from_classes(classes.into_values().collect());
    adjust_assignments(&mut assignments, &demands, &priorities, &histogram, remaining);

    // Deterministic rounding: floor everyone to at least one, then hand out
    // the leftover capacity by descending fractional remainder (ties by job
    // id) without exceeding any job's demand.
    let mut volumes: BTreeMap<JobId, u32> = BTreeMap::new();
    let mut leftover = target.floor() as i64;
    for (&job_id, &a) in &assignments {
        let v = (a.floor() as u32).max(1);
        leftover -= v as i64;
        volumes.insert(job_id, v);
    }
    let mut by_remainder: Vec<(JobId, f64)> = assignments
        .iter()
        .map(|(&id, &a)| (id, a - a.floor()))
        .collect();
    by_remainder.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then(a.0.cmp(&b.0)));
    for (job_id, _) in by_remainder {
        if leftover <= 0 {
            break;
        }
        let v = volumes.get_mut(&job_id).expect("job present");
        if *v < demands[&job_id] {
            *v += 1;
            leftover -= 1;
        }
    }
    volumes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::BalanceJob;
    use std::collections::VecDeque;

    fn fleet(size: u32) -> Vec<EventDrivenBalancer> {
        (0..size)
            .map(|r| EventDrivenBalancer::new(r, size, 1.0, 3))
            .collect()
    }

    /// Deliver every in-flight message until quiescent; count broadcast hops.
    fn settle(balancers: &mut [EventDrivenBalancer], outcome_actions: Vec<(u32, Vec<Action>)>) -> u32 {
        let mut queue: VecDeque<(u32, u32, Message)> = VecDeque::new();
        for (from, actions) in outcome_actions {
            for action in actions {
                if let Action::SendTo { to, message } = action {
                    queue.push_back((from, to, message));
                }
            }
        }
        let mut hops = 0;
        while let Some((from, to, message)) = queue.pop_front() {
            hops += 1;
            assert!(hops < 10_000, "event maps did not converge");
            let outcome = balancers[to as usize].handle_message(from, &message);
            for action in outcome.actions {
                if let Action::SendTo { to: next, message } = action {
                    queue.push_back((to, next, message));
                }
            }
        }
        hops
    }

    #[test]
    fn test_demand_update_converges_everywhere() {
        let size = 8;
        let mut balancers = fleet(size);

        // Rank 3 hosts the root of job 1 and raises its demand from 1 to 4.
        let outcome = balancers[3].begin(
            Duration::ZERO,
            BalanceInput {
                jobs: vec![BalanceJob {
                    job_id: JobId(1),
                    demand: 4,
                    priority: 1.0,
                }],
                busy: true,
                active_jobs: 1,
            },
        );
        settle(&mut balancers, vec![(3, outcome.actions)]);

        for (rank, b) in balancers.iter().enumerate() {
            let ev = b.states().get(JobId(1));
            assert!(ev.is_some(), "rank {rank} missing the event");
            assert_eq!(ev.unwrap().demand, 4, "rank {rank}");
            assert_eq!(
                compute_volumes(b.states(), size, 1.0)[&JobId(1)],
                4,
                "rank {rank} derives the same volume"
            );
        }
    }

    #[test]
    fn test_convergence_within_logarithmic_hops() {
        let size = 8;
        let mut balancers = fleet(size);
        let outcome = balancers[5].begin(
            Duration::ZERO,
            BalanceInput {
                jobs: vec![BalanceJob {
                    job_id: JobId(9),
                    demand: 2,
                    priority: 1.0,
                }],
                busy: true,
                active_jobs: 1,
            },
        );
        let hops = settle(&mut balancers, vec![(5, outcome.actions)]);
        // Up and down two depth-⌈log N⌉ trees plus cross-tree acceleration:
        // far below a fleet-wide flood.
        assert!(hops <= 8 * (size as f32).log2().ceil() as u32 * 2 + size);
    }

    #[test]
    fn test_two_jobs_share_by_priority() {
        let mut states = EventMap::new();
        states.insert_if_novel(JobEvent {
            job_id: JobId(1),
            epoch: 1,
            demand: 8,
            priority: 3.0,
        });
        states.insert_if_novel(JobEvent {
            job_id: JobId(2),
            epoch: 1,
            demand: 8,
            priority: 1.0,
        });
        let volumes = compute_volumes(&states, 8, 1.0);
        let sum: u32 = volumes.values().sum();
        assert!(sum <= 8);
        assert!(volumes[&JobId(1)] > volumes[&JobId(2)]);
    }

    #[test]
    fn test_forget_circulates_tombstone_and_root_collects() {
        let size = 4;
        let mut balancers = fleet(size);

        let outcome = balancers[2].begin(
            Duration::ZERO,
            BalanceInput {
                jobs: vec![BalanceJob {
                    job_id: JobId(1),
                    demand: 4,
                    priority: 1.0,
                }],
                busy: true,
                active_jobs: 1,
            },
        );
        settle(&mut balancers, vec![(2, outcome.actions)]);

        balancers[2].forget(JobId(1), Duration::from_secs(1));
        let outcome = balancers[2].begin(Duration::from_secs(1), BalanceInput::default());
        settle(&mut balancers, vec![(2, outcome.actions)]);

        // The tombstone reached the normal-tree root, which collected it.
        assert!(balancers[0].states().get(JobId(1)).is_none());
    }
}
