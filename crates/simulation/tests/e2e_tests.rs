//! End-to-end scenarios for the deterministic fleet simulation.
//!
//! Each test drives a full fleet — placement, balancing, volume application,
//! and result delivery — with simulated time and scripted solvers. Same seed,
//! same run, every time.

use satswarm_simulation::{
    NetworkConfig, SimulationConfig, SimulationRunner, SolverScript,
};
use satswarm_types::{JobDescription, JobId, ResultCode};
use satswarm_worker::{BalancerMode, WorkerConfig};
use std::time::Duration;
use tracing_test::traced_test;

fn fleet_config(fleet_size: u32) -> SimulationConfig {
    SimulationConfig {
        fleet_size,
        network: NetworkConfig {
            latency: Duration::from_millis(5),
            jitter_fraction: 0.1,
            packet_loss_rate: 0.0,
        },
        worker: WorkerConfig {
            balance_period: 2.0,
            growth_period: 0.0,
            ..Default::default()
        },
    }
}

fn description(id: u64, priority: f32) -> JobDescription {
    JobDescription::new(JobId(id), priority, vec![1, -2, 0, 2, 3, 0], vec![])
}

/// Every worker hosts at most one ACTIVE fragment, and it is the current job.
fn assert_single_active_invariant(runner: &SimulationRunner, job_ids: &[JobId]) {
    for rank in 0..runner.fleet_size() {
        let worker = runner.worker(rank);
        let active: Vec<JobId> = job_ids
            .iter()
            .copied()
            .filter(|&id| {
                worker
                    .job(id)
                    .map(|j| j.state() == satswarm_job::JobState::Active)
                    .unwrap_or(false)
            })
            .collect();
        assert!(
            active.len() <= 1,
            "worker {rank} has {} active fragments",
            active.len()
        );
        if let Some(&id) = active.first() {
            assert_eq!(worker.current_job(), Some(id), "worker {rank}");
        }
    }
}

#[traced_test]
#[test]
fn test_single_job_fills_the_fleet() {
    // Scenario: N=4, L=1.0, immediate demand. One job grows to a complete
    // depth-2 tree within one balancing epoch.
    let mut runner = SimulationRunner::new(fleet_config(4), 42);
    runner.submit_job(0, description(1, 1.0));
    runner.run_until(Duration::from_secs(10));

    let job = JobId(1);
    assert_eq!(runner.worker(0).volume_of(job), Some(4));

    let fragments = runner.active_fragments(job);
    assert_eq!(fragments.len(), 4, "fragments: {fragments:?}");
    let indices: Vec<u32> = fragments.iter().map(|&(_, idx)| idx).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert!(runner.tree_is_connected(job));
    assert_single_active_invariant(&runner, &[job]);
}

#[traced_test]
#[test]
fn test_two_equal_jobs_split_the_fleet() {
    // Scenario: N=8, equal priorities, staggered submission. One epoch after
    // the second arrival both jobs sit at volume 4.
    let mut runner = SimulationRunner::new(fleet_config(8), 42);
    runner.submit_job(0, description(1, 1.0));
    runner.run_until(Duration::from_secs(1));
    runner.submit_job(4, description(2, 1.0));
    runner.run_until(Duration::from_secs(12));

    assert_eq!(runner.worker(0).volume_of(JobId(1)), Some(4));
    assert_eq!(runner.worker(4).volume_of(JobId(2)), Some(4));
    assert_eq!(runner.active_fragments(JobId(1)).len(), 4);
    assert_eq!(runner.active_fragments(JobId(2)).len(), 4);
    assert!(runner.tree_is_connected(JobId(1)));
    assert!(runner.tree_is_connected(JobId(2)));
    assert_single_active_invariant(&runner, &[JobId(1), JobId(2)]);
}

#[traced_test]
#[test]
fn test_priorities_weight_the_split() {
    // Scenario: N=8, priorities 3 and 1. Bisection rounding hands the
    // higher-priority job the bigger share without oversubscribing.
    let mut runner = SimulationRunner::new(fleet_config(8), 42);
    runner.submit_job(0, description(1, 3.0));
    runner.submit_job(4, description(2, 1.0));
    runner.run_until(Duration::from_secs(12));

    let hi = runner.worker(0).volume_of(JobId(1)).expect("volume for job 1");
    let lo = runner.worker(4).volume_of(JobId(2)).expect("volume for job 2");
    assert!(hi > lo, "priority 3 job must outweigh priority 1 ({hi} vs {lo})");
    assert!(hi + lo <= 8, "oversubscribed: {hi} + {lo}");
    assert!(hi + lo >= 7, "wasted capacity: {hi} + {lo}");
}

#[traced_test]
#[test]
fn test_starving_root_preempts_a_leaf() {
    // Scenario: N=4 fully occupied by job 1. A second job's root request
    // exceeds its hop cap, displaces a childless leaf, and takes its slot.
    let mut runner = SimulationRunner::new(fleet_config(4), 7);
    runner.submit_job(0, description(1, 1.0));
    runner.run_until(Duration::from_secs(3));
    assert_eq!(runner.active_fragments(JobId(1)).len(), 4);

    runner.submit_job(1, description(2, 1.0));
    runner.run_until(Duration::from_millis(3_500));

    // Before the next balancing epoch: the new root computes, the old job
    // lost exactly one leaf.
    assert_eq!(runner.active_fragments(JobId(2)).len(), 1);
    assert_eq!(runner.active_fragments(JobId(1)).len(), 3);

    // After rebalancing, the fleet is split between both jobs.
    runner.run_until(Duration::from_secs(12));
    assert_eq!(runner.active_fragments(JobId(1)).len(), 2);
    assert_eq!(runner.active_fragments(JobId(2)).len(), 2);
    assert!(runner.tree_is_connected(JobId(1)));
    assert!(runner.tree_is_connected(JobId(2)));
    assert_single_active_invariant(&runner, &[JobId(1), JobId(2)]);
}

#[traced_test]
#[test]
fn test_defection_and_regrowth() {
    // Scenario: a fragment departs its slot; the parent notices, re-requests
    // the index, and the tree regrows within a few bounces.
    let mut runner = SimulationRunner::new(fleet_config(4), 42);
    runner.submit_job(0, description(1, 1.0));
    runner.run_until(Duration::from_secs(4));
    assert_eq!(runner.active_fragments(JobId(1)).len(), 4);

    let (defector, _) = runner
        .active_fragments(JobId(1))
        .into_iter()
        .find(|&(_, idx)| idx == 1)
        .expect("index 1 is materialized");
    runner.defect(defector, JobId(1));
    runner.run_until(Duration::from_secs(8));

    let fragments = runner.active_fragments(JobId(1));
    assert_eq!(fragments.len(), 4, "tree regrew: {fragments:?}");
    assert!(runner.tree_is_connected(JobId(1)));
}

#[traced_test]
#[test]
fn test_event_driven_convergence() {
    // Scenario: event-driven balancing on N=8. The root's demand event
    // reaches every worker, and all of them derive the same volume.
    let mut config = fleet_config(8);
    config.worker.balancer_mode = BalancerMode::EventDriven;
    let mut runner = SimulationRunner::new(config, 42);
    runner.submit_job(3, description(1, 1.0));
    runner.run_until(Duration::from_secs(10));

    for rank in 0..8 {
        assert_eq!(
            runner.worker(rank).volume_of(JobId(1)),
            Some(8),
            "rank {rank} volume"
        );
    }
    assert_eq!(runner.active_fragments(JobId(1)).len(), 8);
    assert!(runner.tree_is_connected(JobId(1)));
}

#[traced_test]
#[test]
fn test_result_flows_back_to_the_client() {
    // A solver verdict travels leaf → root → winner → client, and the whole
    // tree terminates.
    let mut runner = SimulationRunner::new(fleet_config(4), 42);
    runner.script_solver(
        JobId(1),
        SolverScript {
            verdict: Some((Duration::from_secs(3), ResultCode::Sat, vec![1, -2, 3])),
            ..Default::default()
        },
    );
    runner.submit_job(0, description(1, 1.0));
    runner.run_until(Duration::from_secs(15));

    let result = runner.result_of(JobId(1)).expect("result delivered");
    assert_eq!(result.code, ResultCode::Sat);
    assert_eq!(result.solution, vec![1, -2, 3]);
    assert!(
        runner.active_fragments(JobId(1)).is_empty(),
        "all fragments stopped after the result"
    );
}

#[traced_test]
#[test]
fn test_wallclock_limit_aborts_the_tree() {
    let mut config = fleet_config(4);
    config.worker.wallclock_limit_secs = 3.0;
    let mut runner = SimulationRunner::new(config, 42);
    runner.submit_job(0, description(1, 1.0));
    runner.run_until(Duration::from_secs(15));

    assert!(runner.was_aborted(JobId(1)));
    assert!(runner.active_fragments(JobId(1)).is_empty());
}

#[traced_test]
#[test]
fn test_exit_broadcast_halts_the_whole_fleet() {
    // One worker broadcasts EXIT; every peer receives it and stops, not just
    // the initiator.
    let mut runner = SimulationRunner::new(fleet_config(4), 42);
    runner.submit_job(0, description(1, 1.0));
    runner.run_until(Duration::from_secs(3));

    runner.shutdown_fleet(2);
    runner.run_until(Duration::from_secs(4));

    for rank in 0..4 {
        assert!(runner.worker(rank).is_exiting(), "rank {rank} still running");
    }
}

#[traced_test]
#[test]
fn test_global_timeout_broadcasts_exit() {
    // The watchdog's global timeout is a fleet-wide halt: the timed-out
    // worker broadcasts EXIT rather than only terminating itself.
    let mut config = fleet_config(4);
    config.worker.global_timeout_secs = 2.0;
    let mut runner = SimulationRunner::new(config, 42);
    runner.run_until(Duration::from_secs(5));

    for rank in 0..4 {
        assert!(runner.worker(rank).is_exiting(), "rank {rank} still running");
    }
}

#[traced_test]
#[test]
fn test_clause_exchange_reaches_root_and_leaves() {
    // Leaves export clauses every exchange period; the merged buffer is
    // digested at the root and redistributed down.
    let mut runner = SimulationRunner::new(fleet_config(4), 42);
    runner.script_solver(
        JobId(1),
        SolverScript {
            export: vec![1, 7, 0, 1, 9],
            ..Default::default()
        },
    );
    runner.submit_job(0, description(1, 1.0));
    runner.run_until(Duration::from_secs(10));

    let fragments = runner.active_fragments(JobId(1));
    assert_eq!(fragments.len(), 4);
    let root = fragments
        .iter()
        .find(|&&(_, idx)| idx == 0)
        .map(|&(node, _)| node)
        .expect("root present");
    assert!(
        runner.solvers().digest_count(root, JobId(1)) >= 1,
        "root digested at least one merged buffer"
    );
    let leaf = fragments
        .iter()
        .find(|&&(_, idx)| idx == 2)
        .map(|&(node, _)| node)
        .expect("leaf present");
    assert!(
        runner.solvers().digest_count(leaf, JobId(1)) >= 1,
        "leaves digest the distributed buffer"
    );
}
