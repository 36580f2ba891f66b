//! Worker configuration.

use satswarm_balance::RoundingMode;
use serde::Deserialize;
use std::time::Duration;

/// Which balancing strategy a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancerMode {
    CutoffPriority,
    EventDriven,
}

/// All scheduler knobs, loadable from the worker's TOML config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Fraction of fleet capacity the balancer may allocate, in (0, 1].
    pub load_factor: f64,
    /// Balancing period in seconds (cutoff-priority mode).
    pub balance_period: f64,
    /// Demand growth period in seconds; ≤ 0 means immediate full demand.
    pub growth_period: f64,
    /// Continuous instead of discrete periodic growth.
    pub continuous_growth: bool,
    /// Demand cap per job; 0 disables the cap.
    pub max_demand: u32,
    /// Solver threads per job.
    pub threads_per_job: u32,
    /// Cut the per-job thread count once threads × formula literals exceed
    /// this; 0 disables.
    pub solver_literal_threshold: usize,
    /// Clause exchange: initial buffer size (literals).
    pub clause_exchange_base_size: usize,
    /// Clause exchange: per-depth buffer growth factor.
    pub clause_exchange_multiplier: f64,
    /// Clause exchange cadence in seconds; 0 disables the overlay.
    pub clause_exchange_period: f64,
    /// Number of derandomized bounce alternatives (even, less than the fleet
    /// size).
    pub bounce_alternatives: usize,
    /// Fixed bounce alternatives instead of per-request permutations.
    pub derandomize: bool,
    /// Prime connectivity to the bounce alternatives at startup.
    pub warmup: bool,
    /// Idle backoff in the runtime loop.
    pub sleep_on_idle: bool,
    pub yield_on_idle: bool,
    /// Resident-set cap in GiB; 0 disables forgetting.
    pub memory_cap_gb: f64,
    /// Per-instance wall-clock limit in seconds; 0 disables.
    pub wallclock_limit_secs: f64,
    /// Per-instance CPU-time limit in seconds; 0 disables.
    pub cpu_limit_secs: f64,
    pub balancer_mode: BalancerMode,
    pub rounding_mode: RoundingMode,
    /// Event-driven balancer: bounded broadcast history depth.
    pub broadcast_history: usize,
    /// Whole-fleet timeout in seconds; 0 disables.
    pub global_timeout_secs: f64,
    /// Watchdog cadence.
    pub watchdog_period_secs: f64,
    /// Compute tick cadence.
    pub compute_period_secs: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            load_factor: 1.0,
            balance_period: 5.0,
            growth_period: 0.0,
            continuous_growth: false,
            max_demand: 0,
            threads_per_job: 4,
            solver_literal_threshold: 0,
            clause_exchange_base_size: 1500,
            clause_exchange_multiplier: 3.0,
            clause_exchange_period: 1.0,
            bounce_alternatives: 4,
            derandomize: false,
            warmup: false,
            sleep_on_idle: true,
            yield_on_idle: false,
            memory_cap_gb: 0.0,
            wallclock_limit_secs: 0.0,
            cpu_limit_secs: 0.0,
            balancer_mode: BalancerMode::CutoffPriority,
            rounding_mode: RoundingMode::Bisection,
            broadcast_history: 3,
            global_timeout_secs: 0.0,
            watchdog_period_secs: 1.0,
            compute_period_secs: 0.05,
        }
    }
}

impl WorkerConfig {
    pub fn watchdog_period(&self) -> Duration {
        Duration::from_secs_f64(self.watchdog_period_secs)
    }

    pub fn compute_period(&self) -> Duration {
        Duration::from_secs_f64(self.compute_period_secs)
    }

    pub fn balance_period(&self) -> Duration {
        Duration::from_secs_f64(self.balance_period)
    }

    pub fn clause_exchange_period(&self) -> Duration {
        Duration::from_secs_f64(self.clause_exchange_period)
    }
}
