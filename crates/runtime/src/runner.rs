//! The production event loop: one task owns the state machine.

use crate::monitor::TransportMonitor;
use crate::solver_host::{SolverFactory, SolverHost};
use crate::timers::TimerManager;
use crate::transport::{MeshTransport, PeerConfig};
use satswarm_core::{Action, Event, StateMachine};
use satswarm_types::WorkerRank;
use satswarm_worker::{WorkerConfig, WorkerState};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Everything needed to run one worker process.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RuntimeConfig {
    pub rank: WorkerRank,
    pub listen_addr: String,
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),
}

/// Wires the worker state machine to transport, timers, and solver threads,
/// then drains the event aggregator until shutdown.
pub struct RuntimeRunner {
    worker: WorkerState,
    events: mpsc::UnboundedReceiver<Event>,
    transport: MeshTransport,
    timers: TimerManager,
    solvers: SolverHost,
    started_at: Instant,
}

impl RuntimeRunner {
    pub async fn start(
        config: RuntimeConfig,
        factory: SolverFactory,
    ) -> Result<Self, RuntimeError> {
        let fleet_size = config.peers.len() as u32;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let monitor = TransportMonitor::new();
        monitor.spawn_watcher();

        let transport = MeshTransport::start(
            config.rank,
            &config.listen_addr,
            &config.peers,
            event_tx.clone(),
            monitor,
        )
        .await?;

        let worker = WorkerState::new(config.rank, fleet_size, config.worker, config.seed);
        info!(rank = config.rank, fleet_size, "runtime starting");

        Ok(Self {
            worker,
            events: event_rx,
            transport,
            timers: TimerManager::new(event_tx.clone()),
            solvers: SolverHost::new(factory, event_tx),
            started_at: Instant::now(),
        })
    }

    /// Run until the worker executes `Action::Shutdown`. Returns the exit
    /// code to report.
    pub async fn run(mut self) -> i32 {
        let now = self.started_at.elapsed();
        self.worker.set_time(now);
        for action in self.worker.init() {
            if self.execute(action) {
                return 0;
            }
        }

        while let Some(event) = self.events.recv().await {
            let now = self.started_at.elapsed();
            self.worker.set_time(now);
            let actions = self.worker.handle(event);
            for action in actions {
                if self.execute(action) {
                    info!("clean shutdown");
                    return 0;
                }
            }
        }
        warn!("event channel closed without an exit signal");
        1
    }

    /// Execute one action. Returns true on shutdown.
    fn execute(&mut self, action: Action) -> bool {
        match action {
            Action::SendTo { to, message } => {
                if let Err(e) = self.transport.send(to, message) {
                    warn!(to, error = %e, "send failed");
                }
            }
            Action::SetTimer { id, duration } => self.timers.set(id, duration),
            Action::CancelTimer { id } => self.timers.cancel(id),
            Action::EnqueueInternal { event } => {
                // Re-enter through the worker directly: internal events
                // preserve causality over anything queued behind them.
                let actions = self.worker.handle(event);
                for action in actions {
                    if self.execute(action) {
                        return true;
                    }
                }
            }
            Action::StartSolver {
                job_id,
                description,
                seed,
                ..
            } => self.solvers.start(job_id, description, seed),
            Action::SuspendSolver { job_id } => self.solvers.suspend(job_id),
            Action::ResumeSolver { job_id } => self.solvers.resume(job_id),
            Action::InterruptSolver { job_id } => self.solvers.interrupt(job_id),
            Action::TerminateSolver { job_id } => self.solvers.terminate(job_id),
            Action::PrepareSharing {
                job_id,
                max_literals,
            } => self.solvers.prepare_sharing(job_id, max_literals),
            Action::DigestSharing { job_id, buffer } => {
                self.solvers.digest_sharing(job_id, buffer)
            }
            Action::SampleMemory => {
                let resident_gb = read_resident_set_gb();
                let actions = self.worker.handle(Event::MemorySampled { resident_gb });
                for action in actions {
                    if self.execute(action) {
                        return true;
                    }
                }
            }
            Action::EmitJobDone {
                job_id,
                client_rank,
                transfer_size,
            } => {
                info!(job = %job_id, client_rank, transfer_size, "job done");
            }
            Action::EmitJobResult { result } => {
                info!(job = %result.job_id, code = ?result.code, "job result ready");
            }
            Action::EmitJobAborted { job_id } => {
                info!(job = %job_id, "job aborted");
            }
            Action::Shutdown => return true,
        }
        false
    }
}

/// Resident set of this process in GiB (0.0 where /proc is unavailable).
fn read_resident_set_gb() -> f64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0.0;
    };
    let Some(resident_pages) = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse::<u64>().ok())
    else {
        return 0.0;
    };
    let page_size = 4096u64;
    (resident_pages * page_size) as f64 / (1024.0 * 1024.0 * 1024.0)
}
