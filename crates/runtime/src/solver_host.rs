//! Hosts solver portfolios on dedicated OS threads.
//!
//! The control thread never blocks on solver work: starts and teardowns run
//! on their own threads, verdicts come back as events, and suspend/resume/
//! interrupt go through each solver's thread-safe control handle.

use satswarm_core::Event;
use satswarm_solver::{PortfolioSolver, SolverControl};
use satswarm_types::{JobDescription, JobId};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace, warn};

/// Builds one portfolio instance for a job.
pub type SolverFactory = Arc<dyn Fn(JobId) -> Box<dyn PortfolioSolver> + Send + Sync>;

enum SolverCommand {
    PrepareSharing { max_literals: usize },
    DigestSharing { buffer: Vec<i32> },
    Stop,
}

struct HostedSolver {
    control: Arc<dyn SolverControl>,
    commands: std::sync::mpsc::Sender<SolverCommand>,
    thread: Option<thread::JoinHandle<()>>,
}

/// All solver instances hosted by this worker process.
pub struct SolverHost {
    factory: SolverFactory,
    events: UnboundedSender<Event>,
    solvers: HashMap<JobId, HostedSolver>,
}

impl SolverHost {
    pub fn new(factory: SolverFactory, events: UnboundedSender<Event>) -> Self {
        Self {
            factory,
            events,
            solvers: HashMap::new(),
        }
    }

    /// Ingest the description and run the portfolio on its own thread.
    /// Emits `SolverStarted` after ingestion, then `SolverResult` when the
    /// search returns with an uninterrupted verdict.
    pub fn start(&mut self, job_id: JobId, description: Arc<JobDescription>, seed: u64) {
        if self.solvers.contains_key(&job_id) {
            // Restart after a dropped description: replace the instance.
            self.terminate(job_id);
        }
        let mut solver = (self.factory)(job_id);
        let control = solver.control();
        // Push-side clause export: the engine reports each learned clause as
        // the search runs (the exchange overlay drains via PrepareSharing).
        solver.set_learned_clause_callback(Box::new(move |clause| {
            trace!(job = %job_id, len = clause.len(), "clause learned");
        }));
        let (commands, command_rx) = std::sync::mpsc::channel();
        let events = self.events.clone();

        let thread = thread::Builder::new()
            .name(format!("solver-{}", job_id.0))
            .spawn(move || {
                solver.diversify(seed);
                for &literal in &description.base.literals {
                    solver.add_literal(literal);
                }
                for amendment in &description.amendments {
                    for &literal in &amendment.literals {
                        solver.add_literal(literal);
                    }
                }
                let _ = events.send(Event::SolverStarted { job_id });

                let revision = description.revision();
                let outcome = solver.solve(description.assumptions());
                if outcome.code != satswarm_types::ResultCode::Unknown {
                    let _ = events.send(Event::SolverResult {
                        job_id,
                        revision,
                        result: outcome.code,
                        solution: outcome.solution,
                    });
                }

                // Serve sharing commands until torn down.
                while let Ok(command) = command_rx.recv() {
                    match command {
                        SolverCommand::PrepareSharing { max_literals } => {
                            let buffer = solver.prepare_sharing(max_literals);
                            let _ = events.send(Event::SharingPrepared { job_id, buffer });
                        }
                        SolverCommand::DigestSharing { buffer } => {
                            solver.digest_sharing(&buffer);
                        }
                        SolverCommand::Stop => break,
                    }
                }
            })
            .expect("spawning a solver thread cannot fail");

        self.solvers.insert(
            job_id,
            HostedSolver {
                control,
                commands,
                thread: Some(thread),
            },
        );
    }

    pub fn suspend(&self, job_id: JobId) {
        if let Some(hosted) = self.solvers.get(&job_id) {
            hosted.control.suspend();
        }
    }

    pub fn resume(&self, job_id: JobId) {
        if let Some(hosted) = self.solvers.get(&job_id) {
            hosted.control.resume();
        }
    }

    pub fn interrupt(&self, job_id: JobId) {
        if let Some(hosted) = self.solvers.get(&job_id) {
            hosted.control.interrupt();
        }
    }

    pub fn prepare_sharing(&self, job_id: JobId, max_literals: usize) {
        if let Some(hosted) = self.solvers.get(&job_id) {
            let _ = hosted
                .commands
                .send(SolverCommand::PrepareSharing { max_literals });
        }
    }

    pub fn digest_sharing(&self, job_id: JobId, buffer: Vec<i32>) {
        if let Some(hosted) = self.solvers.get(&job_id) {
            let _ = hosted.commands.send(SolverCommand::DigestSharing { buffer });
        }
    }

    /// Tear a portfolio down on a detached thread so the control loop never
    /// waits on teardown.
    pub fn terminate(&mut self, job_id: JobId) {
        let Some(mut hosted) = self.solvers.remove(&job_id) else {
            return;
        };
        hosted.control.interrupt();
        let _ = hosted.commands.send(SolverCommand::Stop);
        if let Some(handle) = hosted.thread.take() {
            thread::Builder::new()
                .name(format!("solver-teardown-{}", job_id.0))
                .spawn(move || {
                    if handle.join().is_err() {
                        warn!(job = %job_id, "solver thread panicked during teardown");
                    } else {
                        debug!(job = %job_id, "solver torn down");
                    }
                })
                .expect("spawning a teardown thread cannot fail");
        }
    }
}
