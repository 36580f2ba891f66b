//! Result propagation and termination cascades.

use crate::state::WorkerState;
use satswarm_core::Action;
use satswarm_messages::Message;
use satswarm_types::{JobId, JobResult, ResultCode, WorkerRank};
use satswarm_job::{JobState, TerminationMode};
use tracing::{debug, info, warn};

impl WorkerState {
    // ─── Solver verdicts ───

    pub(crate) fn on_solver_result(
        &mut self,
        job_id: JobId,
        revision: u32,
        result: ResultCode,
        solution: Vec<i32>,
    ) -> Vec<Action> {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return Vec::new();
        };
        // Verdicts from interrupted or superseded searches are dropped.
        if job.state() != JobState::Active || job.is_initializing() || job.revision() != revision {
            debug!(job = %job.to_str(), ?result, "dropping stale solver verdict");
            return Vec::new();
        }

        job.set_result(JobResult {
            job_id,
            revision,
            code: result,
            solution,
        });
        let root_rank = job.tree().root_rank();
        debug!(job = %job.to_str(), to = root_rank, ?result, "reporting verdict to root");
        vec![Action::SendTo {
            to: root_rank,
            message: Message::WorkerFoundResult {
                job_id,
                revision,
                result,
            },
        }]
    }

    /// At the root: route the winner to the client, then tear the tree down.
    pub(crate) fn handle_worker_found_result(
        &mut self,
        from: WorkerRank,
        job_id: JobId,
        revision: u32,
        result: ResultCode,
    ) -> Vec<Action> {
        if !self.known_job(job_id, "WORKER_FOUND_RESULT") {
            return Vec::new();
        }
        let job = &self.jobs[&job_id];
        if !job.is_root() {
            warn!(from, job = %job.to_str(), "result routed to a non-root fragment");
            return Vec::new();
        }
        if job.state() == JobState::Past {
            debug!(from, job = %job_id, "discarding result for finished job");
            return Vec::new();
        }
        if job.revision() > revision {
            debug!(from, job = %job_id, revision, "discarding result for old revision");
            return Vec::new();
        }
        info!(from, job = %job_id, ?result, "result found");

        let client_rank = job.client_rank().unwrap_or(self.rank);
        let incremental = job
            .description()
            .map(|d| d.incremental)
            .unwrap_or(false);

        let mut actions = Vec::new();
        if from == self.rank {
            // The root itself is the winner.
            actions.extend(self.inform_client(job_id, client_rank));
        } else {
            debug!(to = from, client_rank, "forwarding client rank to winner");
            actions.push(Action::SendTo {
                to: from,
                message: Message::ForwardClientRank {
                    job_id,
                    client_rank,
                },
            });
        }

        // Incremental jobs are interrupted between revisions; others are done.
        actions.extend(self.interrupt_job(job_id, !incremental, false));
        actions
    }

    pub(crate) fn handle_forward_client_rank(
        &mut self,
        job_id: JobId,
        client_rank: WorkerRank,
    ) -> Vec<Action> {
        if !self.known_job(job_id, "FORWARD_CLIENT_RANK") {
            return Vec::new();
        }
        self.inform_client(job_id, client_rank)
    }

    /// Advertise a finished result; the client follows up with
    /// `QUERY_JOB_RESULT`.
    fn inform_client(&mut self, job_id: JobId, client_rank: WorkerRank) -> Vec<Action> {
        let Some(result) = self.jobs.get(&job_id).and_then(|j| j.result()) else {
            warn!(job = %job_id, "no local result to advertise");
            return Vec::new();
        };
        debug!(job = %job_id, client_rank, "advertising result to client");
        vec![Action::EmitJobDone {
            job_id,
            client_rank,
            transfer_size: result.transfer_size(),
        }]
    }

    pub(crate) fn handle_query_job_result(
        &mut self,
        from: WorkerRank,
        job_id: JobId,
    ) -> Vec<Action> {
        let Some(result) = self.jobs.get(&job_id).and_then(|j| j.result()) else {
            warn!(from, job = %job_id, "queried for a result this worker does not hold");
            return Vec::new();
        };
        debug!(to = from, job = %job_id, "sending full result");
        vec![Action::SendTo {
            to: from,
            message: Message::SendJobResult(result.clone()),
        }]
    }

    // ─── Cascades ───

    pub(crate) fn handle_abort(&mut self, job_id: JobId) -> Vec<Action> {
        let mut actions = Vec::new();
        if self
            .jobs
            .get(&job_id)
            .map(|j| j.is_root())
            .unwrap_or(false)
        {
            // Surface the abort to the client side.
            actions.push(Action::EmitJobAborted { job_id });
        }
        actions.extend(self.interrupt_job(job_id, true, true));
        actions
    }

    /// Local limit breach at the root: abort the whole tree.
    pub(crate) fn timeout_job(&mut self, job_id: JobId) -> Vec<Action> {
        info!(job = %job_id, "timeout: aborting job");
        self.handle_abort(job_id)
    }

    /// Replay a termination that was deferred while the commitment was in
    /// flight. The commitment has resolved by now.
    pub(crate) fn resolve_pending_termination(&mut self, job_id: JobId) -> Vec<Action> {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return Vec::new();
        };
        let Some(mode) = job.take_pending_termination() else {
            return Vec::new();
        };
        match mode {
            TerminationMode::Interrupt => self.interrupt_job(job_id, false, true),
            TerminationMode::Terminate => self.interrupt_job(job_id, true, true),
            TerminationMode::Abort => self.interrupt_job(job_id, true, true),
        }
    }

    /// Stop or terminate a local fragment and propagate down the tree.
    ///
    /// `terminate && reckless` = ABORT, `terminate` = TERMINATE, otherwise
    /// INTERRUPT (solvers stop, the job stays resumable for a new revision).
    pub(crate) fn interrupt_job(
        &mut self,
        job_id: JobId,
        terminate: bool,
        reckless: bool,
    ) -> Vec<Action> {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return Vec::new();
        };

        // While committed, the description may still be on the wire; defer
        // until the transfer resolves (unless reckless, where it may never
        // arrive).
        if !reckless && (job.state() == JobState::Committed || job.commitment().is_some()) {
            info!(job = %job.to_str(), "deferring interruption: description in flight");
            job.set_pending_termination(if terminate {
                TerminationMode::Terminate
            } else {
                TerminationMode::Interrupt
            });
            return Vec::new();
        }

        let accept = job.state() != JobState::Past;
        let message = if terminate && reckless {
            Message::Abort { job_id }
        } else if terminate {
            Message::Terminate { job_id }
        } else {
            Message::Interrupt { job_id }
        };

        let mut actions = Vec::new();
        if accept {
            for child in [job.tree().left_child_rank(), job.tree().right_child_rank()]
                .into_iter()
                .flatten()
            {
                debug!(to = child, job = %job.to_str(), "propagating interruption");
                actions.push(Action::SendTo {
                    to: child,
                    message: message.clone(),
                });
            }
            for &child in job.past_children() {
                debug!(to = child, job = %job.to_str(), "propagating interruption to past child");
                actions.push(Action::SendTo {
                    to: child,
                    message: message.clone(),
                });
            }
        }
        job.clear_past_children();

        if accept
            && (job.is_initializing()
                || job.is_in_state(&[JobState::Active, JobState::Suspended]))
        {
            info!(job = %job.to_str(), state = job.state().as_str(), "interrupting");
            if job.state() == JobState::Active {
                job.stop();
            }
            actions.push(Action::InterruptSolver { job_id });

            if terminate {
                if self.current_job == Some(job_id) {
                    self.set_load(0, job_id);
                }
                let job = self.jobs.get_mut(&job_id).expect("job exists");
                job.terminate(self.now);
                actions.push(Action::TerminateSolver { job_id });
                info!(job = %job_id, "terminated");

                self.balancer.update_volume(job_id, 0);
                self.volumes.remove(&job_id);
                if job_was_root(self, job_id) {
                    self.balancer.forget(job_id, self.now);
                }
            }
        } else if accept
            && terminate
            && job.is_in_state(&[JobState::Inactive, JobState::Committed])
        {
            // Never started here (or already stopped): just finalize.
            job.terminate(self.now);
            actions.push(Action::TerminateSolver { job_id });
            self.balancer.update_volume(job_id, 0);
            self.volumes.remove(&job_id);
            if job_was_root(self, job_id) {
                self.balancer.forget(job_id, self.now);
            }
        }
        actions
    }
}

fn job_was_root(state: &WorkerState, job_id: JobId) -> bool {
    state
        .jobs
        .get(&job_id)
        .map(|j| j.is_root())
        .unwrap_or(false)
}
