//! The placement protocol: request bouncing, adoption, the three-way commit
//! handshake, description transfer, and defection handling.

use crate::state::{IntroducedJob, WorkerState};
use rand::Rng;
use satswarm_core::Action;
use satswarm_messages::Message;
use satswarm_types::{
    bounce_permutation, JobDescription, JobId, JobRequest, JobSignature, TreeIndex, WorkerRank,
};
use satswarm_job::JobState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Requests older than this are logged as stale when they keep circulating.
const STALE_REQUEST_AGE: Duration = Duration::from_secs(60);

impl WorkerState {
    /// Hop cap: root-slot requests may preempt, so they travel less far.
    pub(crate) fn max_job_hops(&self, root_request: bool) -> u32 {
        if root_request {
            self.fleet_size / 2
        } else {
            self.fleet_size * 2
        }
    }

    /// A request is obsolete once this worker has seen a newer balancing
    /// epoch for its job.
    pub(crate) fn is_request_obsolete(&self, req: &JobRequest) -> bool {
        self.jobs
            .get(&req.job_id)
            .map(|job| job.volume_epoch() > req.epoch)
            .unwrap_or(false)
    }

    // ─── Job introduction (client side) ───

    /// This worker becomes the introducer of a new job: it keeps the
    /// description and mints the root-slot placement request.
    pub(crate) fn on_submit_job(
        &mut self,
        description: JobDescription,
        client_rank: WorkerRank,
    ) -> Vec<Action> {
        let job_id = description.job_id;
        info!(job = %job_id, client_rank, "introducing job");
        self.introduced.insert(
            job_id,
            IntroducedJob {
                description: Arc::new(description),
                root_rank: None,
            },
        );

        let req = JobRequest::new(job_id, self.rank, self.rank, 0, self.now, self.epoch.epoch());
        // Start the search locally; an idle introducer adopts the root
        // itself, a busy one bounces the request onward.
        self.handle_find_node(self.rank, req)
    }

    // ─── FIND_NODE ───

    pub(crate) fn handle_find_node(&mut self, from: WorkerRank, req: JobRequest) -> Vec<Action> {
        if self.is_request_obsolete(&req) {
            debug!(
                job = %req.job_id,
                index = req.requested_node_index,
                born = req.time_of_birth.as_secs_f64(),
                "discarding obsolete request"
            );
            return Vec::new();
        }
        if self.now.saturating_sub(req.time_of_birth) > STALE_REQUEST_AGE {
            debug!(job = %req.job_id, hops = req.num_hops, "stale request still circulating");
        }

        // Already finished to this worker's knowledge?
        if self
            .jobs
            .get(&req.job_id)
            .map(|j| j.state() == JobState::Past)
            .unwrap_or(false)
        {
            debug!(job = %req.job_id, "discarding request: job already finished");
            return Vec::new();
        }

        let mut actions = Vec::new();
        let max_hops = self.max_job_hops(req.is_root_request());
        let mut adopts = false;

        if self.is_idle() && !self.has_commitments() {
            // Idle and uncommitted: adopt.
            adopts = true;
        } else if req.num_hops > max_hops && !req.is_root_request() {
            debug!(
                job = %req.job_id,
                index = req.requested_node_index,
                hops = req.num_hops,
                "discarding request beyond hop cap"
            );
            return Vec::new();
        } else if req.num_hops > max_hops && req.is_root_request() && !self.has_commitments() {
            // A starving root may displace an active non-root leaf.
            let computes_on_it = self
                .jobs
                .get(&req.job_id)
                .map(|j| j.state() == JobState::Active)
                .unwrap_or(false);
            if !computes_on_it {
                if let Some(current_id) = self.current_job {
                    let current = self.jobs.get_mut(&current_id).expect("current job exists");
                    if current.state() == JobState::Active
                        && !current.is_root()
                        && !current.tree().has_left_child()
                        && !current.tree().has_right_child()
                    {
                        info!(
                            suspended = %current.to_str(),
                            starving = %req.job_id,
                            "suspending leaf to adopt starving root"
                        );
                        if let Some(parent) = current.tree().parent_rank() {
                            actions.push(Action::SendTo {
                                to: parent,
                                message: Message::WorkerDefecting {
                                    job_id: current_id,
                                    index: current.tree().index(),
                                },
                            });
                        }
                        current.suspend();
                        actions.push(Action::SuspendSolver { job_id: current_id });
                        self.set_load(0, current_id);
                        adopts = true;
                    }
                }
            }
        }

        if adopts {
            debug_assert!(self.is_idle(), "adopting while not idle");
            info!(
                job = %req.job_id,
                index = req.requested_node_index,
                hops = req.num_hops,
                "adopting"
            );

            let mut req = req;
            if !self.jobs.contains_key(&req.job_id) {
                self.create_job(req.job_id);
                req.full_transfer = true;
            } else if !self.jobs[&req.job_id].has_description() {
                req.full_transfer = true;
            } else {
                req.full_transfer = false;
            }

            let requester = req.requesting_node_rank;
            self.jobs
                .get_mut(&req.job_id)
                .expect("job just ensured")
                .commit(req.clone());
            self.commitments.insert(req.job_id, req.clone());
            actions.push(Action::SendTo {
                to: requester,
                message: Message::RequestBecomeChild(req),
            });
        } else {
            actions.extend(self.bounce_job_request(req, from));
        }
        actions
    }

    /// Forward a request to the "next" worker.
    pub(crate) fn bounce_job_request(
        &mut self,
        mut req: JobRequest,
        sender: WorkerRank,
    ) -> Vec<Action> {
        req.num_hops += 1;
        let hops = req.num_hops;
        if hops >= 512 && hops.is_power_of_two() {
            warn!(job = %req.job_id, index = req.requested_node_index, hops, "request keeps bouncing");
        }

        let next = if self.config.derandomize {
            // Uniform draw from the fixed alternatives, skipping the
            // requester and the sender.
            let mut next = self.bounce_alts[self.rng.gen_range(0..self.bounce_alts.len())];
            let mut tries = 0;
            while (next == req.requesting_node_rank || next == sender)
                && tries < 4 * self.bounce_alts.len()
            {
                next = self.bounce_alts[self.rng.gen_range(0..self.bounce_alts.len())];
                tries += 1;
            }
            next
        } else {
            // Walk the request's own pseudorandom permutation, one position
            // per hop.
            let n = self.fleet_size;
            let perm = bounce_permutation(
                n,
                req.job_id.0,
                req.requested_node_index,
                req.requesting_node_rank,
            );
            let mut idx = (req.num_hops % n) as usize;
            let mut next = perm[idx];
            let mut tries = 0;
            while (next == self.rank || next == req.requesting_node_rank || next == sender)
                && tries < n
            {
                idx = (idx + 1) % n as usize;
                next = perm[idx];
                tries += 1;
            }
            next
        };

        vec![Action::SendTo {
            to: next,
            message: Message::FindNode(req),
        }]
    }

    // ─── REQUEST_BECOME_CHILD (requester side) ───

    pub(crate) fn handle_request_become_child(
        &mut self,
        from: WorkerRank,
        req: JobRequest,
    ) -> Vec<Action> {
        debug!(from, job = %req.job_id, index = req.requested_node_index, "offer to join tree");

        // Root-slot offers land at the introducer.
        if req.is_root_request() {
            return self.accept_root_offer(from, req);
        }

        if !self.known_job(req.job_id, "REQUEST_BECOME_CHILD") {
            return vec![Action::SendTo {
                to: from,
                message: Message::RejectBecomeChild(req),
            }];
        }

        let job = &self.jobs[&req.job_id];
        let mut reject = false;
        if self.is_request_obsolete(&req) {
            debug!(from, job = %job.to_str(), "rejecting: obsolete epoch");
            reject = true;
        } else if job.state() != JobState::Active {
            debug!(from, job = %job.to_str(), state = job.state().as_str(), "rejecting: not active");
            reject = true;
        } else if req.requested_node_index == job.tree().left_child_index()
            && job.tree().has_left_child()
        {
            debug!(from, job = %job.to_str(), "rejecting: left child present");
            reject = true;
        } else if req.requested_node_index == job.tree().right_child_index()
            && job.tree().has_right_child()
        {
            debug!(from, job = %job.to_str(), "rejecting: right child present");
            reject = true;
        }

        if reject {
            return vec![Action::SendTo {
                to: from,
                message: Message::RejectBecomeChild(req),
            }];
        }

        let job = self.jobs.get_mut(&req.job_id).expect("checked above");
        let desc = job.description().expect("active job has description");
        let signature = JobSignature {
            job_id: req.job_id,
            root_rank: req.root_rank,
            revision: desc.revision(),
            transfer_size: desc.transfer_size(),
        };
        let mut actions = vec![Action::SendTo {
            to: from,
            message: Message::AcceptBecomeChild(signature),
        }];
        if req.full_transfer {
            info!(to = from, job = %req.job_id, index = req.requested_node_index, "will send description");
        } else {
            info!(to = from, job = %req.job_id, index = req.requested_node_index, "resuming child");
        }

        // The candidate will start or resume: record it as our child.
        if req.requested_node_index == job.tree().left_child_index() {
            job.tree_mut().set_left_child(from);
        } else if req.requested_node_index == job.tree().right_child_index() {
            job.tree_mut().set_right_child(from);
        }
        actions
    }

    fn accept_root_offer(&mut self, from: WorkerRank, req: JobRequest) -> Vec<Action> {
        let Some(intro) = self.introduced.get_mut(&req.job_id) else {
            warn!(from, job = %req.job_id, "root offer for a job not introduced here");
            return vec![Action::SendTo {
                to: from,
                message: Message::RejectBecomeChild(req),
            }];
        };
        if intro.root_rank.is_some() {
            debug!(from, job = %req.job_id, "rejecting duplicate root offer");
            return vec![Action::SendTo {
                to: from,
                message: Message::RejectBecomeChild(req),
            }];
        }
        intro.root_rank = Some(from);
        let signature = JobSignature {
            job_id: req.job_id,
            root_rank: from,
            revision: intro.description.revision(),
            transfer_size: intro.description.transfer_size(),
        };
        info!(root = from, job = %req.job_id, "root adopted");
        vec![Action::SendTo {
            to: from,
            message: Message::AcceptBecomeChild(signature),
        }]
    }

    // ─── REJECT / ACCEPT / ACK (candidate and parent sides) ───

    pub(crate) fn handle_reject_become_child(
        &mut self,
        from: WorkerRank,
        req: JobRequest,
    ) -> Vec<Action> {
        if !self.known_job(req.job_id, "REJECT_BECOME_CHILD") {
            return Vec::new();
        }
        let job = self.jobs.get_mut(&req.job_id).expect("checked above");
        if job.commitment().is_none() {
            // Commitment was already erased.
            return Vec::new();
        }
        debug!(from, job = %job.to_str(), "rejected: uncommitting");
        self.commitments.remove(&req.job_id);
        job.uncommit();
        if job.pending_termination().is_some() {
            return self.resolve_pending_termination(req.job_id);
        }
        Vec::new()
    }

    pub(crate) fn handle_accept_become_child(
        &mut self,
        from: WorkerRank,
        sig: JobSignature,
    ) -> Vec<Action> {
        let Some(req) = self.commitments.get(&sig.job_id).cloned() else {
            // An ACCEPT whose commitment is missing is ignored.
            debug!(from, job = %sig.job_id, "accept without commitment, ignoring");
            return Vec::new();
        };

        if req.full_transfer {
            debug!(job = %sig.job_id, size = sig.transfer_size, "acknowledging, awaiting description");
            return vec![Action::SendTo {
                to: from,
                message: Message::AckAcceptBecomeChild(req),
            }];
        }

        // Already holding a matching description: start or resume in place.
        let mut actions = Vec::new();
        let job = self.jobs.get_mut(&sig.job_id).expect("committed job exists");
        if job.pending_termination().is_some() {
            self.commitments.remove(&sig.job_id);
            let job = self.jobs.get_mut(&sig.job_id).expect("committed job exists");
            job.uncommit();
            return self.resolve_pending_termination(sig.job_id);
        }
        if job.state() != JobState::Past {
            info!(
                from,
                job = %sig.job_id,
                index = req.requested_node_index,
                state = job.state().as_str(),
                "starting or resuming in place"
            );
            match job.state() {
                JobState::Suspended => {
                    job.resume(self.now);
                    actions.push(Action::ResumeSolver { job_id: sig.job_id });
                }
                _ => {
                    let desc = job.description().expect("matching description present").clone();
                    job.start(self.now);
                    actions.push(start_solver_action(self, sig.job_id, desc));
                }
            }
            self.set_load(1, sig.job_id);
        }
        self.commitments.remove(&sig.job_id);
        actions
    }

    pub(crate) fn handle_ack_accept_become_child(
        &mut self,
        from: WorkerRank,
        req: JobRequest,
    ) -> Vec<Action> {
        // Introducer side of a root placement.
        if req.is_root_request() {
            if let Some(intro) = self.introduced.get(&req.job_id) {
                debug!(to = from, job = %req.job_id, "sending introduced description");
                return vec![Action::SendTo {
                    to: from,
                    message: Message::SendJobDescription {
                        job_id: req.job_id,
                        data: intro.description.to_bytes(),
                    },
                }];
            }
        }

        if !self.known_job(req.job_id, "ACK_ACCEPT_BECOME_CHILD") {
            return Vec::new();
        }
        let job = self.jobs.get_mut(&req.job_id).expect("checked above");

        if job.state() == JobState::Past {
            // Already terminated: an empty transfer tells the child to
            // uncommit, followed by the termination signal.
            return vec![
                Action::SendTo {
                    to: from,
                    message: Message::SendJobDescription {
                        job_id: req.job_id,
                        data: Vec::new(),
                    },
                },
                Action::SendTo {
                    to: from,
                    message: Message::Terminate { job_id: req.job_id },
                },
            ];
        }

        let desc = job.description().expect("non-past parent has description");
        let mut actions = vec![Action::SendTo {
            to: from,
            message: Message::SendJobDescription {
                job_id: req.job_id,
                data: desc.to_bytes(),
            },
        }];
        debug!(to = from, job = %job.to_str(), "sent description");

        if req.requested_node_index == job.tree().left_child_index() {
            job.tree_mut().set_left_child(from);
        } else if req.requested_node_index == job.tree().right_child_index() {
            job.tree_mut().set_right_child(from);
        }

        // Seed the fresh child with the current volume.
        if job.state() == JobState::Active {
            if let Some(volume) = self.balancer.volume_of(req.job_id) {
                debug!(to = from, volume, "propagating volume to new child");
                actions.push(Action::SendTo {
                    to: from,
                    message: Message::UpdateVolume {
                        job_id: req.job_id,
                        volume,
                    },
                });
            }
        }
        actions
    }

    // ─── SEND_JOB_DESCRIPTION (candidate side) ───

    pub(crate) fn handle_send_description(
        &mut self,
        from: WorkerRank,
        job_id: JobId,
        data: Vec<u8>,
    ) -> Vec<Action> {
        if !self.known_job(job_id, "SEND_JOB_DESCRIPTION") {
            return Vec::new();
        }
        self.commitments.remove(&job_id);

        if data.is_empty() {
            // The job already terminated on the sender.
            debug!(job = %job_id, "empty description: uncommitting");
            let job = self.jobs.get_mut(&job_id).expect("checked above");
            if job.commitment().is_some() || job.state() == JobState::Committed {
                job.uncommit();
            }
            if job.pending_termination().is_some() {
                return self.resolve_pending_termination(job_id);
            }
            return Vec::new();
        }

        let description = match JobDescription::from_bytes(&data) {
            Ok(desc) => Arc::new(desc),
            Err(e) => {
                warn!(from, job = %job_id, error = %e, "undecodable description");
                return Vec::new();
            }
        };

        let job = self.jobs.get_mut(&job_id).expect("checked above");
        job.set_description(description.clone());

        if job.pending_termination().is_some() {
            // Ended while the transfer was in flight: never start computing.
            return self.resolve_pending_termination(job_id);
        }

        debug!(job = %job_id, size = data.len(), "received description, initializing");
        self.set_load(1, job_id);
        let job = self.jobs.get_mut(&job_id).expect("checked above");
        job.start(self.now);
        vec![start_solver_action(self, job_id, description)]
    }

    // ─── Defection ───

    pub(crate) fn handle_worker_defecting(
        &mut self,
        from: WorkerRank,
        job_id: JobId,
        index: TreeIndex,
    ) -> Vec<Action> {
        if !self.known_job(job_id, "WORKER_DEFECTING") {
            return Vec::new();
        }
        let job = self.jobs.get_mut(&job_id).expect("checked above");

        if job.tree().left_child_index() == index {
            job.tree_mut().unset_left_child();
        } else if job.tree().right_child_index() == index {
            job.tree_mut().unset_right_child();
        } else {
            tracing::error!(from, job = %job.to_str(), index, "unknown child is defecting");
            return Vec::new();
        }

        debug!(job = %job.to_str(), index, "finding replacement for defected child");
        let root_rank = job.tree().root_rank();
        let req = JobRequest::new(
            job_id,
            root_rank,
            self.rank,
            index,
            self.now,
            self.epoch.epoch(),
        );

        let next = if self.config.derandomize {
            self.bounce_alts[self.rng.gen_range(0..self.bounce_alts.len())]
        } else {
            self.random_other_worker()
        };
        vec![Action::SendTo {
            to: next,
            message: Message::FindNode(req),
        }]
    }

    /// Voluntarily depart a non-root slot: notify the parent, suspend the
    /// local fragment, and go idle. The parent re-requests the vacated index.
    pub fn defect(&mut self, job_id: JobId) -> Vec<Action> {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return Vec::new();
        };
        if job.state() != JobState::Active || job.is_root() {
            warn!(job = %job.to_str(), "cannot defect from this fragment");
            return Vec::new();
        }
        let mut actions = Vec::new();
        if let Some(parent) = job.tree().parent_rank() {
            actions.push(Action::SendTo {
                to: parent,
                message: Message::WorkerDefecting {
                    job_id,
                    index: job.tree().index(),
                },
            });
        }
        info!(job = %job.to_str(), "defecting");
        job.suspend();
        actions.push(Action::SuspendSolver { job_id });
        self.set_load(0, job_id);
        actions
    }

    /// A uniformly random rank other than this worker's own.
    pub(crate) fn random_other_worker(&mut self) -> WorkerRank {
        if self.fleet_size <= 1 {
            return self.rank;
        }
        loop {
            let rank = self.rng.gen_range(0..self.fleet_size);
            if rank != self.rank {
                return rank;
            }
        }
    }
}

/// Ingest-and-start command for a job, with the per-job thread count cut
/// down if the configured literal threshold is exceeded.
pub(crate) fn start_solver_action(
    state: &mut WorkerState,
    job_id: JobId,
    description: Arc<JobDescription>,
) -> Action {
    let threshold = state.config.solver_literal_threshold;
    let job = state.jobs.get_mut(&job_id).expect("job exists");
    if threshold > 0 && job.num_threads() as usize * description.formula_size() > threshold {
        let optimal = (threshold / description.formula_size().max(1)).max(1) as u32;
        info!(job = %job_id, threads = optimal, "literal threshold exceeded, cutting threads");
        job.set_num_threads(optimal);
    }
    Action::StartSolver {
        job_id,
        description,
        seed: job_id.0 ^ ((state.rank as u64) << 32),
        num_threads: job.num_threads(),
    }
}
