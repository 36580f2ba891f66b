//! Driving the clause-exchange overlay on the current job's tree.
//!
//! Leaves start a round every exchange period; internal nodes merge their
//! children's buffers with their own export and pass the result towards the
//! root, which broadcasts the merged buffer back down for digestion.

use crate::state::WorkerState;
use satswarm_core::Action;
use satswarm_messages::{JobMessage, JobMessageTag, Message};
use satswarm_types::JobId;
use satswarm_job::{comm_epoch, merge_cap, merge_clause_buffers, PendingShare, ShareKind};
use satswarm_job::JobState;
use tracing::{debug, trace};

impl WorkerState {
    /// Called from the compute tick for the current job: leaves (and lone
    /// roots) open a new round once per exchange period.
    pub(crate) fn maybe_initiate_sharing(&mut self, job_id: JobId) -> Vec<Action> {
        let period = self.config.clause_exchange_period();
        if period.is_zero() {
            return Vec::new();
        }
        let base_size = self.config.clause_exchange_base_size;
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return Vec::new();
        };
        if job.state() != JobState::Active || job.is_initializing() {
            return Vec::new();
        }
        if job.tree().has_left_child() || job.tree().has_right_child() {
            // Internal nodes join rounds when their children's buffers arrive.
            return Vec::new();
        }
        let epoch = comm_epoch(self.now, period);
        if epoch == 0 || job.sharing.already_shared(epoch) || job.sharing.pending.is_some() {
            return Vec::new();
        }

        trace!(job = %job.to_str(), epoch, "initiating clause exchange");
        job.sharing.pending = Some(PendingShare {
            kind: ShareKind::Initiate,
            epoch,
            depth: 0,
        });
        vec![Action::PrepareSharing {
            job_id,
            max_literals: base_size,
        }]
    }

    /// Callback with the solver's clause export.
    pub(crate) fn on_sharing_prepared(&mut self, job_id: JobId, buffer: Vec<i32>) -> Vec<Action> {
        let multiplier = self.config.clause_exchange_multiplier;
        let base_size = self.config.clause_exchange_base_size;
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return Vec::new();
        };
        let Some(pending) = job.sharing.pending.take() else {
            return Vec::new();
        };
        if job.state() != JobState::Active || job.is_initializing() {
            return Vec::new();
        }

        match pending.kind {
            ShareKind::Initiate => {
                job.sharing.mark_shared(pending.epoch);
                if job.is_root() {
                    // No other fragments: learn the own collected clauses.
                    if job.sharing.try_digest(pending.epoch) && !buffer.is_empty() {
                        return vec![Action::DigestSharing { job_id, buffer }];
                    }
                    return Vec::new();
                }
                let parent = job.tree().parent_rank().expect("non-root has a parent");
                debug!(job = %job.to_str(), epoch = pending.epoch, size = buffer.len(), "sending clauses up");
                vec![Action::SendTo {
                    to: parent,
                    message: Message::JobCommunication(JobMessage {
                        job_id,
                        epoch: pending.epoch,
                        tag: JobMessageTag::GatherClauses,
                        depth: 0,
                        payload: buffer,
                    }),
                }]
            }
            ShareKind::Forward => {
                let mut buffers = job.sharing.take_buffers();
                buffers.push(buffer);
                let cap = merge_cap(base_size, multiplier, pending.depth);
                let merged =
                    merge_clause_buffers(&buffers, (cap as f64 * multiplier) as usize);
                job.sharing.mark_shared(pending.epoch);
                debug!(
                    job = %job.to_str(),
                    epoch = pending.epoch,
                    buffers = buffers.len(),
                    merged = merged.len(),
                    "merged clause buffers"
                );

                if job.is_root() {
                    self.learn_and_distribute(job_id, merged, pending.epoch, pending.depth)
                } else {
                    let parent = job.tree().parent_rank().expect("non-root has a parent");
                    vec![Action::SendTo {
                        to: parent,
                        message: Message::JobCommunication(JobMessage {
                            job_id,
                            epoch: pending.epoch,
                            tag: JobMessageTag::GatherClauses,
                            depth: pending.depth + 1,
                            payload: merged,
                        }),
                    }]
                }
            }
        }
    }

    pub(crate) fn handle_job_communication(
        &mut self,
        from: satswarm_types::WorkerRank,
        msg: JobMessage,
    ) -> Vec<Action> {
        if !self.known_job(msg.job_id, "JOB_COMMUNICATION") {
            return Vec::new();
        }
        let job = self.jobs.get_mut(&msg.job_id).expect("checked above");
        if job.state() != JobState::Active {
            return Vec::new();
        }

        match msg.tag {
            JobMessageTag::GatherClauses => {
                trace!(from, job = %job.to_str(), epoch = msg.epoch, size = msg.payload.len(), "clauses received");
                if job.sharing.already_shared(msg.epoch) {
                    // Already contributed upward this round; hand the buffer
                    // back down instead.
                    debug!(job = %job.to_str(), epoch = msg.epoch, "already shared this round, distributing");
                    let (job_id, payload, epoch, depth) =
                        (msg.job_id, msg.payload, msg.epoch, msg.depth);
                    return self.learn_and_distribute(job_id, payload, epoch, depth);
                }

                job.sharing.collect_from_below(msg.payload, msg.epoch);
                let num_children = usize::from(job.tree().has_left_child())
                    + usize::from(job.tree().has_right_child());
                if job.sharing.can_share(num_children) && job.sharing.pending.is_none() {
                    let cap = merge_cap(
                        self.config.clause_exchange_base_size,
                        self.config.clause_exchange_multiplier,
                        msg.depth,
                    );
                    job.sharing.pending = Some(PendingShare {
                        kind: ShareKind::Forward,
                        epoch: msg.epoch,
                        depth: msg.depth,
                    });
                    return vec![Action::PrepareSharing {
                        job_id: msg.job_id,
                        max_literals: cap,
                    }];
                }
                Vec::new()
            }
            JobMessageTag::DistributeClauses => {
                self.learn_and_distribute(msg.job_id, msg.payload, msg.epoch, msg.depth)
            }
        }
    }

    /// Forward a merged buffer to both children and digest it locally if the
    /// job is fully initialized and the round is new.
    fn learn_and_distribute(
        &mut self,
        job_id: JobId,
        clauses: Vec<i32>,
        epoch: u32,
        depth: u32,
    ) -> Vec<Action> {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        for child in [job.tree().left_child_rank(), job.tree().right_child_rank()]
            .into_iter()
            .flatten()
        {
            actions.push(Action::SendTo {
                to: child,
                message: Message::JobCommunication(JobMessage {
                    job_id,
                    epoch,
                    tag: JobMessageTag::DistributeClauses,
                    depth,
                    payload: clauses.clone(),
                }),
            });
        }

        if clauses.is_empty() {
            return actions;
        }
        if job.state() != JobState::Active || job.is_initializing() {
            debug!(job = %job.to_str(), epoch, "dropping buffer: job not ready to digest");
            return actions;
        }
        if job.sharing.try_digest(epoch) {
            trace!(job = %job.to_str(), epoch, size = clauses.len(), "digesting merged buffer");
            actions.push(Action::DigestSharing {
                job_id,
                buffer: clauses,
            });
        } else {
            debug!(job = %job.to_str(), epoch, "dropping buffer from stale round");
        }
        actions
    }
}
