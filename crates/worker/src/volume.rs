//! Volume application: tree contraction and growth emerge from every
//! fragment applying the same rule to the same volume.

use crate::state::WorkerState;
use satswarm_core::Action;
use satswarm_messages::Message;
use satswarm_types::{JobId, JobRequest, WorkerRank};
use satswarm_job::JobState;
use tracing::debug;

impl WorkerState {
    pub(crate) fn handle_update_volume(
        &mut self,
        _from: WorkerRank,
        job_id: JobId,
        volume: u32,
    ) -> Vec<Action> {
        if !self.known_job(job_id, "UPDATE_VOLUME") {
            return Vec::new();
        }
        self.balancer.update_volume(job_id, volume);
        self.apply_volume(job_id, volume)
    }

    pub(crate) fn handle_query_volume(&mut self, from: WorkerRank, job_id: JobId) -> Vec<Action> {
        if !self.known_job(job_id, "QUERY_VOLUME") {
            return Vec::new();
        }
        // No volume for this job yet: ignore, the child will hear about it
        // with the next epoch.
        let Some(volume) = self.balancer.volume_of(job_id) else {
            return Vec::new();
        };
        debug!(to = from, job = %job_id, volume, "answering volume query");
        vec![Action::SendTo {
            to: from,
            message: Message::UpdateVolume { job_id, volume },
        }]
    }

    /// Apply a new volume for a job at this fragment:
    ///
    /// - propagate to attached children, pruning those whose index falls
    ///   outside the volume (they learn the details from their own update);
    /// - grow vacant child slots that fall inside the volume;
    /// - suspend this fragment if its own index fell outside.
    pub(crate) fn apply_volume(&mut self, job_id: JobId, volume: u32) -> Vec<Action> {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return Vec::new();
        };
        job.set_last_volume(volume, self.epoch.epoch());

        if job.state() != JobState::Active {
            return Vec::new();
        }

        let mut actions = Vec::new();
        let this_index = job.tree().index();
        if this_index == 0 {
            debug!(job = %job.to_str(), volume, "updating volume");
        }

        let has_commitment = self.commitments.contains_key(&job_id);
        let has_description = job.has_description();
        let root_rank = job.tree().root_rank();

        // Left child
        let next_index = job.tree().left_child_index();
        if let Some(child) = job.tree().left_child_rank() {
            actions.push(Action::SendTo {
                to: child,
                message: Message::UpdateVolume { job_id, volume },
            });
            if next_index >= volume {
                debug!(job = %job.to_str(), child, "pruning left child");
                job.tree_mut().unset_left_child();
                job.add_past_child(child);
            }
        } else if has_description && next_index < volume && !has_commitment {
            let req = JobRequest::new(
                job_id,
                root_rank,
                self.rank,
                next_index,
                self.now,
                self.epoch.epoch(),
            );
            let to = job.tree().left_target_rank();
            actions.push(Action::SendTo {
                to,
                message: Message::FindNode(req),
            });
        }

        // Right child
        let next_index = job.tree().right_child_index();
        if let Some(child) = job.tree().right_child_rank() {
            actions.push(Action::SendTo {
                to: child,
                message: Message::UpdateVolume { job_id, volume },
            });
            if next_index >= volume {
                debug!(job = %job.to_str(), child, "pruning right child");
                job.tree_mut().unset_right_child();
                job.add_past_child(child);
            }
        } else if has_description && next_index < volume && !has_commitment {
            let req = JobRequest::new(
                job_id,
                root_rank,
                self.rank,
                next_index,
                self.now,
                self.epoch.epoch(),
            );
            let to = job.tree().right_target_rank();
            actions.push(Action::SendTo {
                to,
                message: Message::FindNode(req),
            });
        }

        // Shrink: this fragment itself fell outside the tree.
        if this_index > 0 && this_index >= volume {
            job.suspend();
            actions.push(Action::SuspendSolver { job_id });
            self.set_load(0, job_id);
        }
        actions
    }

    /// A freshly initialized fragment wires itself into volume propagation.
    pub(crate) fn on_solver_started(&mut self, job_id: JobId) -> Vec<Action> {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return Vec::new();
        };
        if job.state() != JobState::Active {
            // Suspended or terminated while initializing.
            return Vec::new();
        }
        job.set_initialized();
        debug!(job = %job.to_str(), "solver initialized");

        if job.is_root() {
            if let Some(volume) = self.balancer.volume_of(job_id) {
                return self.apply_volume(job_id, volume);
            }
            Vec::new()
        } else {
            let Some(parent) = job.tree().parent_rank() else {
                return Vec::new();
            };
            vec![Action::SendTo {
                to: parent,
                message: Message::QueryVolume { job_id },
            }]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkerConfig;
    use satswarm_core::StateMachine;
    use satswarm_types::{JobDescription, JobId, JobRequest};
    use std::sync::Arc;
    use std::time::Duration;

    fn active_root_worker(fleet: u32) -> (WorkerState, JobId) {
        let mut w = WorkerState::new(0, fleet, WorkerConfig::default(), 1);
        w.set_time(Duration::from_secs(1));
        let job_id = JobId(1);
        let req = JobRequest::new(job_id, 0, 3, 0, Duration::ZERO, 0);
        w.create_job(job_id);
        let job = w.jobs.get_mut(&job_id).unwrap();
        job.commit(req);
        job.set_description(Arc::new(JobDescription::new(
            job_id,
            1.0,
            vec![1, 0],
            vec![],
        )));
        job.start(Duration::from_secs(1));
        job.set_initialized();
        w.set_load(1, job_id);
        (w, job_id)
    }

    #[test]
    fn test_growth_mints_requests_for_both_children() {
        let (mut w, job_id) = active_root_worker(8);
        let actions = w.apply_volume(job_id, 3);
        let requests: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                Action::SendTo {
                    message: Message::FindNode(req),
                    ..
                } => Some(req.requested_node_index),
                _ => None,
            })
            .collect();
        assert_eq!(requests, vec![1, 2]);
    }

    #[test]
    fn test_volume_application_is_idempotent() {
        let (mut w, job_id) = active_root_worker(8);
        let job = w.jobs.get_mut(&job_id).unwrap();
        job.tree_mut().set_left_child(4);
        job.tree_mut().set_right_child(5);

        let first = w.apply_volume(job_id, 2);
        let state_after_first = (
            w.jobs[&job_id].tree().has_left_child(),
            w.jobs[&job_id].tree().has_right_child(),
            w.jobs[&job_id].last_volume(),
            w.jobs[&job_id].state(),
        );
        let _second = w.apply_volume(job_id, 2);
        let state_after_second = (
            w.jobs[&job_id].tree().has_left_child(),
            w.jobs[&job_id].tree().has_right_child(),
            w.jobs[&job_id].last_volume(),
            w.jobs[&job_id].state(),
        );
        assert_eq!(state_after_first, state_after_second);
        // First application prunes the right child (index 2 ≥ volume 2).
        assert!(state_after_first.0);
        assert!(!state_after_first.1);
        assert!(first
            .iter()
            .any(|a| matches!(a, Action::SendTo { to: 5, .. })));
    }

    #[test]
    fn test_non_root_fragment_suspends_when_outside_volume() {
        let mut w = WorkerState::new(2, 8, WorkerConfig::default(), 1);
        w.set_time(Duration::from_secs(1));
        let job_id = JobId(1);
        let req = JobRequest::new(job_id, 0, 0, 2, Duration::ZERO, 0);
        w.create_job(job_id);
        let job = w.jobs.get_mut(&job_id).unwrap();
        job.commit(req);
        job.set_description(Arc::new(JobDescription::new(
            job_id,
            1.0,
            vec![1, 0],
            vec![],
        )));
        job.start(Duration::from_secs(1));
        job.set_initialized();
        w.set_load(1, job_id);

        let actions = w.apply_volume(job_id, 2);
        assert_eq!(w.jobs[&job_id].state(), satswarm_job::JobState::Suspended);
        assert!(w.is_idle());
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SuspendSolver { .. })));
    }
}
