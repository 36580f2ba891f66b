//! Event maps for event-driven balancing.
//!
//! An `EventMap` is this worker's belief about the last-seen (epoch, demand,
//! priority) of every live job. The per-key merge rule — larger epoch wins —
//! is commutative and associative, so maps converge under arbitrary message
//! reordering.

use crate::JobId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::error;

/// One job's last-known balancing event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    /// Per-job epoch, bumped by the root on every material change. Negative
    /// epochs mark long-terminated jobs and are never inserted.
    pub epoch: i64,
    pub demand: i32,
    pub priority: f32,
}

impl JobEvent {
    /// Whether this event supersedes `other` for the same job.
    pub fn dominates(&self, other: &JobEvent) -> bool {
        self.epoch > other.epoch
    }
}

/// Mapping from job id to its last-seen event, ordered by job id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMap {
    entries: BTreeMap<JobId, JobEvent>,
}

impl EventMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &BTreeMap<JobId, JobEvent> {
        &self.entries
    }

    pub fn get(&self, job_id: JobId) -> Option<&JobEvent> {
        self.entries.get(&job_id)
    }

    pub fn remove(&mut self, job_id: JobId) {
        self.entries.remove(&job_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Insert `ev` if it is new information: no entry for the job yet, or a
    /// dominating epoch that actually changes demand or priority. Returns
    /// whether the map changed.
    pub fn insert_if_novel(&mut self, ev: JobEvent) -> bool {
        if ev.epoch < 0 {
            return false;
        }
        match self.entries.get(&ev.job_id) {
            None => {
                self.entries.insert(ev.job_id, ev);
                true
            }
            Some(existing)
                if ev.dominates(existing)
                    && (ev.demand != existing.demand || ev.priority != existing.priority) =>
            {
                self.entries.insert(ev.job_id, ev);
                true
            }
            Some(_) => false,
        }
    }

    /// Merge `other` into this map: per key, the entry with the larger epoch
    /// wins.
    pub fn merge(&mut self, other: &EventMap) {
        for (job_id, ev) in &other.entries {
            match self.entries.get(job_id) {
                Some(existing) if !ev.dominates(existing) => {}
                _ => {
                    self.entries.insert(*job_id, *ev);
                }
            }
        }
    }

    /// Apply every entry of `other` through `insert_if_novel`. Returns whether
    /// anything changed.
    pub fn update_by(&mut self, other: &EventMap) -> bool {
        let mut changed = false;
        for ev in other.entries.values() {
            changed |= self.insert_if_novel(*ev);
        }
        changed
    }

    /// Drop entries that `other` already covers with an equal or newer epoch.
    /// Equal epochs must agree on demand and priority; disagreement is a
    /// protocol bug and is logged at high severity.
    pub fn filter_by(&mut self, other: &EventMap) {
        self.entries.retain(|job_id, ev| {
            let Some(other_ev) = other.entries.get(job_id) else {
                return true;
            };
            if other_ev.epoch == ev.epoch
                && (other_ev.demand != ev.demand || other_ev.priority != ev.priority)
            {
                error!(
                    job = %job_id,
                    epoch = ev.epoch,
                    demand = ev.demand,
                    other_demand = other_ev.demand,
                    priority = ev.priority,
                    other_priority = other_ev.priority,
                    "conflicting events at equal epoch"
                );
            }
            other_ev.epoch < ev.epoch
        });
    }

    /// Garbage-collect entries whose demand and priority have been zeroed
    /// (terminated jobs whose tombstone has been broadcast). Returns the
    /// removed job ids.
    pub fn remove_old_zeros(&mut self) -> Vec<JobId> {
        let removed: Vec<JobId> = self
            .entries
            .iter()
            .filter(|(_, ev)| ev.demand == 0 && ev.priority <= 0.0)
            .map(|(id, _)| *id)
            .collect();
        for id in &removed {
            self.entries.remove(id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(job: u64, epoch: i64, demand: i32, priority: f32) -> JobEvent {
        JobEvent {
            job_id: JobId(job),
            epoch,
            demand,
            priority,
        }
    }

    fn map(events: &[JobEvent]) -> EventMap {
        let mut m = EventMap::new();
        for e in events {
            m.insert_if_novel(*e);
        }
        m
    }

    #[test]
    fn test_merge_larger_epoch_wins() {
        let mut a = map(&[ev(1, 2, 4, 1.0), ev(2, 1, 1, 1.0)]);
        let b = map(&[ev(1, 5, 8, 1.0), ev(3, 1, 2, 2.0)]);
        a.merge(&b);
        assert_eq!(a.get(JobId(1)).unwrap().demand, 8);
        assert_eq!(a.get(JobId(2)).unwrap().demand, 1);
        assert_eq!(a.get(JobId(3)).unwrap().demand, 2);
    }

    #[test]
    fn test_merge_associative_commutative() {
        let a = map(&[ev(1, 3, 4, 1.0), ev(2, 1, 1, 1.0)]);
        let b = map(&[ev(1, 5, 8, 1.0), ev(3, 2, 2, 2.0)]);
        let c = map(&[ev(2, 4, 7, 1.0), ev(3, 1, 9, 0.5)]);

        // (A ⊕ B) ⊕ C
        let mut ab = a.clone();
        ab.merge(&b);
        let mut ab_c = ab;
        ab_c.merge(&c);

        // A ⊕ (B ⊕ C)
        let mut bc = b.clone();
        bc.merge(&c);
        let mut a_bc = a.clone();
        a_bc.merge(&bc);

        assert_eq!(ab_c, a_bc);

        // A ⊕ B == B ⊕ A
        let mut ab2 = a.clone();
        ab2.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab2, ba);
    }

    #[test]
    fn test_update_by_converges_regardless_of_order() {
        let broadcasts = [
            map(&[ev(1, 1, 1, 1.0)]),
            map(&[ev(1, 2, 4, 1.0), ev(2, 1, 1, 2.0)]),
            map(&[ev(2, 3, 6, 2.0)]),
        ];

        let mut forward = EventMap::new();
        for b in &broadcasts {
            forward.update_by(b);
        }

        let mut backward = EventMap::new();
        for b in broadcasts.iter().rev() {
            backward.update_by(b);
        }

        assert_eq!(forward, backward);
    }

    #[test]
    fn test_insert_if_novel_requires_material_change() {
        let mut m = map(&[ev(1, 1, 4, 1.0)]);
        // Same demand and priority at a newer epoch is not novel.
        assert!(!m.insert_if_novel(ev(1, 2, 4, 1.0)));
        assert!(m.insert_if_novel(ev(1, 2, 5, 1.0)));
        // Negative epochs never insert.
        assert!(!m.insert_if_novel(ev(9, -1, 3, 1.0)));
    }

    #[test]
    fn test_remove_old_zeros() {
        let mut m = map(&[ev(1, 4, 0, 0.0), ev(2, 2, 3, 1.0)]);
        let removed = m.remove_old_zeros();
        assert_eq!(removed, vec![JobId(1)]);
        assert!(m.get(JobId(1)).is_none());
        assert!(m.get(JobId(2)).is_some());
    }

    #[test]
    fn test_filter_by_drops_covered_entries() {
        let mut diffs = map(&[ev(1, 2, 4, 1.0), ev(2, 5, 3, 1.0)]);
        let broadcast = map(&[ev(1, 3, 6, 1.0), ev(2, 4, 2, 1.0)]);
        diffs.filter_by(&broadcast);
        assert!(diffs.get(JobId(1)).is_none());
        assert!(diffs.get(JobId(2)).is_some());
    }
}
