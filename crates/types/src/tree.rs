//! Binary job-tree bookkeeping.
//!
//! A job of volume `v` conceptually occupies tree indices `0..v`; a
//! prefix-connected subset of those indices is materialized as fragments on
//! workers. Each fragment tracks only plain peer ranks, never remote state.

use crate::{JobId, TreeIndex, WorkerRank};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Index of the left child of `index`.
pub fn left_child_index(index: TreeIndex) -> TreeIndex {
    2 * index + 1
}

/// Index of the right child of `index`.
pub fn right_child_index(index: TreeIndex) -> TreeIndex {
    2 * index + 2
}

/// Index of the parent of a non-root `index`.
pub fn parent_index(index: TreeIndex) -> TreeIndex {
    debug_assert!(index > 0);
    (index - 1) / 2
}

/// Preferred rank for a vacant tree slot, drawn from a permutation seeded by
/// the job and the slot so every fragment of a job agrees on it without
/// coordination. Skips `own_rank`.
pub fn preferred_rank(
    job_id: JobId,
    index: TreeIndex,
    fleet_size: u32,
    own_rank: WorkerRank,
) -> WorkerRank {
    let seed = job_id
        .0
        .wrapping_mul(0x9e3779b97f4a7c15)
        .wrapping_add(index as u64);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    if fleet_size <= 1 {
        return own_rank;
    }
    loop {
        let rank = rng.gen_range(0..fleet_size);
        if rank != own_rank {
            return rank;
        }
    }
}

/// Per-fragment view of one job's tree: this fragment's index plus the ranks
/// of the peers it talks to.
#[derive(Debug, Clone)]
pub struct JobTree {
    fleet_size: u32,
    own_rank: WorkerRank,
    job_id: JobId,
    index: TreeIndex,
    root_rank: WorkerRank,
    parent: Option<WorkerRank>,
    left: Option<WorkerRank>,
    right: Option<WorkerRank>,
}

impl JobTree {
    pub fn new(fleet_size: u32, own_rank: WorkerRank, job_id: JobId) -> Self {
        Self {
            fleet_size,
            own_rank,
            job_id,
            index: 0,
            root_rank: own_rank,
            parent: None,
            left: None,
            right: None,
        }
    }

    /// Re-seat this fragment at `index`. At the root, the parent pointer is
    /// cleared and this worker becomes the root rank.
    pub fn update(&mut self, index: TreeIndex, root_rank: WorkerRank, parent: WorkerRank) {
        self.index = index;
        if index == 0 {
            self.root_rank = self.own_rank;
            self.parent = None;
        } else {
            self.root_rank = root_rank;
            self.parent = Some(parent);
        }
    }

    pub fn fleet_size(&self) -> u32 {
        self.fleet_size
    }

    pub fn index(&self) -> TreeIndex {
        self.index
    }

    pub fn is_root(&self) -> bool {
        self.index == 0
    }

    pub fn root_rank(&self) -> WorkerRank {
        self.root_rank
    }

    pub fn parent_rank(&self) -> Option<WorkerRank> {
        self.parent
    }

    pub fn left_child_index(&self) -> TreeIndex {
        left_child_index(self.index)
    }

    pub fn right_child_index(&self) -> TreeIndex {
        right_child_index(self.index)
    }

    pub fn has_left_child(&self) -> bool {
        self.left.is_some()
    }

    pub fn has_right_child(&self) -> bool {
        self.right.is_some()
    }

    pub fn left_child_rank(&self) -> Option<WorkerRank> {
        self.left
    }

    pub fn right_child_rank(&self) -> Option<WorkerRank> {
        self.right
    }

    pub fn set_left_child(&mut self, rank: WorkerRank) {
        self.left = Some(rank);
    }

    pub fn set_right_child(&mut self, rank: WorkerRank) {
        self.right = Some(rank);
    }

    pub fn unset_left_child(&mut self) -> Option<WorkerRank> {
        self.left.take()
    }

    pub fn unset_right_child(&mut self) -> Option<WorkerRank> {
        self.right.take()
    }

    /// Where to send a growth request for the left slot: the attached child if
    /// any, else the job-seeded preferred rank.
    pub fn left_target_rank(&self) -> WorkerRank {
        self.left.unwrap_or_else(|| {
            preferred_rank(
                self.job_id,
                self.left_child_index(),
                self.fleet_size,
                self.own_rank,
            )
        })
    }

    /// Where to send a growth request for the right slot.
    pub fn right_target_rank(&self) -> WorkerRank {
        self.right.unwrap_or_else(|| {
            preferred_rank(
                self.job_id,
                self.right_child_index(),
                self.fleet_size,
                self.own_rank,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_math() {
        assert_eq!(left_child_index(0), 1);
        assert_eq!(right_child_index(0), 2);
        assert_eq!(left_child_index(2), 5);
        assert_eq!(parent_index(1), 0);
        assert_eq!(parent_index(2), 0);
        assert_eq!(parent_index(6), 2);
    }

    #[test]
    fn test_update_at_root_clears_parent() {
        let mut tree = JobTree::new(8, 3, JobId(1));
        tree.update(0, 99, 5);
        assert!(tree.is_root());
        assert_eq!(tree.root_rank(), 3);
        assert_eq!(tree.parent_rank(), None);

        tree.update(2, 0, 1);
        assert!(!tree.is_root());
        assert_eq!(tree.root_rank(), 0);
        assert_eq!(tree.parent_rank(), Some(1));
    }

    #[test]
    fn test_preferred_rank_agrees_across_workers() {
        // Two different workers must resolve the same vacant slot to the same
        // rank unless that rank is one of them.
        let a = preferred_rank(JobId(5), 3, 8, 0);
        let b = preferred_rank(JobId(5), 3, 8, 1);
        if a != 1 && b != 0 {
            assert_eq!(a, b);
        }
        assert!(a < 8);
    }
}
