//! Seeded fleet permutations for request bouncing.

use crate::WorkerRank;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// A pseudorandom permutation over all fleet ranks, identical on every worker
/// for the same seed.
pub fn fleet_permutation(fleet_size: u32, seed: u64) -> Vec<WorkerRank> {
    let mut ranks: Vec<WorkerRank> = (0..fleet_size).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    ranks.shuffle(&mut rng);
    ranks
}

/// The request-specific bounce permutation: seeded by the job, the requested
/// slot, and the requester, so every hop of one request walks the same order.
pub fn bounce_permutation(
    fleet_size: u32,
    job_id: u64,
    requested_index: u32,
    requesting_rank: WorkerRank,
) -> Vec<WorkerRank> {
    let seed = 3u64
        .wrapping_mul(job_id)
        .wrapping_add(7 * requested_index as u64)
        .wrapping_add(11 * requesting_rank as u64);
    fleet_permutation(fleet_size, seed)
}

/// The derandomized bounce alternatives of `own_rank`: a contiguous window of
/// `count` neighbors around its position in the fleet-wide permutation
/// (seed 1). `count` must be even and less than the fleet size.
pub fn bounce_alternatives(
    fleet_size: u32,
    own_rank: WorkerRank,
    count: usize,
) -> Vec<WorkerRank> {
    assert!(count % 2 == 0, "bounce alternatives count must be even");
    assert!(
        (count as u32) < fleet_size,
        "fleet must be larger than the bounce alternative count"
    );

    let perm = fleet_permutation(fleet_size, 1);
    let pos = perm
        .iter()
        .position(|&r| r == own_rank)
        .expect("own rank present in fleet permutation") as i64;
    let n = fleet_size as i64;

    let mut alternatives = Vec::with_capacity(count);
    for j in (pos - count as i64 / 2)..pos {
        alternatives.push(perm[((j + n) % n) as usize]);
    }
    for j in (pos + 1)..=(pos + count as i64 / 2) {
        alternatives.push(perm[((j + n) % n) as usize]);
    }
    alternatives
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permutation_is_deterministic_and_complete() {
        let a = fleet_permutation(16, 1);
        let b = fleet_permutation(16, 1);
        assert_eq!(a, b);

        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_bounce_permutation_varies_by_request() {
        let a = bounce_permutation(16, 1, 0, 0);
        let b = bounce_permutation(16, 2, 0, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_bounce_alternatives_window() {
        let alts = bounce_alternatives(8, 3, 4);
        assert_eq!(alts.len(), 4);
        assert!(!alts.contains(&3));
        for r in alts {
            assert!(r < 8);
        }
    }

    #[test]
    #[should_panic(expected = "even")]
    fn test_bounce_alternatives_rejects_odd_count() {
        bounce_alternatives(8, 0, 3);
    }
}
