//! Ad-hoc butterfly all-reduction.
//!
//! For data that must aggregate more than a scalar (resource histograms,
//! sorted remainder sequences), the balancer uses a hand-rolled butterfly
//! over the fleet: for power-of-two step k = 2, 4, …, ascending, rank r sends
//! to r − k/2 if r mod k = k/2, or receives from r + k/2 if r mod k = 0.
//! Ranks with empty contributions exclude themselves and propagate exclusion
//! to the next step. The broadcast descends the same tree in reverse.
//!
//! Sans-I/O: sends are returned as `(rank, payload)` pairs and receipts enter
//! through [`AllReduce::handle`]. A receipt advances the caller's phase;
//! phases never overlap on a single worker.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::trace;

/// Data aggregated by the butterfly.
pub trait Reduceable: Clone + Serialize + DeserializeOwned {
    /// Fold another contribution into this one. Must be commutative and
    /// associative.
    fn merge(&mut self, other: &Self);

    /// An empty contribution excludes its rank from the rest of the
    /// collective.
    fn is_empty(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Reducing,
    Broadcasting,
    Done,
}

/// One reduce-then-broadcast collective over all fleet ranks.
pub struct AllReduce<T: Reduceable> {
    rank: u32,
    size: u32,
    data: T,
    phase: Phase,
    /// Current power-of-two step.
    power: u32,
    highest_power: u32,
    excluded: BTreeSet<u32>,
    /// Whether empty contributions drop ranks from the collective. Scalar
    /// all-reduces keep everyone in.
    use_exclusion: bool,
}

type Sends = Vec<(u32, Vec<u8>)>;

impl<T: Reduceable> AllReduce<T> {
    /// Start the collective. Returns the machine, whether it is already done
    /// (single rank, or this rank excluded), and the initial sends.
    pub fn start(
        rank: u32,
        size: u32,
        data: T,
        excluded: BTreeSet<u32>,
        use_exclusion: bool,
    ) -> (Self, bool, Sends) {
        let highest_power = 2u32 << (size as f64).log2().ceil() as u32;
        let mut this = Self {
            rank,
            size,
            data,
            phase: Phase::Reducing,
            power: 2,
            highest_power,
            excluded,
            use_exclusion,
        };

        if this.use_exclusion && this.excluded.contains(&rank) {
            this.phase = Phase::Done;
            return (this, true, Vec::new());
        }

        let mut sends = Vec::new();
        let waiting = this.run_reduce(&mut sends);
        if waiting {
            return (this, false, sends);
        }
        let done = this.enter_broadcast(&mut sends);
        (this, done, sends)
    }

    /// Feed one received payload. Returns whether the collective finished and
    /// the follow-up sends.
    pub fn handle(&mut self, from: u32, payload: &[u8]) -> (bool, Sends) {
        let mut sends = Vec::new();
        match self.phase {
            Phase::Reducing => {
                let received: T =
                    bincode::deserialize(payload).expect("reduceable payloads are well-formed");
                if self.use_exclusion && received.is_empty() {
                    trace!(from, "empty contribution, excluding rank");
                    self.excluded.insert(from);
                }
                self.data.merge(&received);

                self.power *= 2;
                if self.run_reduce(&mut sends) {
                    return (false, sends);
                }
                let done = self.enter_broadcast(&mut sends);
                (done, sends)
            }
            Phase::Broadcasting => {
                // Overwrite local data with the descending global result.
                self.data =
                    bincode::deserialize(payload).expect("reduceable payloads are well-formed");
                self.power /= 2;
                let done = self.run_broadcast(&mut sends);
                if done {
                    self.phase = Phase::Done;
                }
                (done, sends)
            }
            Phase::Done => (true, sends),
        }
    }

    /// The aggregated value (the global result once done).
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Ranks excluded by empty contributions, carried into later phases.
    pub fn excluded(&self) -> &BTreeSet<u32> {
        &self.excluded
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Whether the descending broadcast half is in progress.
    pub fn is_broadcasting(&self) -> bool {
        self.phase == Phase::Broadcasting
    }

    /// Walk the reduce schedule from the current power. Returns true if the
    /// collective is now waiting for a receive.
    fn run_reduce(&mut self, sends: &mut Sends) -> bool {
        while self.power <= self.highest_power {
            let half = self.power / 2;
            if self.rank % self.power == 0 && self.rank + half < self.size {
                if !(self.use_exclusion && self.excluded.contains(&(self.rank + half))) {
                    trace!(k = self.power, "reduce: awaiting contribution");
                    return true;
                }
            } else if self.rank % self.power == half {
                let to = self.rank - half;
                if !(self.use_exclusion && self.excluded.contains(&to)) {
                    sends.push((to, encode(&self.data)));
                }
            }
            self.power *= 2;
        }
        false
    }

    /// Reduce finished locally; switch to the descending broadcast. Returns
    /// true if the whole collective finished immediately.
    fn enter_broadcast(&mut self, sends: &mut Sends) -> bool {
        if self.use_exclusion && self.data.is_empty() {
            trace!("empty after reduction, not participating in broadcast");
            self.excluded.insert(self.rank);
            self.phase = Phase::Done;
            return true;
        }
        self.phase = Phase::Broadcasting;
        self.power = self.highest_power;
        let done = self.run_broadcast(sends);
        if done {
            self.phase = Phase::Done;
        }
        done
    }

    /// Walk the broadcast schedule from the current power. Returns true when
    /// this rank's part is complete.
    fn run_broadcast(&mut self, sends: &mut Sends) -> bool {
        while self.power >= 2 {
            let half = self.power / 2;
            if self.rank % self.power == 0 && self.rank + half < self.size {
                if !(self.use_exclusion && self.excluded.contains(&(self.rank + half))) {
                    sends.push((self.rank + half, encode(&self.data)));
                }
            } else if self.rank % self.power == half {
                trace!(k = self.power, "broadcast: awaiting data");
                return false;
            }
            self.power /= 2;
        }
        true
    }
}

fn encode<T: Serialize>(data: &T) -> Vec<u8> {
    bincode::serialize(data).expect("reduceable payloads are well-formed")
}

/// Element-wise float vector sum, the all-reduce workhorse for scalar
/// aggregates. Never excludes anyone.
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq)]
pub struct FloatVec(pub Vec<f64>);

impl Reduceable for FloatVec {
    fn merge(&mut self, other: &Self) {
        debug_assert_eq!(self.0.len(), other.0.len());
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a += b;
        }
    }

    fn is_empty(&self) -> bool {
        false
    }
}

/// Sorted distinct fractional remainders for bisection rounding.
#[derive(Debug, Clone, Default, Serialize, serde::Deserialize, PartialEq)]
pub struct SortedRemainders(pub Vec<f64>);

impl SortedRemainders {
    pub fn add(&mut self, value: f64) {
        match self.0.binary_search_by(|x| x.partial_cmp(&value).unwrap()) {
            Ok(_) => {}
            Err(pos) => self.0.insert(pos, value),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl Reduceable for SortedRemainders {
    fn merge(&mut self, other: &Self) {
        for &v in &other.0 {
            self.add(v);
        }
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet, VecDeque};

    /// Drive a full collective over `n` in-memory ranks, delivering messages
    /// in FIFO order, and return the final data at every rank.
    fn run_collective<T: Reduceable + PartialEq + std::fmt::Debug>(
        contributions: Vec<T>,
        use_exclusion: bool,
    ) -> Vec<AllReduce<T>> {
        let n = contributions.len() as u32;
        let mut queue: VecDeque<(u32, u32, Vec<u8>)> = VecDeque::new();
        let mut machines = Vec::new();
        let mut done = BTreeMap::new();

        for (rank, data) in contributions.into_iter().enumerate() {
            let (m, d, sends) =
                AllReduce::start(rank as u32, n, data, BTreeSet::new(), use_exclusion);
            for (to, payload) in sends {
                queue.push_back((rank as u32, to, payload));
            }
            done.insert(rank as u32, d);
            machines.push(m);
        }

        let mut steps = 0;
        while let Some((from, to, payload)) = queue.pop_front() {
            steps += 1;
            assert!(steps < 10_000, "collective did not converge");
            let (d, sends) = machines[to as usize].handle(from, &payload);
            for (next_to, next_payload) in sends {
                queue.push_back((to, next_to, next_payload));
            }
            *done.get_mut(&to).unwrap() |= d;
        }

        assert!(done.values().all(|&d| d), "every rank must finish");
        machines
    }

    #[test]
    fn test_float_allreduce_sums_everywhere() {
        for n in [1usize, 2, 3, 4, 5, 8] {
            let contributions: Vec<FloatVec> = (0..n)
                .map(|r| FloatVec(vec![r as f64 + 1.0, 1.0]))
                .collect();
            let machines = run_collective(contributions, false);
            let expected = FloatVec(vec![(n * (n + 1) / 2) as f64, n as f64]);
            for m in &machines {
                assert_eq!(m.data(), &expected, "n={n}");
            }
        }
    }

    #[test]
    fn test_remainders_allreduce_with_exclusion() {
        // Ranks 1 and 3 contribute nothing and drop out; the rest converge on
        // the sorted distinct union.
        let contributions = vec![
            SortedRemainders(vec![0.5]),
            SortedRemainders(vec![]),
            SortedRemainders(vec![0.25, 0.5]),
            SortedRemainders(vec![]),
        ];
        let machines = run_collective(contributions, true);
        let expected = SortedRemainders(vec![0.25, 0.5]);
        for (rank, m) in machines.iter().enumerate() {
            if m.excluded().contains(&(rank as u32)) {
                continue;
            }
            assert_eq!(m.data(), &expected, "rank {rank}");
        }
        assert!(machines[0].excluded().contains(&1));
    }

    #[test]
    fn test_single_rank_completes_immediately() {
        let (m, done, sends) =
            AllReduce::start(0, 1, FloatVec(vec![3.0]), BTreeSet::new(), false);
        assert!(done);
        assert!(sends.is_empty());
        assert_eq!(m.data().0, vec![3.0]);
    }
}
