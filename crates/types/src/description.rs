//! Serialized job descriptions.

use crate::JobId;
use serde::{Deserialize, Serialize};

/// Error decoding a description transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionError(pub String);

impl std::fmt::Display for DescriptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid job description: {}", self.0)
    }
}

impl std::error::Error for DescriptionError {}

/// One revision of a job's payload: a clause formula (literals, clauses
/// terminated by 0) plus assumption literals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRevision {
    pub literals: Vec<i32>,
    pub assumptions: Vec<i32>,
}

/// The problem a job solves, created once at submission and immutable except
/// by appending amendments (new revisions).
///
/// Transferred lazily during placement: a worker that already holds a
/// matching description skips the transfer entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    pub job_id: JobId,
    /// Positive scheduling priority, weighed against other jobs by the
    /// balancer.
    pub priority: f32,
    /// Whether further revisions may arrive after a result.
    pub incremental: bool,
    /// Base payload (revision 0).
    pub base: JobRevision,
    /// Appended amendments; revision `r` is `amendments[r - 1]`.
    pub amendments: Vec<JobRevision>,
}

impl JobDescription {
    pub fn new(job_id: JobId, priority: f32, literals: Vec<i32>, assumptions: Vec<i32>) -> Self {
        Self {
            job_id,
            priority,
            incremental: false,
            base: JobRevision {
                literals,
                assumptions,
            },
            amendments: Vec::new(),
        }
    }

    /// Latest revision number (0 for the base payload).
    pub fn revision(&self) -> u32 {
        self.amendments.len() as u32
    }

    /// Total number of formula literals across all revisions.
    pub fn formula_size(&self) -> usize {
        self.base.literals.len()
            + self
                .amendments
                .iter()
                .map(|a| a.literals.len())
                .sum::<usize>()
    }

    /// Assumption literals of the latest revision.
    pub fn assumptions(&self) -> &[i32] {
        self.amendments
            .last()
            .map(|a| a.assumptions.as_slice())
            .unwrap_or(&self.base.assumptions)
    }

    /// Append an amendment, advancing the revision number.
    pub fn amend(&mut self, revision: JobRevision) {
        self.amendments.push(revision);
    }

    /// Serialize for a description transfer. Bit-for-bit stable across
    /// round-trips.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("description serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DescriptionError> {
        bincode::deserialize(bytes).map_err(|e| DescriptionError(e.to_string()))
    }

    /// Size of the full transfer in bytes.
    pub fn transfer_size(&self) -> u64 {
        bincode::serialized_size(self).expect("description serialization is infallible")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_bit_for_bit() {
        let mut desc = JobDescription::new(JobId(7), 1.5, vec![1, -2, 0, 3, 0], vec![4]);
        desc.amend(JobRevision {
            literals: vec![5, 0],
            assumptions: vec![-4],
        });

        let bytes = desc.to_bytes();
        let restored = JobDescription::from_bytes(&bytes).unwrap();
        assert_eq!(restored, desc);
        assert_eq!(restored.to_bytes(), bytes);
        assert_eq!(bytes.len() as u64, desc.transfer_size());
    }

    #[test]
    fn test_revision_accounting() {
        let mut desc = JobDescription::new(JobId(1), 1.0, vec![1, 0], vec![]);
        assert_eq!(desc.revision(), 0);
        assert_eq!(desc.formula_size(), 2);

        desc.amend(JobRevision {
            literals: vec![2, 3, 0],
            assumptions: vec![9],
        });
        assert_eq!(desc.revision(), 1);
        assert_eq!(desc.formula_size(), 5);
        assert_eq!(desc.assumptions(), &[9]);
    }
}
