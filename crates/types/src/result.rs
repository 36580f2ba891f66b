//! Job results.

use crate::JobId;
use serde::{Deserialize, Serialize};

/// Tri-valued solve verdict. `Unknown` is reserved for interrupted searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Sat,
    Unsat,
    Unknown,
}

/// Full result of a job, delivered to the client on request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub revision: u32,
    pub code: ResultCode,
    /// Satisfying assignment for SAT verdicts, failed assumptions for UNSAT,
    /// empty otherwise.
    pub solution: Vec<i32>,
}

impl JobResult {
    /// Advertised size of the full result transfer, in bytes.
    pub fn transfer_size(&self) -> u64 {
        bincode::serialized_size(self).expect("result serialization is infallible")
    }
}
