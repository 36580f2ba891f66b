//! The solver capability set consumed by the scheduler core.
//!
//! The scheduler sees nothing of a back-end's internals: a portfolio is a
//! [`PortfolioSolver`] behind a box, and every back-end (real SAT engines or
//! the scripted solver used by tests) implements the same surface.
//!
//! Contract highlights:
//!
//! - `solve` results are tri-valued; `Unknown` is reserved for interrupted
//!   searches.
//! - `interrupt` and `suspend` are safe to call from the scheduling context
//!   while `solve` runs elsewhere; `uninterrupt`/`resume` restore readiness
//!   without re-ingesting previously added literals.
//! - The learned-clause buffer behind `add_learned_clause` /
//!   `prepare_sharing` / `digest_sharing` is the only solver state touched
//!   from two contexts, and implementations guard it with a mutex.

mod scripted;

pub use scripted::{ScriptedControl, ScriptedSolver};

use satswarm_types::ResultCode;
use std::sync::Arc;

/// Callback a solver invokes on each newly learned clause — the push side of
/// clause export, feeding the adapter's learned-clause buffer as the search
/// runs.
pub type LearnedClauseCallback = Box<dyn FnMut(&[i32]) + Send>;

/// The thread-safe sub-surface of a solver: the calls the scheduling context
/// may issue while `solve` runs on a solver thread. Implementations back
/// these with internal flags the search loop observes.
pub trait SolverControl: Send + Sync {
    /// Make a running `solve` return `Unknown` as soon as it observes the
    /// flag.
    fn interrupt(&self);

    /// Clear the interrupt flag so the next `solve` runs normally.
    fn uninterrupt(&self);

    /// Pause the search in place; blocks only until the solver observes the
    /// request.
    fn suspend(&self);

    /// Resume a suspended search.
    fn resume(&self);
}

/// Outcome of a finished or interrupted search.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveOutcome {
    pub code: ResultCode,
    /// Satisfying assignment for SAT, failed assumptions for UNSAT.
    pub solution: Vec<i32>,
}

/// One search engine in a job's portfolio.
pub trait PortfolioSolver: Send {
    /// A cloneable handle for the thread-safe control calls, shared with the
    /// scheduling context before the solver moves onto its thread.
    fn control(&self) -> Arc<dyn SolverControl>;

    /// Ingest one formula literal (clauses are zero-terminated).
    fn add_literal(&mut self, literal: i32);

    /// Suggest an initial polarity for a variable.
    fn set_phase(&mut self, variable: i32, phase: bool);

    /// Diversify this instance against its portfolio siblings.
    fn diversify(&mut self, seed: u64);

    /// Run the search under the given assumptions until a verdict or an
    /// interrupt. Blocking; runs on a solver thread, never on the control
    /// thread.
    fn solve(&mut self, assumptions: &[i32]) -> SolveOutcome;

    /// The model found by the last SAT verdict.
    fn get_solution(&self) -> Vec<i32>;

    /// Assumptions refuted by the last UNSAT verdict.
    fn get_failed_assumptions(&self) -> Vec<i32>;

    /// Import one learned clause from a portfolio sibling.
    fn add_learned_clause(&mut self, clause: &[i32]);

    /// Register the push path for clause export: the solver invokes the
    /// callback once for every clause its search learns.
    fn set_learned_clause_callback(&mut self, callback: LearnedClauseCallback);

    /// Export up to `max_literals` of learned clauses in exchange format.
    fn prepare_sharing(&mut self, max_literals: usize) -> Vec<i32>;

    /// Import a merged exchange buffer.
    fn digest_sharing(&mut self, buffer: &[i32]);
}
