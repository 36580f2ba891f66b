//! A scripted solver back-end for tests and simulation.

use crate::{LearnedClauseCallback, PortfolioSolver, SolveOutcome, SolverControl};
use parking_lot::Mutex;
use satswarm_types::ResultCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Flag-based control handle shared between the scheduling context and the
/// solver thread.
#[derive(Debug, Default)]
pub struct ScriptedControl {
    interrupted: AtomicBool,
    suspended: AtomicBool,
}

impl SolverControl for ScriptedControl {
    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn uninterrupt(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }

    fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }
}

/// Deterministic stand-in for a real search engine.
///
/// `solve` returns the scripted outcome immediately (or `Unknown` if
/// interrupted first); sharing calls operate on a real mutex-guarded clause
/// buffer so the exchange overlay is exercised end to end.
pub struct ScriptedSolver {
    outcome: Option<SolveOutcome>,
    literals: Vec<i32>,
    control: Arc<ScriptedControl>,
    learned: Mutex<Vec<i32>>,
    on_learned: Option<LearnedClauseCallback>,
    last_solution: Vec<i32>,
    last_failed: Vec<i32>,
}

impl ScriptedSolver {
    /// A solver that never finds a verdict on its own.
    pub fn new() -> Self {
        Self {
            outcome: None,
            literals: Vec::new(),
            control: Arc::new(ScriptedControl::default()),
            learned: Mutex::new(vec![0]),
            on_learned: None,
            last_solution: Vec::new(),
            last_failed: Vec::new(),
        }
    }

    /// A solver that reports `outcome` on the next `solve` call.
    pub fn with_outcome(outcome: SolveOutcome) -> Self {
        let mut solver = Self::new();
        solver.outcome = Some(outcome);
        solver
    }

    /// Number of formula literals ingested so far.
    pub fn num_literals(&self) -> usize {
        self.literals.len()
    }

    pub fn is_suspended(&self) -> bool {
        self.control.suspended.load(Ordering::SeqCst)
    }

    /// Script hook: the search "learns" a clause. It lands in the export
    /// buffer and fires the registered callback, exactly like a real engine
    /// reporting a fresh conflict clause.
    pub fn learn_clause(&mut self, clause: &[i32]) {
        {
            let mut learned = self.learned.lock();
            learned.extend_from_slice(clause);
            learned.push(0);
            learned[0] += 1;
        }
        if let Some(callback) = self.on_learned.as_mut() {
            callback(clause);
        }
    }
}

impl Default for ScriptedSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PortfolioSolver for ScriptedSolver {
    fn control(&self) -> Arc<dyn SolverControl> {
        self.control.clone()
    }

    fn add_literal(&mut self, literal: i32) {
        self.literals.push(literal);
    }

    fn set_phase(&mut self, _variable: i32, _phase: bool) {}

    fn diversify(&mut self, _seed: u64) {}

    fn solve(&mut self, assumptions: &[i32]) -> SolveOutcome {
        if self.control.interrupted.load(Ordering::SeqCst) {
            return SolveOutcome {
                code: ResultCode::Unknown,
                solution: Vec::new(),
            };
        }
        match self.outcome.clone() {
            Some(outcome) => {
                match outcome.code {
                    ResultCode::Sat => self.last_solution = outcome.solution.clone(),
                    ResultCode::Unsat => self.last_failed = assumptions.to_vec(),
                    ResultCode::Unknown => {}
                }
                outcome
            }
            None => SolveOutcome {
                code: ResultCode::Unknown,
                solution: Vec::new(),
            },
        }
    }

    fn get_solution(&self) -> Vec<i32> {
        self.last_solution.clone()
    }

    fn get_failed_assumptions(&self) -> Vec<i32> {
        self.last_failed.clone()
    }

    fn add_learned_clause(&mut self, clause: &[i32]) {
        let mut learned = self.learned.lock();
        learned.extend_from_slice(clause);
        learned.push(0);
        learned[0] += 1;
    }

    fn set_learned_clause_callback(&mut self, callback: LearnedClauseCallback) {
        self.on_learned = Some(callback);
    }

    fn prepare_sharing(&mut self, max_literals: usize) -> Vec<i32> {
        let mut learned = self.learned.lock();
        let export: Vec<i32> = learned.iter().take(max_literals).copied().collect();
        *learned = vec![0];
        export
    }

    fn digest_sharing(&mut self, buffer: &[i32]) {
        // Digested clauses would feed the search; the script only records
        // them as ingested literals.
        self.literals.extend_from_slice(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_forces_unknown() {
        let mut solver = ScriptedSolver::with_outcome(SolveOutcome {
            code: ResultCode::Sat,
            solution: vec![1, -2],
        });
        let control = solver.control();
        control.interrupt();
        assert_eq!(solver.solve(&[]).code, ResultCode::Unknown);

        control.uninterrupt();
        let outcome = solver.solve(&[]);
        assert_eq!(outcome.code, ResultCode::Sat);
        assert_eq!(solver.get_solution(), vec![1, -2]);
    }

    #[test]
    fn test_suspend_resume_roundtrip() {
        let solver = ScriptedSolver::new();
        let control = solver.control();
        control.suspend();
        assert!(solver.is_suspended());
        control.resume();
        assert!(!solver.is_suspended());
    }

    #[test]
    fn test_sharing_buffer_drains_on_export() {
        let mut solver = ScriptedSolver::new();
        solver.add_learned_clause(&[3, -4]);
        let export = solver.prepare_sharing(100);
        assert_eq!(export, vec![1, 3, -4, 0]);
        assert_eq!(solver.prepare_sharing(100), vec![0]);
    }

    #[test]
    fn test_learned_clause_callback_fires_on_learning() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let mut solver = ScriptedSolver::new();
        solver.set_learned_clause_callback(Box::new(move |clause| {
            sink.lock().push(clause.to_vec());
        }));

        solver.learn_clause(&[2, -5]);
        assert_eq!(seen.lock().as_slice(), &[vec![2, -5]]);
        // The learned clause also reaches the pull-side export buffer.
        assert_eq!(solver.prepare_sharing(100), vec![1, 2, -5, 0]);
    }
}
