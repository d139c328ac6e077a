//! # Errors
//!
//! Every fallible operation in the crate returns [`DpilqrError`]. Local recovery
//! (regularization backoff, line-search backoff) happens inside the solver; what
//! reaches this type has already exhausted its bounded retries.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DpilqrError {
    /// A state, control or weight matrix has the wrong shape. Never recoverable.
    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Quu stayed indefinite after regularization reached its cap.
    #[error("Backward pass singular at t={timestep} with regularization {regularization:e}")]
    BackwardPassSingular { timestep: usize, regularization: f64 },

    /// No step size decreased the cost, even with maximal regularization.
    #[error("Line search exhausted after {iterations} iterations (cost {cost:.6})")]
    LineSearchExhausted { iterations: usize, cost: f64 },

    #[error("iLQR did not converge within {iterations} iterations (cost {cost:.6})")]
    SolverDidNotConverge { iterations: usize, cost: f64 },

    #[error("Coordinator did not converge within {rounds} rounds (max delta {max_delta:.3e})")]
    CoordinatorDidNotConverge { rounds: usize, max_delta: f64 },

    #[error("Agent {agent} diverged in round {round}: {source}")]
    AgentDiverged {
        agent: usize,
        round: usize,
        #[source]
        source: Box<DpilqrError>,
    },

    #[error("Invalid problem: {0}")]
    InvalidProblem(String),

    #[error("Reference QP solve failed: {0}")]
    ReferenceSolve(String),
}

impl DpilqrError {
    /// True for the failures a coordinator may absorb by retrying the agent.
    pub fn is_divergence(&self) -> bool {
        matches!(
            self,
            DpilqrError::BackwardPassSingular { .. } | DpilqrError::LineSearchExhausted { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DpilqrError>;

/// Shape check used at every API boundary.
pub(crate) fn check_dim(context: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(DpilqrError::DimensionMismatch {
            context,
            expected,
            actual,
        })
    }
}
