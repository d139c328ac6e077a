//! # Iterative LQR
//!
//! Single-agent trajectory optimizer. Neighbor trajectories are baked into the
//! [`AgentCost`] and stay fixed for the whole solve.
//!
//! ## Iteration
//!
//! 1. Linearize the dynamics and expand the cost along the nominal trajectory.
//! 2. Backward pass: Riccati recursion from t = H down to 0 producing the
//!    feedforward `k_t` and feedback `K_t`. If `Quu + μI` is not positive
//!    definite, μ grows by `mu_increase` and the pass restarts from the same
//!    nominal. Past `mu_max` the solve aborts.
//! 3. Forward pass: roll out `u_t = ū_t + α·k_t + K_t·(x_t − x̄_t)` for
//!    α = 1, ½, ¼, ... and accept the first α that lowers the total cost.
//!    If none does, μ grows and the iteration repeats.
//! 4. Stop when the relative improvement, the feedforward magnitude, or the
//!    predicted reduction falls below tolerance.
//!
//! Accepted costs are strictly decreasing. The recursion is sequential in time.

use crate::config::IlqrConfig;
use crate::cost::{AgentCost, CostExpansion};
use crate::dynamics::DynamicsModel;
use crate::error::{check_dim, DpilqrError, Result};
use crate::structs::{Control, State, Trajectory};
use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use tracing::debug;

/// Lowest value μ is raised to when it must grow from zero.
const MU_GROWTH_SEED: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IlqrStatus {
    Converged,
    /// Hit `max_iterations`; the trajectory is the best one accepted so far.
    IterationLimit,
}

#[derive(Debug, Clone)]
pub struct IlqrSolution {
    pub trajectory: Trajectory,
    /// Total cost (running + terminal + coupling) of `trajectory`.
    pub cost: f64,
    pub status: IlqrStatus,
    pub iterations: usize,
    pub accepted_steps: usize,
    /// Regularization when the solve ended.
    pub regularization: f64,
    /// Initial cost followed by the cost of every accepted step.
    pub cost_history: Vec<f64>,
    /// Largest cost-to-go gradient norm from the last backward pass.
    pub cost_to_go_norm: f64,
}

impl IlqrSolution {
    pub fn converged(&self) -> bool {
        self.status == IlqrStatus::Converged
    }

    pub fn require_converged(self) -> Result<Self> {
        match self.status {
            IlqrStatus::Converged => Ok(self),
            IlqrStatus::IterationLimit => Err(DpilqrError::SolverDidNotConverge {
                iterations: self.iterations,
                cost: self.cost,
            }),
        }
    }
}

/// Gains and value-function sequences of one backward pass.
struct BackwardPass {
    feedforward: Vec<DVector<f64>>,
    feedback: Vec<DMatrix<f64>>,
    /// Vx for t = 0..=H.
    value_gradients: Vec<DVector<f64>>,
    /// Model-predicted cost reduction of a full step.
    expected_reduction: f64,
}

impl BackwardPass {
    fn max_feedforward(&self) -> f64 {
        self.feedforward.iter().map(|k| k.amax()).fold(0.0, f64::max)
    }

    fn max_gradient_norm(&self) -> f64 {
        self.value_gradients.iter().map(|v| v.norm()).fold(0.0, f64::max)
    }
}

/// Mutable state of one solve invocation. Dropped when the solve returns.
struct SolverState {
    nominal: Trajectory,
    cost: f64,
    mu: f64,
}

pub struct IlqrSolver<'a> {
    dynamics: &'a dyn DynamicsModel,
    cost: AgentCost<'a>,
    config: &'a IlqrConfig,
}

impl<'a> IlqrSolver<'a> {
    pub fn new(dynamics: &'a dyn DynamicsModel, cost: AgentCost<'a>, config: &'a IlqrConfig) -> Self {
        IlqrSolver {
            dynamics,
            cost,
            config,
        }
    }

    /// Optimize from `x0`, warm-started with `initial_controls` (length H).
    pub fn solve(&self, x0: &State, initial_controls: &[Control]) -> Result<IlqrSolution> {
        let horizon = initial_controls.len();
        if horizon == 0 {
            return Err(DpilqrError::InvalidProblem("horizon must be at least 1".to_string()));
        }
        for u in initial_controls {
            check_dim("initial control", self.dynamics.control_dim(), u.len())?;
        }
        self.cost.check_horizon(horizon)?;

        let nominal = Trajectory::rollout(self.dynamics, x0, initial_controls.to_vec())?;
        if !nominal.is_finite() {
            return Err(DpilqrError::InvalidProblem(
                "initial guess rolls out to non-finite states".to_string(),
            ));
        }
        let cost = self.cost.total_cost(&nominal);
        let mut state = SolverState {
            nominal,
            cost,
            mu: self.config.clamp_mu(self.config.mu_init),
        };

        let mut cost_history = vec![cost];
        let mut status = IlqrStatus::IterationLimit;
        let mut iterations = 0;
        let mut accepted_steps = 0;
        let mut cost_to_go_norm = 0.0;
        let step_sizes = self.config.step_sizes();

        while iterations < self.config.max_iterations {
            iterations += 1;

            let jacobians = self.linearize(&state.nominal)?;
            let expansion = self.cost.expand(&state.nominal)?;
            let pass = self.regularized_backward_pass(&jacobians, &expansion, &mut state)?;
            cost_to_go_norm = pass.max_gradient_norm();

            if pass.max_feedforward() < self.config.control_tolerance
                || pass.expected_reduction <= self.config.cost_tolerance * state.cost.abs().max(1.0)
            {
                status = IlqrStatus::Converged;
                break;
            }

            let mut accepted = None;
            for &alpha in &step_sizes {
                let candidate = self.forward_pass(&state.nominal, &pass, alpha)?;
                if !candidate.is_finite() {
                    continue;
                }
                let candidate_cost = self.cost.total_cost(&candidate);
                if candidate_cost < state.cost {
                    accepted = Some((candidate, candidate_cost, alpha));
                    break;
                }
            }

            match accepted {
                Some((candidate, candidate_cost, alpha)) => {
                    let improvement = (state.cost - candidate_cost) / state.cost.abs().max(f64::MIN_POSITIVE);
                    state.nominal = candidate;
                    state.cost = candidate_cost;
                    state.mu = self.config.clamp_mu(state.mu * self.config.mu_decrease);
                    cost_history.push(candidate_cost);
                    accepted_steps += 1;
                    debug!(
                        agent = self.cost.agent_id(),
                        iteration = iterations,
                        cost = candidate_cost,
                        alpha,
                        mu = state.mu,
                        "ilqr step accepted"
                    );
                    if improvement < self.config.cost_tolerance {
                        status = IlqrStatus::Converged;
                        break;
                    }
                }
                None => {
                    if state.mu >= self.config.mu_max {
                        return Err(DpilqrError::LineSearchExhausted {
                            iterations,
                            cost: state.cost,
                        });
                    }
                    state.mu = self.increase_mu(state.mu);
                    debug!(
                        agent = self.cost.agent_id(),
                        iteration = iterations,
                        mu = state.mu,
                        "line search failed, raising regularization"
                    );
                }
            }
        }

        Ok(IlqrSolution {
            trajectory: state.nominal,
            cost: state.cost,
            status,
            iterations,
            accepted_steps,
            regularization: state.mu,
            cost_history,
            cost_to_go_norm,
        })
    }

    fn increase_mu(&self, mu: f64) -> f64 {
        self.config
            .clamp_mu(mu.max(MU_GROWTH_SEED) * self.config.mu_increase)
    }

    fn linearize(&self, nominal: &Trajectory) -> Result<Vec<(DMatrix<f64>, DMatrix<f64>)>> {
        (0..nominal.horizon())
            .map(|t| self.dynamics.linearize(nominal.state(t), nominal.control(t)))
            .collect()
    }

    /// Runs the backward pass, raising μ until Quu is positive definite.
    fn regularized_backward_pass(
        &self,
        jacobians: &[(DMatrix<f64>, DMatrix<f64>)],
        expansion: &CostExpansion,
        state: &mut SolverState,
    ) -> Result<BackwardPass> {
        loop {
            match backward_pass(jacobians, expansion, state.mu) {
                Ok(pass) => return Ok(pass),
                Err(timestep) => {
                    if state.mu >= self.config.mu_max {
                        return Err(DpilqrError::BackwardPassSingular {
                            timestep,
                            regularization: state.mu,
                        });
                    }
                    state.mu = self.increase_mu(state.mu);
                    debug!(
                        agent = self.cost.agent_id(),
                        timestep,
                        mu = state.mu,
                        "Quu not positive definite, raising regularization"
                    );
                }
            }
        }
    }

    fn forward_pass(&self, nominal: &Trajectory, pass: &BackwardPass, alpha: f64) -> Result<Trajectory> {
        let horizon = nominal.horizon();
        let mut states = Vec::with_capacity(horizon + 1);
        let mut controls = Vec::with_capacity(horizon);
        states.push(nominal.initial_state().clone());
        for t in 0..horizon {
            let dx = &states[t] - nominal.state(t);
            let u = nominal.control(t) + &pass.feedforward[t] * alpha + &pass.feedback[t] * dx;
            let next = self.dynamics.step(&states[t], &u)?;
            controls.push(u);
            states.push(next);
        }
        Trajectory::new(states, controls)
    }
}

/// Riccati recursion. Returns the failing timestep when `Quu + μI` is not
/// positive definite or the gains are not finite.
fn backward_pass(
    jacobians: &[(DMatrix<f64>, DMatrix<f64>)],
    expansion: &CostExpansion,
    mu: f64,
) -> std::result::Result<BackwardPass, usize> {
    let horizon = jacobians.len();
    let mut vx = expansion.lx[horizon].clone();
    let mut vxx = expansion.lxx[horizon].clone();

    let mut feedforward = vec![DVector::zeros(0); horizon];
    let mut feedback = vec![DMatrix::zeros(0, 0); horizon];
    let mut value_gradients = vec![DVector::zeros(0); horizon + 1];
    value_gradients[horizon] = vx.clone();
    let mut expected_reduction = 0.0;

    for t in (0..horizon).rev() {
        let (a, b) = &jacobians[t];
        let vxx_a = &vxx * a;
        let qx = &expansion.lx[t] + a.transpose() * &vx;
        let qu = &expansion.lu[t] + b.transpose() * &vx;
        let qxx = &expansion.lxx[t] + a.transpose() * &vxx_a;
        let qux = &expansion.lux[t] + b.transpose() * &vxx_a;
        let quu = &expansion.luu[t] + b.transpose() * &vxx * b;

        let n_u = quu.nrows();
        let quu_reg = &quu + DMatrix::identity(n_u, n_u) * mu;
        let cholesky = quu_reg.cholesky().ok_or(t)?;
        let k = -cholesky.solve(&qu);
        let big_k = -cholesky.solve(&qux);
        if !k.iter().chain(big_k.iter()).all(|v| v.is_finite()) {
            return Err(t);
        }

        expected_reduction -= k.dot(&qu) + 0.5 * (k.transpose() * &quu * &k)[(0, 0)];

        let big_k_t = big_k.transpose();
        vx = &qx + &big_k_t * &quu * &k + &big_k_t * &qu + qux.transpose() * &k;
        let vxx_next = &qxx + &big_k_t * &quu * &big_k + &big_k_t * &qux + qux.transpose() * &big_k;
        vxx = (&vxx_next + vxx_next.transpose()) * 0.5;

        value_gradients[t] = vx.clone();
        feedforward[t] = k;
        feedback[t] = big_k;
    }

    Ok(BackwardPass {
        feedforward,
        feedback,
        value_gradients,
        expected_reduction,
    })
}

/// Solve one agent's problem from `x0` with the given warm start.
pub fn solve_ilqr(
    dynamics: &dyn DynamicsModel,
    cost: AgentCost<'_>,
    x0: &State,
    initial_controls: &[Control],
    config: &IlqrConfig,
) -> Result<IlqrSolution> {
    config.validate()?;
    IlqrSolver::new(dynamics, cost, config).solve(x0, initial_controls)
}
