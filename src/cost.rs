//! # Cost Model
//!
//! Each agent minimizes its own reference-tracking cost plus the pairwise
//! proximity penalties it shares with the neighbors currently in its
//! interaction set. Summed over agents and edges, these terms form the joint
//! potential, so an agent's best response against frozen neighbors is a
//! descent step on that potential.
//!
//! - running:  `(x − x_g)ᵀ Q (x − x_g) + uᵀ R u`
//! - terminal: `(x − x_g)ᵀ Q_f (x − x_g)`
//! - coupling: `w · min(d − r, 0)²` on the planar distance `d` to each neighbor,
//!   applied at every timestep including the terminal one.
//!
//! The coupling Hessian uses the Gauss-Newton term `2w·n nᵀ`, which keeps the
//! expansion positive semi-definite. Neighbors outside the edge set contribute
//! exactly nothing.

use crate::error::{check_dim, DpilqrError, Result};
use crate::structs::{position_of, Control, State, Trajectory};
use nalgebra::{DMatrix, DVector, Matrix2, Vector2};
use serde::{Deserialize, Serialize};

/// Distances below this are treated as coincident positions.
const COINCIDENT_EPSILON: f64 = 1e-9;

/// Quadratic hinge on inter-agent distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProximityCost {
    /// Distance below which the penalty is active.
    pub radius: f64,
    pub weight: f64,
}

impl Default for ProximityCost {
    fn default() -> Self {
        ProximityCost {
            radius: 1.0,
            weight: 100.0,
        }
    }
}

impl ProximityCost {
    pub fn new(radius: f64, weight: f64) -> Self {
        ProximityCost { radius, weight }
    }

    pub fn cost(&self, own: &Vector2<f64>, other: &Vector2<f64>) -> f64 {
        let gap = ((own - other).norm() - self.radius).min(0.0);
        self.weight * gap * gap
    }

    /// Gradient and Gauss-Newton Hessian with respect to `own`.
    ///
    /// `own_id`/`other_id` only matter for coincident positions, where they pick
    /// opposite separation directions for the two agents.
    pub fn gradient_hessian(
        &self,
        own: &Vector2<f64>,
        other: &Vector2<f64>,
        own_id: usize,
        other_id: usize,
    ) -> (Vector2<f64>, Matrix2<f64>) {
        let offset = own - other;
        let distance = offset.norm();
        if distance >= self.radius {
            return (Vector2::zeros(), Matrix2::zeros());
        }
        let normal = if distance < COINCIDENT_EPSILON {
            if own_id < other_id {
                Vector2::new(-1.0, 0.0)
            } else {
                Vector2::new(1.0, 0.0)
            }
        } else {
            offset / distance
        };
        let gradient = normal * (2.0 * self.weight * (distance - self.radius));
        let hessian = normal * normal.transpose() * (2.0 * self.weight);
        (gradient, hessian)
    }
}

/// Per-agent weights. Immutable during a solve session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSpec {
    pub q: DMatrix<f64>,
    pub r: DMatrix<f64>,
    pub qf: DMatrix<f64>,
    pub proximity: ProximityCost,
}

impl CostSpec {
    pub fn new(q: DMatrix<f64>, r: DMatrix<f64>, qf: DMatrix<f64>, proximity: ProximityCost) -> Self {
        CostSpec { q, r, qf, proximity }
    }

    /// Diagonal weight matrices from their diagonals.
    pub fn diagonal(q: &[f64], r: &[f64], qf: &[f64], proximity: ProximityCost) -> Self {
        CostSpec {
            q: DMatrix::from_diagonal(&DVector::from_column_slice(q)),
            r: DMatrix::from_diagonal(&DVector::from_column_slice(r)),
            qf: DMatrix::from_diagonal(&DVector::from_column_slice(qf)),
            proximity,
        }
    }

    pub fn validate(&self, n_x: usize, n_u: usize) -> Result<()> {
        for (context, m, n) in [("cost Q", &self.q, n_x), ("cost Qf", &self.qf, n_x), ("cost R", &self.r, n_u)] {
            check_dim(context, n, m.nrows())?;
            check_dim(context, n, m.ncols())?;
        }
        if self.r.clone().cholesky().is_none() {
            return Err(DpilqrError::InvalidProblem(
                "control weight R must be positive definite".to_string(),
            ));
        }
        if !(self.proximity.radius >= 0.0 && self.proximity.weight >= 0.0) {
            return Err(DpilqrError::InvalidProblem(
                "proximity radius and weight must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn running_cost(&self, goal: &State, x: &State, u: &Control) -> f64 {
        let dx = x - goal;
        (dx.transpose() * &self.q * &dx)[(0, 0)] + (u.transpose() * &self.r * u)[(0, 0)]
    }

    pub fn terminal_cost(&self, goal: &State, x: &State) -> f64 {
        let dx = x - goal;
        (dx.transpose() * &self.qf * &dx)[(0, 0)]
    }
}

/// A frozen neighbor trajectory from the previous round's snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Neighbor<'a> {
    pub id: usize,
    pub trajectory: &'a Trajectory,
}

/// Quadratic model of an agent's cost along a nominal trajectory.
///
/// State terms have H+1 entries (the last one is terminal); control terms have H.
#[derive(Debug, Clone)]
pub struct CostExpansion {
    pub lx: Vec<DVector<f64>>,
    pub lu: Vec<DVector<f64>>,
    pub lxx: Vec<DMatrix<f64>>,
    pub luu: Vec<DMatrix<f64>>,
    pub lux: Vec<DMatrix<f64>>,
}

/// Cost of one agent with its current neighbors held fixed.
#[derive(Debug, Clone)]
pub struct AgentCost<'a> {
    agent_id: usize,
    spec: &'a CostSpec,
    goal: &'a State,
    neighbors: Vec<Neighbor<'a>>,
}

impl<'a> AgentCost<'a> {
    pub fn new(agent_id: usize, spec: &'a CostSpec, goal: &'a State, neighbors: Vec<Neighbor<'a>>) -> Self {
        AgentCost {
            agent_id,
            spec,
            goal,
            neighbors,
        }
    }

    /// Cost with no coupling terms, the independent single-agent problem.
    pub fn uncoupled(agent_id: usize, spec: &'a CostSpec, goal: &'a State) -> Self {
        Self::new(agent_id, spec, goal, Vec::new())
    }

    pub fn agent_id(&self) -> usize {
        self.agent_id
    }

    pub fn running_cost(&self, x: &State, u: &Control) -> f64 {
        self.spec.running_cost(self.goal, x, u)
    }

    pub fn terminal_cost(&self, x: &State) -> f64 {
        self.spec.terminal_cost(self.goal, x)
    }

    /// Sum of proximity penalties against every neighbor's state at timestep `t`.
    pub fn coupling_cost(&self, t: usize, x: &State) -> f64 {
        let own = position_of(x);
        self.neighbors
            .iter()
            .map(|n| self.spec.proximity.cost(&own, &n.trajectory.position(t)))
            .sum()
    }

    /// Running + terminal cost, without coupling.
    pub fn own_cost(&self, trajectory: &Trajectory) -> f64 {
        let h = trajectory.horizon();
        let running: f64 = (0..h)
            .map(|t| self.running_cost(trajectory.state(t), trajectory.control(t)))
            .sum();
        running + self.terminal_cost(trajectory.state(h))
    }

    pub fn total_coupling(&self, trajectory: &Trajectory) -> f64 {
        (0..=trajectory.horizon())
            .map(|t| self.coupling_cost(t, trajectory.state(t)))
            .sum()
    }

    /// Full objective of the local solve: running + terminal + coupling.
    pub fn total_cost(&self, trajectory: &Trajectory) -> f64 {
        self.own_cost(trajectory) + self.total_coupling(trajectory)
    }

    /// Checks that every neighbor trajectory covers the same horizon.
    pub fn check_horizon(&self, horizon: usize) -> Result<()> {
        for neighbor in &self.neighbors {
            check_dim("neighbor trajectory horizon", horizon, neighbor.trajectory.horizon())?;
        }
        Ok(())
    }

    /// Gradients and Hessians along `nominal`, consumed by the backward pass.
    pub fn expand(&self, nominal: &Trajectory) -> Result<CostExpansion> {
        let h = nominal.horizon();
        self.check_horizon(h)?;
        let q2 = &self.spec.q * 2.0;
        let r2 = &self.spec.r * 2.0;
        let qf2 = &self.spec.qf * 2.0;
        let n_u = self.spec.r.nrows();
        let n_x = self.spec.q.nrows();

        let mut expansion = CostExpansion {
            lx: Vec::with_capacity(h + 1),
            lu: Vec::with_capacity(h),
            lxx: Vec::with_capacity(h + 1),
            luu: Vec::with_capacity(h),
            lux: Vec::with_capacity(h),
        };

        for t in 0..=h {
            let x = nominal.state(t);
            let dx = x - self.goal;
            let weight = if t < h { &q2 } else { &qf2 };
            let mut lx = weight * &dx;
            let mut lxx = weight.clone();
            self.add_coupling(t, x, &mut lx, &mut lxx);
            expansion.lx.push(lx);
            expansion.lxx.push(lxx);

            if t < h {
                let u = nominal.control(t);
                expansion.lu.push(&r2 * u);
                expansion.luu.push(r2.clone());
                expansion.lux.push(DMatrix::zeros(n_u, n_x));
            }
        }
        Ok(expansion)
    }

    fn add_coupling(&self, t: usize, x: &State, lx: &mut DVector<f64>, lxx: &mut DMatrix<f64>) {
        let own = position_of(x);
        for neighbor in &self.neighbors {
            let (g, hess) = self.spec.proximity.gradient_hessian(
                &own,
                &neighbor.trajectory.position(t),
                self.agent_id,
                neighbor.id,
            );
            for a in 0..2 {
                lx[a] += g[a];
                for b in 0..2 {
                    lxx[(a, b)] += hess[(a, b)];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::dvector;

    fn spec() -> CostSpec {
        CostSpec::diagonal(&[1.0, 1.0, 0.1, 0.1], &[0.5, 0.5], &[10.0, 10.0, 1.0, 1.0], ProximityCost::new(1.0, 50.0))
    }

    fn line(y: f64, h: usize) -> Trajectory {
        let states = (0..=h).map(|t| dvector![t as f64 * 0.1, y, 1.0, 0.0]).collect();
        let controls = vec![dvector![0.0, 0.0]; h];
        Trajectory::new(states, controls).unwrap()
    }

    #[test]
    fn test_running_and_terminal_cost() {
        let spec = spec();
        let goal = dvector![1.0, 0.0, 0.0, 0.0];
        let x = dvector![0.0, 0.0, 0.0, 0.0];
        let u = dvector![2.0, 0.0];
        assert_relative_eq!(spec.running_cost(&goal, &x, &u), 1.0 + 2.0, epsilon = 1e-12);
        assert_relative_eq!(spec.terminal_cost(&goal, &x), 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_proximity_zero_beyond_radius() {
        let prox = ProximityCost::new(1.0, 50.0);
        let a = Vector2::new(0.0, 0.0);
        let b = Vector2::new(1.5, 0.0);
        assert_eq!(prox.cost(&a, &b), 0.0);
        let (g, h) = prox.gradient_hessian(&a, &b, 0, 1);
        assert_eq!(g, Vector2::zeros());
        assert_eq!(h, Matrix2::zeros());
    }

    #[test]
    fn test_proximity_gradient_matches_finite_difference() {
        let prox = ProximityCost::new(1.0, 50.0);
        let own = Vector2::new(0.2, 0.1);
        let other = Vector2::new(0.6, -0.3);
        let (g, _) = prox.gradient_hessian(&own, &other, 0, 1);
        let eps = 1e-6;
        for k in 0..2 {
            let mut plus = own;
            let mut minus = own;
            plus[k] += eps;
            minus[k] -= eps;
            let fd = (prox.cost(&plus, &other) - prox.cost(&minus, &other)) / (2.0 * eps);
            assert_relative_eq!(g[k], fd, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_proximity_gradient_pushes_apart() {
        let prox = ProximityCost::new(1.0, 50.0);
        let (g, h) = prox.gradient_hessian(&Vector2::new(0.0, 0.0), &Vector2::new(0.5, 0.0), 0, 1);
        // Descending the gradient moves away from the neighbor.
        assert!(g.x > 0.0);
        assert!(h.symmetric_eigenvalues().iter().all(|&e| e >= -1e-12));
    }

    #[test]
    fn test_coincident_positions_separate_in_opposite_directions() {
        let prox = ProximityCost::new(1.0, 50.0);
        let p = Vector2::new(2.0, 2.0);
        let (g0, _) = prox.gradient_hessian(&p, &p, 0, 1);
        let (g1, _) = prox.gradient_hessian(&p, &p, 1, 0);
        assert_relative_eq!(g0, -g1, epsilon = 1e-12);
        assert!(g0.norm() > 0.0);
    }

    #[test]
    fn test_no_neighbors_means_zero_coupling() {
        let spec = spec();
        let goal = dvector![5.0, 0.0, 0.0, 0.0];
        let nominal = line(0.0, 5);
        let cost = AgentCost::uncoupled(0, &spec, &goal);
        assert_eq!(cost.total_coupling(&nominal), 0.0);
        assert_eq!(cost.total_cost(&nominal), cost.own_cost(&nominal));
    }

    #[test]
    fn test_coupling_counts_close_neighbor() {
        let spec = spec();
        let goal = dvector![5.0, 0.0, 0.0, 0.0];
        let nominal = line(0.0, 5);
        let close = line(0.5, 5);
        let cost = AgentCost::new(0, &spec, &goal, vec![Neighbor { id: 1, trajectory: &close }]);
        // 6 timesteps, each 50 * (0.5 - 1.0)^2
        assert_relative_eq!(cost.total_coupling(&nominal), 6.0 * 12.5, epsilon = 1e-9);
    }

    #[test]
    fn test_expand_shapes_and_terminal_weight() {
        let spec = spec();
        let goal = dvector![0.0, 0.0, 0.0, 0.0];
        let nominal = line(0.0, 3);
        let cost = AgentCost::uncoupled(0, &spec, &goal);
        let exp = cost.expand(&nominal).unwrap();
        assert_eq!(exp.lx.len(), 4);
        assert_eq!(exp.lxx.len(), 4);
        assert_eq!(exp.lu.len(), 3);
        assert_eq!(exp.luu.len(), 3);
        assert_eq!(exp.lux.len(), 3);
        assert_relative_eq!(exp.lxx[3][(0, 0)], 20.0, epsilon = 1e-12);
        assert_relative_eq!(exp.lxx[0][(0, 0)], 2.0, epsilon = 1e-12);
        // d/dx of (x - g)^T Qf (x - g) at x = (0.3, 0, 1, 0)
        assert_relative_eq!(exp.lx[3][0], 2.0 * 10.0 * 0.3, epsilon = 1e-12);
        assert_relative_eq!(exp.lx[3][2], 2.0 * 1.0 * 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_expand_rejects_horizon_mismatch() {
        let spec = spec();
        let goal = dvector![0.0, 0.0, 0.0, 0.0];
        let nominal = line(0.0, 3);
        let other = line(0.5, 4);
        let cost = AgentCost::new(0, &spec, &goal, vec![Neighbor { id: 1, trajectory: &other }]);
        assert!(matches!(cost.expand(&nominal), Err(DpilqrError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_validate_rejects_wrong_sizes() {
        let spec = spec();
        assert!(spec.validate(4, 2).is_ok());
        assert!(spec.validate(3, 2).is_err());
        assert!(spec.validate(4, 1).is_err());
    }

    #[test]
    fn test_validate_rejects_singular_r() {
        let spec = CostSpec::diagonal(&[1.0, 1.0], &[0.0], &[1.0, 1.0], ProximityCost::default());
        assert!(matches!(spec.validate(2, 1), Err(DpilqrError::InvalidProblem(_))));
    }
}
