//! # Core Data Structures
//!
//! - **State / Control**: dynamically sized `nalgebra` vectors
//! - **Trajectory**: H+1 states and H controls produced by one agent's solve
//! - **Agent**: initial/goal state, dynamics model and cost weights of one agent
//!
//! A `Trajectory` is immutable once built. Neighbors receive clones, never
//! references into another agent's solver.

use crate::cost::CostSpec;
use crate::dynamics::DynamicsModel;
use crate::error::{check_dim, DpilqrError, Result};
use nalgebra::{DVector, Vector2};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub type State = DVector<f64>;
pub type Control = DVector<f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TrajectoryData")]
pub struct Trajectory {
    states: Vec<State>,
    controls: Vec<Control>,
}

/// Unchecked wire form; deserialization goes through [`Trajectory::new`].
#[derive(Deserialize)]
struct TrajectoryData {
    states: Vec<State>,
    controls: Vec<Control>,
}

impl TryFrom<TrajectoryData> for Trajectory {
    type Error = DpilqrError;

    fn try_from(data: TrajectoryData) -> Result<Self> {
        Trajectory::new(data.states, data.controls)
    }
}

impl Trajectory {
    /// Build from explicit sequences. Requires `states.len() == controls.len() + 1`,
    /// states carrying a planar position and consistent dimensions throughout.
    pub fn new(states: Vec<State>, controls: Vec<Control>) -> Result<Self> {
        check_dim("trajectory state count", controls.len() + 1, states.len())?;
        let n_x = states[0].len();
        if n_x < 2 {
            return Err(DpilqrError::InvalidProblem(format!(
                "trajectory state has no planar position (dimension {n_x})"
            )));
        }
        for state in &states {
            check_dim("trajectory state", n_x, state.len())?;
        }
        if let Some(first) = controls.first() {
            let n_u = first.len();
            for control in &controls {
                check_dim("trajectory control", n_u, control.len())?;
            }
        }
        Ok(Trajectory { states, controls })
    }

    /// Simulate `controls` forward from `x0`.
    pub fn rollout(dynamics: &dyn DynamicsModel, x0: &State, controls: Vec<Control>) -> Result<Self> {
        check_dim("initial state", dynamics.state_dim(), x0.len())?;
        let mut states = Vec::with_capacity(controls.len() + 1);
        states.push(x0.clone());
        for u in &controls {
            let next = dynamics.step(&states[states.len() - 1], u)?;
            states.push(next);
        }
        Self::new(states, controls)
    }

    /// Zero-control rollout: the default initial guess when no warm start is given.
    pub fn zero_control(dynamics: &dyn DynamicsModel, x0: &State, horizon: usize) -> Result<Self> {
        let controls = vec![DVector::zeros(dynamics.control_dim()); horizon];
        Self::rollout(dynamics, x0, controls)
    }

    /// H, the number of control steps.
    pub fn horizon(&self) -> usize {
        self.controls.len()
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn controls(&self) -> &[Control] {
        &self.controls
    }

    pub fn state(&self, t: usize) -> &State {
        &self.states[t]
    }

    pub fn control(&self, t: usize) -> &Control {
        &self.controls[t]
    }

    pub fn initial_state(&self) -> &State {
        &self.states[0]
    }

    pub fn final_state(&self) -> &State {
        &self.states[self.states.len() - 1]
    }

    /// Planar position at timestep `t` (first two state entries).
    pub fn position(&self, t: usize) -> Vector2<f64> {
        position_of(&self.states[t])
    }

    /// Largest absolute entry-wise change of any state or control against `other`.
    pub fn max_delta(&self, other: &Trajectory) -> Result<f64> {
        check_dim("trajectory horizon", self.horizon(), other.horizon())?;
        let state_delta = self
            .states
            .iter()
            .zip(&other.states)
            .map(|(a, b)| OrderedFloat((a - b).amax()));
        let control_delta = self
            .controls
            .iter()
            .zip(&other.controls)
            .map(|(a, b)| OrderedFloat((a - b).amax()));
        Ok(state_delta
            .chain(control_delta)
            .max()
            .map(|d| d.0)
            .unwrap_or(0.0))
    }

    /// Smallest distance to `other` over the shared timesteps.
    pub fn min_distance_to(&self, other: &Trajectory) -> f64 {
        self.states
            .iter()
            .zip(&other.states)
            .map(|(a, b)| OrderedFloat((position_of(a) - position_of(b)).norm()))
            .min()
            .map(|d| d.0)
            .unwrap_or(f64::INFINITY)
    }

    pub fn is_finite(&self) -> bool {
        self.states.iter().all(|x| x.iter().all(|v| v.is_finite()))
            && self.controls.iter().all(|u| u.iter().all(|v| v.is_finite()))
    }
}

impl fmt::Display for Trajectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self.position(0);
        let end = position_of(self.final_state());
        write!(
            f,
            "Trajectory(H={}, start=({:.2}, {:.2}), end=({:.2}, {:.2}))",
            self.horizon(),
            start.x,
            start.y,
            end.x,
            end.y
        )
    }
}

pub fn position_of(state: &State) -> Vector2<f64> {
    Vector2::new(state[0], state[1])
}

/// Smallest pairwise distance among all trajectories at any shared timestep.
pub fn min_pairwise_distance(trajectories: &[Trajectory]) -> f64 {
    let mut best = f64::INFINITY;
    for i in 0..trajectories.len() {
        for j in (i + 1)..trajectories.len() {
            best = best.min(trajectories[i].min_distance_to(&trajectories[j]));
        }
    }
    best
}

/// Symmetric matrix of planar distances between agents' states at one timestep.
pub fn pairwise_distances(states: &[State]) -> nalgebra::DMatrix<f64> {
    let n = states.len();
    nalgebra::DMatrix::from_fn(n, n, |i, j| (position_of(&states[i]) - position_of(&states[j])).norm())
}

/// One participant of the distributed solve.
#[derive(Clone)]
pub struct Agent {
    pub id: usize,
    pub initial_state: State,
    pub goal_state: State,
    pub dynamics: Arc<dyn DynamicsModel>,
    pub cost: CostSpec,
}

impl Agent {
    pub fn new(
        id: usize,
        initial_state: State,
        goal_state: State,
        dynamics: Arc<dyn DynamicsModel>,
        cost: CostSpec,
    ) -> Self {
        Agent {
            id,
            initial_state,
            goal_state,
            dynamics,
            cost,
        }
    }

    /// Checks that states, weights and model agree on dimensions.
    pub fn validate(&self) -> Result<()> {
        let n_x = self.dynamics.state_dim();
        let n_u = self.dynamics.control_dim();
        if n_x < 2 {
            return Err(DpilqrError::InvalidProblem(format!(
                "agent {} state has no planar position (dimension {})",
                self.id, n_x
            )));
        }
        check_dim("agent initial state", n_x, self.initial_state.len())?;
        check_dim("agent goal state", n_x, self.goal_state.len())?;
        self.cost.validate(n_x, n_u)
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("initial_state", &self.initial_state.as_slice())
            .field("goal_state", &self.goal_state.as_slice())
            .field("dynamics", &self.dynamics.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::DoubleIntegrator4D;
    use approx::assert_relative_eq;
    use nalgebra::dvector;

    #[test]
    fn test_trajectory_new_checks_lengths() {
        let states = vec![dvector![0.0, 0.0], dvector![1.0, 0.0]];
        let controls = vec![dvector![1.0]];
        assert!(Trajectory::new(states.clone(), controls).is_ok());
        assert!(matches!(
            Trajectory::new(states, vec![]),
            Err(DpilqrError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_trajectory_new_checks_state_dims() {
        let states = vec![dvector![0.0, 0.0], dvector![1.0, 0.0, 3.0]];
        let controls = vec![dvector![1.0]];
        assert!(Trajectory::new(states, controls).is_err());
    }

    #[test]
    fn test_trajectory_new_rejects_one_dimensional_states() {
        let states = vec![dvector![0.0], dvector![1.0]];
        let controls = vec![dvector![1.0]];
        assert!(matches!(
            Trajectory::new(states, controls),
            Err(DpilqrError::InvalidProblem(_))
        ));
    }

    #[test]
    fn test_trajectory_serde_round_trip() {
        let model = DoubleIntegrator4D::new(0.1);
        let traj = Trajectory::rollout(&model, &dvector![0.0, 0.0, 1.0, 0.0], vec![dvector![0.5, -0.5]; 3]).unwrap();
        let json = serde_json::to_string(&traj).unwrap();
        let back: Trajectory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, traj);
    }

    #[test]
    fn test_trajectory_deserialize_rejects_invalid() {
        let v = |x: State| serde_json::to_value(x).unwrap();
        let parse = |value: serde_json::Value| serde_json::from_value::<Trajectory>(value);

        assert!(parse(serde_json::json!({"states": [], "controls": []})).is_err());
        // One control but a single state.
        assert!(parse(serde_json::json!({
            "states": [v(dvector![0.0, 0.0])],
            "controls": [v(dvector![1.0])],
        }))
        .is_err());
        // Ragged state dimensions.
        assert!(parse(serde_json::json!({
            "states": [v(dvector![0.0, 0.0]), v(dvector![1.0, 0.0, 2.0])],
            "controls": [v(dvector![1.0])],
        }))
        .is_err());
        let ok = parse(serde_json::json!({
            "states": [v(dvector![0.0, 0.0]), v(dvector![1.0, 0.0])],
            "controls": [v(dvector![1.0])],
        }))
        .unwrap();
        assert_eq!(ok.horizon(), 1);
    }

    #[test]
    fn test_zero_control_rollout_keeps_velocity() {
        let model = DoubleIntegrator4D::new(0.1);
        let x0 = dvector![0.0, 0.0, 1.0, 0.0];
        let traj = Trajectory::zero_control(&model, &x0, 10).unwrap();
        assert_eq!(traj.horizon(), 10);
        assert_eq!(traj.states().len(), 11);
        assert_relative_eq!(traj.final_state()[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(traj.final_state()[2], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rollout_rejects_wrong_initial_state() {
        let model = DoubleIntegrator4D::new(0.1);
        let x0 = dvector![0.0, 0.0];
        assert!(Trajectory::zero_control(&model, &x0, 3).is_err());
    }

    #[test]
    fn test_max_delta() {
        let a = Trajectory::new(vec![dvector![0.0, 0.0], dvector![1.0, 1.0]], vec![dvector![0.5]]).unwrap();
        let b = Trajectory::new(vec![dvector![0.0, 0.0], dvector![1.0, 1.3]], vec![dvector![-0.5]]).unwrap();
        assert_relative_eq!(a.max_delta(&b).unwrap(), 1.0, epsilon = 1e-12);
        assert_eq!(a.max_delta(&a).unwrap(), 0.0);
    }

    #[test]
    fn test_min_distance_and_pairwise() {
        let a = Trajectory::new(vec![dvector![0.0, 0.0], dvector![1.0, 0.0]], vec![dvector![0.0]]).unwrap();
        let b = Trajectory::new(vec![dvector![3.0, 4.0], dvector![1.0, 2.0]], vec![dvector![0.0]]).unwrap();
        assert_relative_eq!(a.min_distance_to(&b), 2.0, epsilon = 1e-12);
        assert_relative_eq!(min_pairwise_distance(&[a, b]), 2.0, epsilon = 1e-12);
        assert_eq!(min_pairwise_distance(&[]), f64::INFINITY);
    }

    #[test]
    fn test_pairwise_distances_symmetric() {
        let states = vec![dvector![0.0, 0.0], dvector![3.0, 4.0], dvector![0.0, 1.0]];
        let d = pairwise_distances(&states);
        assert_eq!(d[(0, 1)], 5.0);
        assert_eq!(d[(1, 0)], 5.0);
        assert_eq!(d[(2, 2)], 0.0);
    }

    #[test]
    fn test_trajectory_display() {
        let traj = Trajectory::new(vec![dvector![1.0, 2.0], dvector![3.0, 4.0]], vec![dvector![0.0]]).unwrap();
        assert_eq!(
            traj.to_string(),
            "Trajectory(H=1, start=(1.00, 2.00), end=(3.00, 4.00))"
        );
    }
}
