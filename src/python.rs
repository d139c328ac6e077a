//! Python bindings.
//!
//! Agents cross the boundary as plain lists: state vectors, weight diagonals
//! and a dynamics model name resolved with [`model_by_name`]. Solutions come
//! back as nested lists of states and controls plus per-round diagnostics.

use crate::config::{CoordinatorConfig, DivergencePolicy, IlqrConfig};
use crate::coordinator::{solve, DistributedSolution};
use crate::cost::{CostSpec, ProximityCost};
use crate::dynamics::{model_by_name, DynamicsModel};
use crate::error::DpilqrError;
use crate::scenario;
use crate::structs::{min_pairwise_distance, pairwise_distances, Agent, Trajectory};
use nalgebra::DVector;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use std::sync::Arc;

impl From<DpilqrError> for PyErr {
    fn from(err: DpilqrError) -> PyErr {
        match err {
            DpilqrError::DimensionMismatch { .. } | DpilqrError::InvalidProblem(_) => {
                PyValueError::new_err(err.to_string())
            }
            _ => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

#[pyclass(name = "Agent")]
#[derive(Debug, Clone)]
pub struct PyAgent {
    #[pyo3(get, set)]
    pub id: usize,
    #[pyo3(get, set)]
    pub initial_state: Vec<f64>,
    #[pyo3(get, set)]
    pub goal_state: Vec<f64>,
    #[pyo3(get, set)]
    pub model: String,
    #[pyo3(get, set)]
    pub q: Vec<f64>,
    #[pyo3(get, set)]
    pub r: Vec<f64>,
    #[pyo3(get, set)]
    pub qf: Vec<f64>,
    #[pyo3(get, set)]
    pub proximity_radius: f64,
    #[pyo3(get, set)]
    pub proximity_weight: f64,
}

#[pymethods]
impl PyAgent {
    #[new]
    #[pyo3(signature = (id, initial_state, goal_state, model, q, r, qf, proximity_radius=1.0, proximity_weight=100.0))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: usize,
        initial_state: Vec<f64>,
        goal_state: Vec<f64>,
        model: String,
        q: Vec<f64>,
        r: Vec<f64>,
        qf: Vec<f64>,
        proximity_radius: f64,
        proximity_weight: f64,
    ) -> Self {
        PyAgent {
            id,
            initial_state,
            goal_state,
            model,
            q,
            r,
            qf,
            proximity_radius,
            proximity_weight,
        }
    }

    fn __repr__(&self) -> String {
        format!(
            "Agent(id={}, model={}, start={:?}, goal={:?})",
            self.id, self.model, self.initial_state, self.goal_state
        )
    }
}

impl PyAgent {
    fn to_agent(&self, dt: f64) -> PyResult<Agent> {
        let dynamics = model_by_name(&self.model, dt)
            .ok_or_else(|| PyValueError::new_err(format!("unknown dynamics model '{}'", self.model)))?;
        let cost = CostSpec::diagonal(
            &self.q,
            &self.r,
            &self.qf,
            ProximityCost::new(self.proximity_radius, self.proximity_weight),
        );
        Ok(Agent::new(
            self.id,
            DVector::from_vec(self.initial_state.clone()),
            DVector::from_vec(self.goal_state.clone()),
            dynamics,
            cost,
        ))
    }

    fn from_agent(agent: &Agent) -> Self {
        PyAgent {
            id: agent.id,
            initial_state: agent.initial_state.iter().copied().collect(),
            goal_state: agent.goal_state.iter().copied().collect(),
            model: agent.dynamics.name().to_string(),
            q: agent.cost.q.diagonal().iter().copied().collect(),
            r: agent.cost.r.diagonal().iter().copied().collect(),
            qf: agent.cost.qf.diagonal().iter().copied().collect(),
            proximity_radius: agent.cost.proximity.radius,
            proximity_weight: agent.cost.proximity.weight,
        }
    }
}

#[pyclass(name = "Solution")]
#[derive(Debug, Clone)]
pub struct PySolution {
    /// Per agent: H+1 states.
    #[pyo3(get)]
    pub states: Vec<Vec<Vec<f64>>>,
    /// Per agent: H controls.
    #[pyo3(get)]
    pub controls: Vec<Vec<Vec<f64>>>,
    #[pyo3(get)]
    pub converged: bool,
    #[pyo3(get)]
    pub rounds: usize,
    #[pyo3(get)]
    pub deltas: Vec<f64>,
    #[pyo3(get)]
    pub joint_potentials: Vec<f64>,
    #[pyo3(get)]
    pub edges: Vec<(usize, usize)>,
    #[pyo3(get)]
    pub min_distance: f64,
}

#[pymethods]
impl PySolution {
    fn __repr__(&self) -> String {
        format!(
            "Solution(agents={}, converged={}, rounds={}, min_distance={:.3})",
            self.states.len(),
            self.converged,
            self.rounds,
            self.min_distance
        )
    }
}

fn to_rows(vectors: &[DVector<f64>]) -> Vec<Vec<f64>> {
    vectors.iter().map(|v| v.iter().copied().collect()).collect()
}

impl From<DistributedSolution> for PySolution {
    fn from(solution: DistributedSolution) -> Self {
        let min_distance = min_pairwise_distance(&solution.trajectories);
        PySolution {
            states: solution.trajectories.iter().map(|t| to_rows(t.states())).collect(),
            controls: solution.trajectories.iter().map(|t| to_rows(t.controls())).collect(),
            converged: solution.converged,
            rounds: solution.report.round_count(),
            deltas: solution.report.deltas(),
            joint_potentials: solution.report.rounds.iter().map(|r| r.joint_potential).collect(),
            edges: solution.graph.edges().collect(),
            min_distance,
        }
    }
}

fn parse_policy(policy: &str) -> PyResult<DivergencePolicy> {
    match policy {
        "retry" | "retry_from_scratch" => Ok(DivergencePolicy::RetryFromScratch),
        "abort" => Ok(DivergencePolicy::Abort),
        other => Err(PyValueError::new_err(format!("unknown divergence policy '{other}'"))),
    }
}

/// Run the distributed solve. Releases the GIL while solving.
#[pyfunction]
#[pyo3(signature = (
    agents,
    horizon=50,
    dt=0.1,
    interaction_radius=3.0,
    tolerance=1e-3,
    max_rounds=30,
    max_iterations=100,
    relaxation=1.0,
    divergence_policy="retry"
))]
#[allow(clippy::too_many_arguments)]
fn solve_decentralized(
    py: Python<'_>,
    agents: Vec<PyAgent>,
    horizon: usize,
    dt: f64,
    interaction_radius: f64,
    tolerance: f64,
    max_rounds: usize,
    max_iterations: usize,
    relaxation: f64,
    divergence_policy: &str,
) -> PyResult<PySolution> {
    let agents = agents
        .iter()
        .map(|a| a.to_agent(dt))
        .collect::<PyResult<Vec<Agent>>>()?;
    let config = CoordinatorConfig {
        horizon,
        dt,
        interaction_radius,
        tolerance,
        max_rounds,
        relaxation,
        divergence_policy: parse_policy(divergence_policy)?,
        ilqr: IlqrConfig {
            max_iterations,
            ..IlqrConfig::default()
        },
        ..CoordinatorConfig::default()
    };
    let solution = py.allow_threads(|| solve(&agents, &config))?;
    Ok(solution.into())
}

/// Unit tracking weights, light control weights and a heavier terminal weight.
fn default_cost(model: &str, dt: f64) -> PyResult<(Arc<dyn DynamicsModel>, CostSpec)> {
    let dynamics =
        model_by_name(model, dt).ok_or_else(|| PyValueError::new_err(format!("unknown dynamics model '{model}'")))?;
    let n_x = dynamics.state_dim();
    let n_u = dynamics.control_dim();
    let cost = CostSpec::diagonal(&vec![1.0; n_x], &vec![0.1; n_u], &vec![10.0; n_x], ProximityCost::default());
    Ok((dynamics, cost))
}

#[pyfunction]
#[pyo3(signature = (distance, lateral_offset=0.1, model="double_integrator_4d", dt=0.1))]
fn swap_pair_scenario(distance: f64, lateral_offset: f64, model: &str, dt: f64) -> PyResult<Vec<PyAgent>> {
    let (dynamics, cost) = default_cost(model, dt)?;
    Ok(scenario::swap_pair(distance, lateral_offset, dynamics, &cost)
        .iter()
        .map(PyAgent::from_agent)
        .collect())
}

#[pyfunction]
#[pyo3(signature = (n_agents, radius, model="double_integrator_4d", dt=0.1))]
fn rotating_swap_scenario(n_agents: usize, radius: f64, model: &str, dt: f64) -> PyResult<Vec<PyAgent>> {
    let (dynamics, cost) = default_cost(model, dt)?;
    Ok(scenario::rotating_swap(n_agents, radius, dynamics, &cost)?
        .iter()
        .map(PyAgent::from_agent)
        .collect())
}

#[pyfunction]
#[pyo3(signature = (n_agents, extent, min_separation=1.0, seed=0, model="double_integrator_4d", dt=0.1))]
fn random_scenario(
    n_agents: usize,
    extent: f64,
    min_separation: f64,
    seed: u64,
    model: &str,
    dt: f64,
) -> PyResult<Vec<PyAgent>> {
    let (dynamics, cost) = default_cost(model, dt)?;
    Ok(scenario::random_setup(n_agents, extent, min_separation, seed, dynamics, &cost)?
        .iter()
        .map(PyAgent::from_agent)
        .collect())
}

/// Planar distance matrix between agents' states at one timestep.
#[pyfunction]
fn compute_pairwise_distance(states: Vec<Vec<f64>>) -> PyResult<Vec<Vec<f64>>> {
    if let Some(state) = states.iter().find(|s| s.len() < 2) {
        return Err(PyValueError::new_err(format!(
            "state has no planar position (dimension {})",
            state.len()
        )));
    }
    let states: Vec<DVector<f64>> = states.into_iter().map(DVector::from_vec).collect();
    let distances = pairwise_distances(&states);
    Ok(distances.row_iter().map(|row| row.iter().copied().collect()).collect())
}

/// Smallest planar distance between any two agents over a list of state sequences.
#[pyfunction]
fn min_distance(states: Vec<Vec<Vec<f64>>>) -> PyResult<f64> {
    let trajectories = states
        .into_iter()
        .map(|seq| {
            let states: Vec<DVector<f64>> = seq.into_iter().map(DVector::from_vec).collect();
            let horizon = states.len().saturating_sub(1);
            let controls = vec![DVector::zeros(0); horizon];
            Trajectory::new(states, controls)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(min_pairwise_distance(&trajectories))
}

#[pymodule]
fn dpilqr(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyAgent>()?;
    m.add_class::<PySolution>()?;

    m.add_function(wrap_pyfunction!(solve_decentralized, m)?)?;

    m.add_function(wrap_pyfunction!(swap_pair_scenario, m)?)?;
    m.add_function(wrap_pyfunction!(rotating_swap_scenario, m)?)?;
    m.add_function(wrap_pyfunction!(random_scenario, m)?)?;
    m.add_function(wrap_pyfunction!(min_distance, m)?)?;
    m.add_function(wrap_pyfunction!(compute_pairwise_distance, m)?)?;

    Ok(())
}
