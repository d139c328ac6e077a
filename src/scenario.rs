//! # Scenarios
//!
//! Builders for the standard multi-agent setups:
//!
//! - **swap_pair**: two agents trading places head-on, offset laterally
//! - **rotating_swap**: agents on a circle, each heading for its successor's start
//! - **far_apart_pair**: two agents on parallel lanes that never interact
//! - **random_setup**: seeded random starts and goals with a minimum spacing
//!
//! Agents get ids equal to their index. Non-positional state entries start at
//! zero; `face_goal` points heading-based models at their goals.

use crate::cost::CostSpec;
use crate::dynamics::DynamicsModel;
use crate::error::{DpilqrError, Result};
use crate::structs::{Agent, State};
use nalgebra::{DVector, Vector2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;
use std::sync::Arc;

/// State of `model` at `position` with every other entry zero.
pub fn planar_state(model: &dyn DynamicsModel, position: Vector2<f64>) -> State {
    let mut state = DVector::zeros(model.state_dim());
    state[0] = position.x;
    state[1] = position.y;
    state
}

fn agent_between(
    id: usize,
    start: Vector2<f64>,
    goal: Vector2<f64>,
    model: &Arc<dyn DynamicsModel>,
    cost: &CostSpec,
) -> Agent {
    Agent::new(
        id,
        planar_state(model.as_ref(), start),
        planar_state(model.as_ref(), goal),
        Arc::clone(model),
        cost.clone(),
    )
}

/// Points every agent's initial and goal heading along its start-to-goal line.
/// Agents whose model has no heading are left unchanged.
pub fn face_goal(agents: &mut [Agent]) {
    for agent in agents.iter_mut() {
        let Some(index) = agent.dynamics.heading_index() else {
            continue;
        };
        let dx = agent.goal_state[0] - agent.initial_state[0];
        let dy = agent.goal_state[1] - agent.initial_state[1];
        if dx == 0.0 && dy == 0.0 {
            continue;
        }
        let heading = dy.atan2(dx);
        agent.initial_state[index] = heading;
        agent.goal_state[index] = heading;
    }
}

/// Two agents `distance` apart on the x-axis swapping sides. Agent 0 travels
/// along `y = +lateral_offset`, agent 1 along `y = −lateral_offset`.
pub fn swap_pair(distance: f64, lateral_offset: f64, model: Arc<dyn DynamicsModel>, cost: &CostSpec) -> Vec<Agent> {
    let half = distance / 2.0;
    let mut agents = vec![
        agent_between(
            0,
            Vector2::new(-half, lateral_offset),
            Vector2::new(half, lateral_offset),
            &model,
            cost,
        ),
        agent_between(
            1,
            Vector2::new(half, -lateral_offset),
            Vector2::new(-half, -lateral_offset),
            &model,
            cost,
        ),
    ];
    face_goal(&mut agents);
    agents
}

/// `n_agents` evenly spaced on a circle of `radius`; agent i's goal is agent
/// (i+1)'s start.
pub fn rotating_swap(
    n_agents: usize,
    radius: f64,
    model: Arc<dyn DynamicsModel>,
    cost: &CostSpec,
) -> Result<Vec<Agent>> {
    if n_agents < 2 {
        return Err(DpilqrError::InvalidProblem(
            "rotating swap needs at least two agents".to_string(),
        ));
    }
    let slot = |i: usize| {
        let angle = TAU * (i % n_agents) as f64 / n_agents as f64;
        Vector2::new(radius * angle.cos(), radius * angle.sin())
    };
    let mut agents: Vec<Agent> = (0..n_agents)
        .map(|i| agent_between(i, slot(i), slot(i + 1), &model, cost))
        .collect();
    face_goal(&mut agents);
    Ok(agents)
}

/// Two agents moving the same way on parallel lanes `separation` apart.
pub fn far_apart_pair(separation: f64, travel: f64, model: Arc<dyn DynamicsModel>, cost: &CostSpec) -> Vec<Agent> {
    let mut agents = vec![
        agent_between(0, Vector2::new(0.0, 0.0), Vector2::new(travel, 0.0), &model, cost),
        agent_between(
            1,
            Vector2::new(0.0, separation),
            Vector2::new(travel, separation),
            &model,
            cost,
        ),
    ];
    face_goal(&mut agents);
    agents
}

const MAX_PLACEMENT_ATTEMPTS: usize = 10_000;

/// Draws `count` positions uniformly in `[-extent, extent]²`, each at least
/// `min_separation` from the ones drawn before it.
fn spaced_positions(
    rng: &mut StdRng,
    count: usize,
    extent: f64,
    min_separation: f64,
) -> Result<Vec<Vector2<f64>>> {
    let mut positions: Vec<Vector2<f64>> = Vec::with_capacity(count);
    let mut attempts = 0;
    while positions.len() < count {
        if attempts == MAX_PLACEMENT_ATTEMPTS {
            return Err(DpilqrError::InvalidProblem(format!(
                "could not place {count} points {min_separation} apart within extent {extent}"
            )));
        }
        attempts += 1;
        let candidate = Vector2::new(rng.gen_range(-extent..=extent), rng.gen_range(-extent..=extent));
        if positions.iter().all(|p| (p - candidate).norm() >= min_separation) {
            positions.push(candidate);
        }
    }
    Ok(positions)
}

/// `n_agents` with random starts and goals in a square of half-width
/// `extent`. Starts are pairwise at least `min_separation` apart, as are
/// goals. The same `seed` always gives the same agents.
pub fn random_setup(
    n_agents: usize,
    extent: f64,
    min_separation: f64,
    seed: u64,
    model: Arc<dyn DynamicsModel>,
    cost: &CostSpec,
) -> Result<Vec<Agent>> {
    if extent <= 0.0 || !extent.is_finite() || min_separation.is_nan() || min_separation < 0.0 {
        return Err(DpilqrError::InvalidProblem(format!(
            "random setup needs a positive extent and non-negative separation, got {extent} and {min_separation}"
        )));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let starts = spaced_positions(&mut rng, n_agents, extent, min_separation)?;
    let goals = spaced_positions(&mut rng, n_agents, extent, min_separation)?;
    let mut agents: Vec<Agent> = starts
        .into_iter()
        .zip(goals)
        .enumerate()
        .map(|(i, (start, goal))| agent_between(i, start, goal, &model, cost))
        .collect();
    face_goal(&mut agents);
    Ok(agents)
}
