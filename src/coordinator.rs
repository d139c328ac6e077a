//! # Distributed Coordinator
//!
//! Outer potential-game iteration across agents, in synchronous (Jacobi) rounds:
//!
//! 1. Every agent solves its own iLQR problem against the previous round's
//!    snapshot, coupled only to its neighbors in the current interaction graph.
//!    Solves within a round are independent and may run in parallel.
//! 2. Once all solves return, the new trajectories (optionally under-relaxed)
//!    form the next snapshot and the graph is rebuilt from it.
//! 3. The session is converged when no agent's trajectory moved more than the
//!    tolerance and the graph did not change.
//!
//! The round cap yields a flagged, non-converged result carrying the snapshot
//! with the lowest joint potential seen in any round. A diverged agent either
//! gets one retry from scratch or fails the round, depending on
//! [`DivergencePolicy`].

use crate::config::{CoordinatorConfig, DivergencePolicy};
use crate::cost::{AgentCost, Neighbor};
use crate::error::{DpilqrError, Result};
use crate::graph::InteractionGraph;
use crate::ilqr::{IlqrSolution, IlqrSolver};
use crate::parallel::map_agents;
use crate::structs::{Agent, Control, Trajectory};
use nalgebra::DVector;
use ordered_float::OrderedFloat;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};

/// Scalar diagnostics of one round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundDiagnostics {
    /// 1-based round number.
    pub round: usize,
    /// Largest state/control change of any agent against the previous snapshot.
    pub max_trajectory_delta: f64,
    /// Largest cost-to-go gradient norm over all agents' final backward passes.
    pub max_cost_to_go_norm: f64,
    /// iLQR iterations summed over the solves that produced this round.
    pub ilqr_iterations: usize,
    /// Joint potential of the new snapshot under the new graph.
    pub joint_potential: f64,
    pub edge_count: usize,
    /// Number of connected components of the new graph.
    pub components: usize,
    /// Ids of agents whose solve stopped at the iteration limit.
    pub unconverged_agents: Vec<usize>,
    /// Ids of agents that were re-solved from scratch after diverging.
    pub retried_agents: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConvergenceReport {
    pub rounds: Vec<RoundDiagnostics>,
    /// Round whose snapshot was returned: the last one on convergence,
    /// otherwise the one with the lowest joint potential.
    pub returned_round: usize,
}

impl ConvergenceReport {
    pub fn round_count(&self) -> usize {
        self.rounds.len()
    }

    pub fn last(&self) -> Option<&RoundDiagnostics> {
        self.rounds.last()
    }

    /// Sequence of `max_trajectory_delta`, one entry per round.
    pub fn deltas(&self) -> Vec<f64> {
        self.rounds.iter().map(|r| r.max_trajectory_delta).collect()
    }
}

#[derive(Debug, Clone)]
pub struct DistributedSolution {
    /// One trajectory per agent, in agent order.
    pub trajectories: Vec<Trajectory>,
    pub converged: bool,
    pub report: ConvergenceReport,
    /// Interaction graph over the returned trajectories.
    pub graph: InteractionGraph,
}

impl DistributedSolution {
    pub fn require_converged(self) -> Result<Self> {
        if self.converged {
            return Ok(self);
        }
        let max_delta = self
            .report
            .last()
            .map(|r| r.max_trajectory_delta)
            .unwrap_or(f64::INFINITY);
        Err(DpilqrError::CoordinatorDidNotConverge {
            rounds: self.report.round_count(),
            max_delta,
        })
    }
}

/// Lowest-potential snapshot seen so far.
struct BestSnapshot {
    round: usize,
    joint_potential: f64,
    trajectories: Vec<Trajectory>,
    graph: InteractionGraph,
}

/// Result of one agent's solve within a round.
struct AgentOutcome {
    solution: IlqrSolution,
    retried: bool,
}

pub struct DistributedSolver<'a> {
    agents: &'a [Agent],
    config: &'a CoordinatorConfig,
}

impl<'a> DistributedSolver<'a> {
    pub fn new(agents: &'a [Agent], config: &'a CoordinatorConfig) -> Self {
        DistributedSolver { agents, config }
    }

    /// Solve from zero-control initial guesses.
    pub fn solve(&self) -> Result<DistributedSolution> {
        self.solve_with_warm_start(None)
    }

    /// Solve starting from explicit per-agent trajectories.
    ///
    /// Only the warm start's controls are used; states are re-simulated from
    /// each agent's initial state.
    pub fn solve_with_warm_start(&self, warm_start: Option<&[Trajectory]>) -> Result<DistributedSolution> {
        self.validate()?;
        let config = self.config;

        let mut snapshot = self.initial_snapshot(warm_start)?;
        let mut graph =
            InteractionGraph::from_trajectories(&snapshot, config.interaction_radius, None, config.hysteresis_margin);
        let mut report = ConvergenceReport::default();
        let mut best: Option<BestSnapshot> = None;

        info!(
            agents = self.agents.len(),
            horizon = config.horizon,
            edges = graph.edge_count(),
            "starting distributed solve"
        );

        for round in 1..=config.max_rounds {
            let outcomes = map_agents(
                self.agents.len(),
                |i| self.solve_agent(i, round, &snapshot, &graph),
                config.force_sequential,
            );
            // Fail on the lowest-indexed error so the outcome is independent of scheduling.
            let outcomes = outcomes.into_iter().collect::<Result<Vec<_>>>()?;

            let mut next = Vec::with_capacity(outcomes.len());
            for (i, outcome) in outcomes.iter().enumerate() {
                next.push(self.relax(i, &snapshot[i], &outcome.solution.trajectory)?);
            }

            let mut max_delta: f64 = 0.0;
            for (new, old) in next.iter().zip(&snapshot) {
                max_delta = max_delta.max(new.max_delta(old)?);
            }
            let next_graph = InteractionGraph::from_trajectories(
                &next,
                config.interaction_radius,
                Some(&graph),
                config.hysteresis_margin,
            );

            let diagnostics = RoundDiagnostics {
                round,
                max_trajectory_delta: max_delta,
                max_cost_to_go_norm: outcomes
                    .iter()
                    .map(|o| OrderedFloat(o.solution.cost_to_go_norm))
                    .max()
                    .map(|v| v.0)
                    .unwrap_or(0.0),
                ilqr_iterations: outcomes.iter().map(|o| o.solution.iterations).sum(),
                joint_potential: joint_potential(self.agents, &next, &next_graph),
                edge_count: next_graph.edge_count(),
                components: next_graph.connected_components().len(),
                unconverged_agents: self.ids_where(&outcomes, |o| !o.solution.converged()),
                retried_agents: self.ids_where(&outcomes, |o| o.retried),
            };
            info!(
                round,
                max_delta,
                joint_potential = diagnostics.joint_potential,
                edges = diagnostics.edge_count,
                components = diagnostics.components,
                iterations = diagnostics.ilqr_iterations,
                "round complete"
            );
            if !diagnostics.unconverged_agents.is_empty() {
                warn!(round, agents = ?diagnostics.unconverged_agents, "agents hit the iteration limit");
            }

            let converged = max_delta < config.tolerance && next_graph == graph;
            if best.as_ref().map_or(true, |b| diagnostics.joint_potential < b.joint_potential) {
                best = Some(BestSnapshot {
                    round,
                    joint_potential: diagnostics.joint_potential,
                    trajectories: next.clone(),
                    graph: next_graph.clone(),
                });
            }
            report.rounds.push(diagnostics);
            snapshot = next;
            graph = next_graph;

            if converged {
                info!(rounds = round, "distributed solve converged");
                report.returned_round = round;
                return Ok(DistributedSolution {
                    trajectories: snapshot,
                    converged: true,
                    report,
                    graph,
                });
            }
        }

        let (trajectories, graph) = match best {
            Some(best) => {
                report.returned_round = best.round;
                (best.trajectories, best.graph)
            }
            None => (snapshot, graph),
        };
        warn!(
            rounds = config.max_rounds,
            returned_round = report.returned_round,
            "round cap reached without convergence, returning the lowest-potential round"
        );
        Ok(DistributedSolution {
            trajectories,
            converged: false,
            report,
            graph,
        })
    }

    fn validate(&self) -> Result<()> {
        self.config.validate()?;
        if self.agents.is_empty() {
            return Err(DpilqrError::InvalidProblem("no agents to solve".to_string()));
        }
        let mut ids = HashSet::new();
        for agent in self.agents {
            agent.validate()?;
            if !ids.insert(agent.id) {
                return Err(DpilqrError::InvalidProblem(format!("duplicate agent id {}", agent.id)));
            }
            if agent.cost.proximity.radius > self.config.interaction_radius {
                return Err(DpilqrError::InvalidProblem(format!(
                    "agent {} penalizes proximity out to {} but agents only couple within {}",
                    agent.id, agent.cost.proximity.radius, self.config.interaction_radius
                )));
            }
            if (agent.dynamics.dt() - self.config.dt).abs() > 1e-12 {
                return Err(DpilqrError::InvalidProblem(format!(
                    "agent {} steps with dt = {} but the session uses dt = {}",
                    agent.id,
                    agent.dynamics.dt(),
                    self.config.dt
                )));
            }
        }
        Ok(())
    }

    fn initial_snapshot(&self, warm_start: Option<&[Trajectory]>) -> Result<Vec<Trajectory>> {
        let horizon = self.config.horizon;
        match warm_start {
            None => self
                .agents
                .iter()
                .map(|a| Trajectory::zero_control(a.dynamics.as_ref(), &a.initial_state, horizon))
                .collect(),
            Some(guesses) => {
                if guesses.len() != self.agents.len() {
                    return Err(DpilqrError::DimensionMismatch {
                        context: "warm start trajectory count",
                        expected: self.agents.len(),
                        actual: guesses.len(),
                    });
                }
                self.agents
                    .iter()
                    .zip(guesses)
                    .map(|(agent, guess)| {
                        if guess.horizon() != horizon {
                            return Err(DpilqrError::DimensionMismatch {
                                context: "warm start horizon",
                                expected: horizon,
                                actual: guess.horizon(),
                            });
                        }
                        Trajectory::rollout(agent.dynamics.as_ref(), &agent.initial_state, guess.controls().to_vec())
                    })
                    .collect()
            }
        }
    }

    fn solve_agent(
        &self,
        index: usize,
        round: usize,
        snapshot: &[Trajectory],
        graph: &InteractionGraph,
    ) -> Result<AgentOutcome> {
        let agent = &self.agents[index];
        let neighbors = graph
            .neighbors(index)
            .into_iter()
            .map(|j| Neighbor {
                id: self.agents[j].id,
                trajectory: &snapshot[j],
            })
            .collect();
        let cost = AgentCost::new(agent.id, &agent.cost, &agent.goal_state, neighbors);
        let dynamics = agent.dynamics.as_ref();

        let first = IlqrSolver::new(dynamics, cost.clone(), &self.config.ilqr)
            .solve(&agent.initial_state, snapshot[index].controls());
        let err = match first {
            Ok(solution) => {
                return Ok(AgentOutcome {
                    solution,
                    retried: false,
                })
            }
            Err(err) if err.is_divergence() => err,
            Err(err) => return Err(err),
        };

        let diverged = |source: DpilqrError| DpilqrError::AgentDiverged {
            agent: agent.id,
            round,
            source: Box::new(source),
        };
        match self.config.divergence_policy {
            DivergencePolicy::Abort => {
                warn!(agent = agent.id, round, error = %err, "agent diverged, aborting");
                Err(diverged(err))
            }
            DivergencePolicy::RetryFromScratch => {
                warn!(agent = agent.id, round, error = %err, "agent diverged, retrying from scratch");
                let loosened = self.config.ilqr.loosened();
                let zeros: Vec<Control> = vec![DVector::zeros(dynamics.control_dim()); self.config.horizon];
                match IlqrSolver::new(dynamics, cost, &loosened).solve(&agent.initial_state, &zeros) {
                    Ok(solution) => Ok(AgentOutcome {
                        solution,
                        retried: true,
                    }),
                    Err(retry_err) if retry_err.is_divergence() => {
                        warn!(agent = agent.id, round, error = %retry_err, "retry diverged");
                        Err(diverged(retry_err))
                    }
                    Err(retry_err) => Err(retry_err),
                }
            }
        }
    }

    /// Blend the new controls with the previous ones, `u ← (1−λ)·u_prev + λ·u_new`,
    /// and re-simulate so the result stays dynamically feasible.
    fn relax(&self, index: usize, previous: &Trajectory, solved: &Trajectory) -> Result<Trajectory> {
        let lambda = self.config.relaxation;
        if lambda >= 1.0 {
            return Ok(solved.clone());
        }
        let agent = &self.agents[index];
        let controls = previous
            .controls()
            .iter()
            .zip(solved.controls())
            .map(|(old, new)| old * (1.0 - lambda) + new * lambda)
            .collect();
        Trajectory::rollout(agent.dynamics.as_ref(), &agent.initial_state, controls)
    }

    fn ids_where(&self, outcomes: &[AgentOutcome], pred: impl Fn(&AgentOutcome) -> bool) -> Vec<usize> {
        outcomes
            .iter()
            .zip(self.agents)
            .filter(|(o, _)| pred(o))
            .map(|(_, a)| a.id)
            .collect()
    }
}

/// Joint potential: every agent's running and terminal cost plus, for each
/// edge, the pairwise proximity penalty summed over all H+1 timesteps.
///
/// Agents may weight proximity differently; an edge contributes the mean of
/// both endpoints' penalties.
pub fn joint_potential(agents: &[Agent], trajectories: &[Trajectory], graph: &InteractionGraph) -> f64 {
    let own: f64 = agents
        .iter()
        .zip(trajectories)
        .map(|(agent, traj)| AgentCost::uncoupled(agent.id, &agent.cost, &agent.goal_state).own_cost(traj))
        .sum();
    let coupling: f64 = graph
        .edges()
        .map(|(i, j)| {
            let (ti, tj) = (&trajectories[i], &trajectories[j]);
            let (ci, cj) = (&agents[i].cost.proximity, &agents[j].cost.proximity);
            (0..=ti.horizon().min(tj.horizon()))
                .map(|t| {
                    let (pi, pj) = (ti.position(t), tj.position(t));
                    0.5 * (ci.cost(&pi, &pj) + cj.cost(&pj, &pi))
                })
                .sum::<f64>()
        })
        .sum();
    own + coupling
}

/// Run the distributed solve from zero-control initial guesses.
pub fn solve(agents: &[Agent], config: &CoordinatorConfig) -> Result<DistributedSolution> {
    DistributedSolver::new(agents, config).solve()
}
