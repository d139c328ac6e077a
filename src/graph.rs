//! # Interaction Graph
//!
//! Undirected edges between agents whose planned positions come within the
//! interaction radius at any shared timestep. The graph is rebuilt from scratch
//! every round from a trajectory snapshot; edges are stored as ordered pairs
//! `(i, j)` with `i < j`, so it is symmetric and free of self-edges by
//! construction.
//!
//! Hysteresis: an edge present in the previous round survives until the
//! distance exceeds `radius + margin`, which keeps edges from flickering when
//! agents hover near the radius.

use crate::error::{DpilqrError, Result};
use crate::structs::Trajectory;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct InteractionGraph {
    n_agents: usize,
    edges: BTreeSet<(usize, usize)>,
}

fn ordered(i: usize, j: usize) -> (usize, usize) {
    if i < j {
        (i, j)
    } else {
        (j, i)
    }
}

/// True if the two trajectories come within `threshold` at any shared timestep.
fn within(a: &Trajectory, b: &Trajectory, threshold: f64) -> bool {
    a.states()
        .iter()
        .zip(b.states())
        .any(|(x, y)| ((x[0] - y[0]).powi(2) + (x[1] - y[1]).powi(2)).sqrt() < threshold)
}

impl InteractionGraph {
    pub fn empty(n_agents: usize) -> Self {
        InteractionGraph {
            n_agents,
            edges: BTreeSet::new(),
        }
    }

    /// Graph with explicit edges. Rejects self-edges and unknown agents.
    pub fn from_edges(n_agents: usize, edges: impl IntoIterator<Item = (usize, usize)>) -> Result<Self> {
        let mut graph = Self::empty(n_agents);
        for (i, j) in edges {
            if i == j {
                return Err(DpilqrError::InvalidProblem(format!("self-edge on agent {i}")));
            }
            if i >= n_agents || j >= n_agents {
                return Err(DpilqrError::InvalidProblem(format!(
                    "edge ({i}, {j}) refers to an agent outside 0..{n_agents}"
                )));
            }
            graph.edges.insert(ordered(i, j));
        }
        Ok(graph)
    }

    /// Threshold graph over a snapshot, with hysteresis against `previous`.
    ///
    /// `previous` is ignored when it describes a different number of agents.
    pub fn from_trajectories(
        snapshot: &[Trajectory],
        radius: f64,
        previous: Option<&InteractionGraph>,
        margin: f64,
    ) -> Self {
        let n = snapshot.len();
        let previous = previous.filter(|g| g.n_agents == n);
        let mut graph = Self::empty(n);
        for i in 0..n {
            for j in (i + 1)..n {
                let threshold = match previous {
                    Some(prev) if prev.contains(i, j) => radius + margin,
                    _ => radius,
                };
                if within(&snapshot[i], &snapshot[j], threshold) {
                    graph.edges.insert((i, j));
                }
            }
        }
        graph
    }

    pub fn contains(&self, i: usize, j: usize) -> bool {
        i != j && self.edges.contains(&ordered(i, j))
    }

    /// Neighbors of agent `i` in ascending order.
    pub fn neighbors(&self, i: usize) -> Vec<usize> {
        let mut out: Vec<usize> = self
            .edges
            .iter()
            .filter_map(|&(a, b)| {
                if a == i {
                    Some(b)
                } else if b == i {
                    Some(a)
                } else {
                    None
                }
            })
            .collect();
        out.sort_unstable();
        out
    }

    pub fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.edges.iter().copied()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Groups of mutually reachable agents, each sorted, ordered by first member.
    pub fn connected_components(&self) -> Vec<Vec<usize>> {
        let mut adjacency = vec![Vec::new(); self.n_agents];
        for &(i, j) in &self.edges {
            adjacency[i].push(j);
            adjacency[j].push(i);
        }

        let mut visited = vec![false; self.n_agents];
        let mut components = Vec::new();
        for start in 0..self.n_agents {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            let mut component = vec![start];
            let mut queue = VecDeque::from([start]);
            while let Some(current) = queue.pop_front() {
                for &next in &adjacency[current] {
                    if !visited[next] {
                        visited[next] = true;
                        component.push(next);
                        queue.push_back(next);
                    }
                }
            }
            component.sort_unstable();
            components.push(component);
        }
        components
    }
}
