//! # DPiLQR
//!
//! Distributed potential iLQR: multi-agent trajectory optimization with
//! Python bindings.
//!
//! ## Algorithms
//!
//! - **iLQR**: single-agent trajectory optimization by repeated linearization,
//!   a regularized Riccati backward pass and a line-searched forward pass.
//! - **Distributed coordination**: synchronous rounds in which every agent
//!   best-responds to its neighbors' previous trajectories. Pairwise proximity
//!   costs make the game a potential game, so rounds descend a joint potential.
//! - **Interaction graph**: agents couple only while their plans come within an
//!   interaction radius, with hysteresis between rounds.
//! - **LQR reference**: Riccati and OSQP batch solutions of the linear-quadratic
//!   case, used to check the solver.
//!
//! ## Usage
//!
//! Build [`Agent`]s (or use [`scenario`]), pick a [`CoordinatorConfig`] and call
//! [`solve`]. With the `python` feature the same entry point is exposed as
//! `solve_decentralized`.

pub mod config;
pub mod coordinator;
pub mod cost;
pub mod dynamics;
pub mod error;
pub mod graph;
pub mod ilqr;
pub mod parallel;
pub mod reference;
pub mod scenario;
pub mod structs;

#[cfg(feature = "python")]
mod python;

pub use config::{CoordinatorConfig, DivergencePolicy, IlqrConfig};
pub use coordinator::{
    joint_potential, solve, ConvergenceReport, DistributedSolution, DistributedSolver, RoundDiagnostics,
};
pub use cost::{AgentCost, CostSpec, ProximityCost};
pub use dynamics::{Bicycle5D, Car3D, DoubleIntegrator4D, DynamicsModel, LinearDynamics, Unicycle4D};
pub use error::{DpilqrError, Result};
pub use graph::InteractionGraph;
pub use ilqr::{solve_ilqr, IlqrSolution, IlqrSolver, IlqrStatus};
pub use structs::{min_pairwise_distance, Agent, Control, State, Trajectory};
