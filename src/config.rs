//! # Solver Configuration
//!
//! Immutable configuration passed explicitly into every solve. Nothing in the
//! crate holds process-wide tunables; two solves with equal configs behave
//! identically.

use crate::error::{DpilqrError, Result};
use serde::{Deserialize, Serialize};

/// Tunables of the single-agent iLQR solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IlqrConfig {
    /// N_max: bound on backward/forward iterations.
    pub max_iterations: usize,
    /// Relative cost improvement below which the solve is converged.
    pub cost_tolerance: f64,
    /// Largest feedforward magnitude below which the solve is converged.
    pub control_tolerance: f64,
    pub mu_init: f64,
    pub mu_min: f64,
    pub mu_max: f64,
    /// Multiplier applied to μ after a failed backward or forward pass.
    pub mu_increase: f64,
    /// Multiplier applied to μ after an accepted step.
    pub mu_decrease: f64,
    /// Backtracking factor for the line search (α ← α·factor).
    pub line_search_factor: f64,
    /// Smallest step size the line search tries before giving up.
    pub min_step: f64,
}

impl Default for IlqrConfig {
    fn default() -> Self {
        IlqrConfig {
            max_iterations: 100,
            cost_tolerance: 1e-6,
            control_tolerance: 1e-6,
            mu_init: 1e-6,
            mu_min: 1e-8,
            mu_max: 1e10,
            mu_increase: 10.0,
            mu_decrease: 0.5,
            line_search_factor: 0.5,
            min_step: 1e-4,
        }
    }
}

impl IlqrConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(invalid("max_iterations must be positive"));
        }
        if !(self.cost_tolerance >= 0.0 && self.control_tolerance >= 0.0) {
            return Err(invalid("tolerances must be non-negative"));
        }
        if !(self.mu_min >= 0.0 && self.mu_min <= self.mu_init && self.mu_init <= self.mu_max) {
            return Err(invalid("regularization must satisfy 0 <= mu_min <= mu_init <= mu_max"));
        }
        if self.mu_increase <= 1.0 || !(self.mu_decrease > 0.0 && self.mu_decrease < 1.0) {
            return Err(invalid("mu_increase must exceed 1 and mu_decrease lie in (0, 1)"));
        }
        if !(self.line_search_factor > 0.0 && self.line_search_factor < 1.0) {
            return Err(invalid("line_search_factor must lie in (0, 1)"));
        }
        if !(self.min_step > 0.0 && self.min_step <= 1.0) {
            return Err(invalid("min_step must lie in (0, 1]"));
        }
        Ok(())
    }

    /// Step sizes tried by the line search: 1, f, f², ... down to `min_step`.
    pub fn step_sizes(&self) -> Vec<f64> {
        let mut steps = Vec::new();
        let mut alpha = 1.0;
        while alpha >= self.min_step {
            steps.push(alpha);
            alpha *= self.line_search_factor;
        }
        steps
    }

    /// Clamp a regularization value into [mu_min, mu_max].
    pub fn clamp_mu(&self, mu: f64) -> f64 {
        mu.max(self.mu_min).min(self.mu_max)
    }

    /// Looser variant used when the coordinator retries a diverged agent.
    pub fn loosened(&self) -> Self {
        IlqrConfig {
            mu_init: self.clamp_mu(self.mu_init.max(1e-3)),
            max_iterations: self.max_iterations * 2,
            min_step: (self.min_step * self.line_search_factor).max(f64::MIN_POSITIVE),
            ..self.clone()
        }
    }
}

/// What the coordinator does when one agent's solve diverges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergencePolicy {
    /// Re-solve the agent once from a zero-control guess with a looser config,
    /// then fail the round if it diverges again.
    RetryFromScratch,
    /// Fail the round immediately, naming the agent.
    Abort,
}

/// Tunables of the distributed outer iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// H: number of control steps; trajectories hold H+1 states.
    pub horizon: usize,
    /// Δt shared by every agent's dynamics.
    pub dt: f64,
    /// Agents closer than this at any shared timestep are coupled.
    pub interaction_radius: f64,
    /// Existing edges survive until the distance exceeds radius + margin.
    pub hysteresis_margin: f64,
    /// Joint convergence threshold on the largest per-agent trajectory change.
    pub tolerance: f64,
    pub max_rounds: usize,
    pub divergence_policy: DivergencePolicy,
    /// λ in (0, 1]: fraction of the new controls kept each round.
    pub relaxation: f64,
    /// Run per-agent solves sequentially even when the `parallel` feature is on.
    pub force_sequential: bool,
    pub ilqr: IlqrConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            horizon: 50,
            dt: 0.1,
            interaction_radius: 3.0,
            hysteresis_margin: 0.25,
            tolerance: 1e-3,
            max_rounds: 30,
            divergence_policy: DivergencePolicy::RetryFromScratch,
            relaxation: 1.0,
            force_sequential: false,
            ilqr: IlqrConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.horizon == 0 {
            return Err(invalid("horizon must be at least 1"));
        }
        if !(self.dt > 0.0 && self.dt.is_finite()) {
            return Err(invalid("dt must be positive and finite"));
        }
        if !(self.interaction_radius >= 0.0 && self.hysteresis_margin >= 0.0) {
            return Err(invalid("interaction radius and hysteresis margin must be non-negative"));
        }
        if !(self.tolerance >= 0.0) {
            return Err(invalid("tolerance must be non-negative"));
        }
        if self.max_rounds == 0 {
            return Err(invalid("max_rounds must be positive"));
        }
        if !(self.relaxation > 0.0 && self.relaxation <= 1.0) {
            return Err(invalid("relaxation must lie in (0, 1]"));
        }
        self.ilqr.validate()
    }
}

fn invalid(msg: &str) -> DpilqrError {
    DpilqrError::InvalidProblem(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(IlqrConfig::default().validate().is_ok());
        assert!(CoordinatorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_step_sizes_halving() {
        let config = IlqrConfig {
            min_step: 0.1,
            ..IlqrConfig::default()
        };
        assert_eq!(config.step_sizes(), vec![1.0, 0.5, 0.25, 0.125]);
    }

    #[test]
    fn test_clamp_mu() {
        let config = IlqrConfig::default();
        assert_eq!(config.clamp_mu(0.0), config.mu_min);
        assert_eq!(config.clamp_mu(1e20), config.mu_max);
        assert_eq!(config.clamp_mu(1.0), 1.0);
    }

    #[test]
    fn test_negative_mu_rejected() {
        let config = IlqrConfig {
            mu_min: -1.0,
            ..IlqrConfig::default()
        };
        assert!(matches!(config.validate(), Err(DpilqrError::InvalidProblem(_))));
    }

    #[test]
    fn test_zero_horizon_rejected() {
        let config = CoordinatorConfig {
            horizon: 0,
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_relaxation_bounds() {
        let config = CoordinatorConfig {
            relaxation: 0.0,
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_loosened_keeps_mu_in_range() {
        let config = IlqrConfig::default();
        let loose = config.loosened();
        assert!(loose.mu_init >= config.mu_init);
        assert!(loose.mu_init <= config.mu_max);
        assert_eq!(loose.max_iterations, config.max_iterations * 2);
        assert!(loose.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "horizon": 20,
            "interaction_radius": 2.0,
            "divergence_policy": "abort",
            "ilqr": { "max_iterations": 15 }
        }"#;
        let config: CoordinatorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.horizon, 20);
        assert_eq!(config.interaction_radius, 2.0);
        assert_eq!(config.divergence_policy, DivergencePolicy::Abort);
        assert_eq!(config.ilqr.max_iterations, 15);
        assert_eq!(config.ilqr.mu_max, IlqrConfig::default().mu_max);
        assert_eq!(config.dt, 0.1);
    }
}
