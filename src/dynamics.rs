//! # Dynamics Models
//!
//! The solver only sees the [`DynamicsModel`] capability: a discrete step and
//! its Jacobians. Models are stateless and shared read-only between agents.
//!
//! Continuous models are discretized with a zero-order-hold Euler step:
//! `x⁺ = x + f(x, u)·Δt`, `A = I + Δt·∂f/∂x`, `B = Δt·∂f/∂u`.
//!
//! All models keep the planar position in the first two state entries, which is
//! what the coupling cost and the interaction graph read.
//!
//! Ill-conditioned Jacobians are passed through unchanged; the solver's
//! regularization is the only guard against them.

use crate::error::{check_dim, Result};
use crate::structs::{Control, State};
use nalgebra::{DMatrix, DVector};

pub trait DynamicsModel: Send + Sync {
    fn name(&self) -> &'static str;
    fn state_dim(&self) -> usize;
    fn control_dim(&self) -> usize;
    fn dt(&self) -> f64;

    /// Next state after applying `u` for one timestep.
    fn step(&self, x: &State, u: &Control) -> Result<State>;

    /// Discrete Jacobians (A, B) at (x, u).
    fn linearize(&self, x: &State, u: &Control) -> Result<(DMatrix<f64>, DMatrix<f64>)>;

    /// State entry holding the heading angle, if the model has one.
    fn heading_index(&self) -> Option<usize> {
        None
    }
}

fn check_inputs(model: &dyn DynamicsModel, x: &State, u: &Control) -> Result<()> {
    check_dim("dynamics state", model.state_dim(), x.len())?;
    check_dim("dynamics control", model.control_dim(), u.len())
}

fn euler_step(x: &State, x_dot: DVector<f64>, dt: f64) -> State {
    x + x_dot * dt
}

fn discretize(f_x: DMatrix<f64>, f_u: DMatrix<f64>, dt: f64) -> (DMatrix<f64>, DMatrix<f64>) {
    let n = f_x.nrows();
    (DMatrix::identity(n, n) + f_x * dt, f_u * dt)
}

/// Planar double integrator. State `[px, py, vx, vy]`, control `[ax, ay]`.
#[derive(Debug, Clone, Copy)]
pub struct DoubleIntegrator4D {
    dt: f64,
}

impl DoubleIntegrator4D {
    pub fn new(dt: f64) -> Self {
        DoubleIntegrator4D { dt }
    }
}

impl DynamicsModel for DoubleIntegrator4D {
    fn name(&self) -> &'static str {
        "double_integrator_4d"
    }

    fn state_dim(&self) -> usize {
        4
    }

    fn control_dim(&self) -> usize {
        2
    }

    fn dt(&self) -> f64 {
        self.dt
    }

    fn step(&self, x: &State, u: &Control) -> Result<State> {
        check_inputs(self, x, u)?;
        let x_dot = DVector::from_vec(vec![x[2], x[3], u[0], u[1]]);
        Ok(euler_step(x, x_dot, self.dt))
    }

    fn linearize(&self, x: &State, u: &Control) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
        check_inputs(self, x, u)?;
        let mut f_x = DMatrix::zeros(4, 4);
        f_x[(0, 2)] = 1.0;
        f_x[(1, 3)] = 1.0;
        let mut f_u = DMatrix::zeros(4, 2);
        f_u[(2, 0)] = 1.0;
        f_u[(3, 1)] = 1.0;
        Ok(discretize(f_x, f_u, self.dt))
    }
}

/// Unicycle with speed state. State `[px, py, v, θ]`, control `[a, ω]`.
#[derive(Debug, Clone, Copy)]
pub struct Unicycle4D {
    dt: f64,
}

impl Unicycle4D {
    pub fn new(dt: f64) -> Self {
        Unicycle4D { dt }
    }
}

impl DynamicsModel for Unicycle4D {
    fn name(&self) -> &'static str {
        "unicycle_4d"
    }

    fn heading_index(&self) -> Option<usize> {
        Some(3)
    }

    fn state_dim(&self) -> usize {
        4
    }

    fn control_dim(&self) -> usize {
        2
    }

    fn dt(&self) -> f64 {
        self.dt
    }

    fn step(&self, x: &State, u: &Control) -> Result<State> {
        check_inputs(self, x, u)?;
        let (v, theta) = (x[2], x[3]);
        let x_dot = DVector::from_vec(vec![v * theta.cos(), v * theta.sin(), u[0], u[1]]);
        Ok(euler_step(x, x_dot, self.dt))
    }

    fn linearize(&self, x: &State, u: &Control) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
        check_inputs(self, x, u)?;
        let (v, theta) = (x[2], x[3]);
        let mut f_x = DMatrix::zeros(4, 4);
        f_x[(0, 2)] = theta.cos();
        f_x[(0, 3)] = -v * theta.sin();
        f_x[(1, 2)] = theta.sin();
        f_x[(1, 3)] = v * theta.cos();
        let mut f_u = DMatrix::zeros(4, 2);
        f_u[(2, 0)] = 1.0;
        f_u[(3, 1)] = 1.0;
        Ok(discretize(f_x, f_u, self.dt))
    }
}

/// Kinematic car driven directly by speed. State `[px, py, θ]`, control `[v, ω]`.
#[derive(Debug, Clone, Copy)]
pub struct Car3D {
    dt: f64,
}

impl Car3D {
    pub fn new(dt: f64) -> Self {
        Car3D { dt }
    }
}

impl DynamicsModel for Car3D {
    fn name(&self) -> &'static str {
        "car_3d"
    }

    fn heading_index(&self) -> Option<usize> {
        Some(2)
    }

    fn state_dim(&self) -> usize {
        3
    }

    fn control_dim(&self) -> usize {
        2
    }

    fn dt(&self) -> f64 {
        self.dt
    }

    fn step(&self, x: &State, u: &Control) -> Result<State> {
        check_inputs(self, x, u)?;
        let theta = x[2];
        let (v, omega) = (u[0], u[1]);
        let x_dot = DVector::from_vec(vec![v * theta.cos(), v * theta.sin(), omega]);
        Ok(euler_step(x, x_dot, self.dt))
    }

    fn linearize(&self, x: &State, u: &Control) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
        check_inputs(self, x, u)?;
        let theta = x[2];
        let v = u[0];
        let mut f_x = DMatrix::zeros(3, 3);
        f_x[(0, 2)] = -v * theta.sin();
        f_x[(1, 2)] = v * theta.cos();
        let mut f_u = DMatrix::zeros(3, 2);
        f_u[(0, 0)] = theta.cos();
        f_u[(1, 0)] = theta.sin();
        f_u[(2, 1)] = 1.0;
        Ok(discretize(f_x, f_u, self.dt))
    }
}

/// Bicycle with steering state. State `[px, py, v, θ, φ]`, control `[a, φ̇]`.
/// Heading rate is `tan φ` (unit wheelbase).
#[derive(Debug, Clone, Copy)]
pub struct Bicycle5D {
    dt: f64,
}

impl Bicycle5D {
    pub fn new(dt: f64) -> Self {
        Bicycle5D { dt }
    }
}

impl DynamicsModel for Bicycle5D {
    fn name(&self) -> &'static str {
        "bicycle_5d"
    }

    fn heading_index(&self) -> Option<usize> {
        Some(3)
    }

    fn state_dim(&self) -> usize {
        5
    }

    fn control_dim(&self) -> usize {
        2
    }

    fn dt(&self) -> f64 {
        self.dt
    }

    fn step(&self, x: &State, u: &Control) -> Result<State> {
        check_inputs(self, x, u)?;
        let (v, theta, phi) = (x[2], x[3], x[4]);
        let x_dot = DVector::from_vec(vec![
            v * theta.cos(),
            v * theta.sin(),
            u[0],
            phi.tan(),
            u[1],
        ]);
        Ok(euler_step(x, x_dot, self.dt))
    }

    fn linearize(&self, x: &State, u: &Control) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
        check_inputs(self, x, u)?;
        let (v, theta, phi) = (x[2], x[3], x[4]);
        let mut f_x = DMatrix::zeros(5, 5);
        f_x[(0, 2)] = theta.cos();
        f_x[(0, 3)] = -v * theta.sin();
        f_x[(1, 2)] = theta.sin();
        f_x[(1, 3)] = v * theta.cos();
        f_x[(3, 4)] = 1.0 / phi.cos().powi(2);
        let mut f_u = DMatrix::zeros(5, 2);
        f_u[(2, 0)] = 1.0;
        f_u[(4, 1)] = 1.0;
        Ok(discretize(f_x, f_u, self.dt))
    }
}

/// Discrete linear model `x⁺ = A x + B u`.
#[derive(Debug, Clone)]
pub struct LinearDynamics {
    a: DMatrix<f64>,
    b: DMatrix<f64>,
    dt: f64,
}

impl LinearDynamics {
    pub fn new(a: DMatrix<f64>, b: DMatrix<f64>, dt: f64) -> Result<Self> {
        check_dim("linear dynamics A columns", a.nrows(), a.ncols())?;
        check_dim("linear dynamics B rows", a.nrows(), b.nrows())?;
        Ok(LinearDynamics { a, b, dt })
    }

    pub fn a(&self) -> &DMatrix<f64> {
        &self.a
    }

    pub fn b(&self) -> &DMatrix<f64> {
        &self.b
    }
}

impl DynamicsModel for LinearDynamics {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn state_dim(&self) -> usize {
        self.a.nrows()
    }

    fn control_dim(&self) -> usize {
        self.b.ncols()
    }

    fn dt(&self) -> f64 {
        self.dt
    }

    fn step(&self, x: &State, u: &Control) -> Result<State> {
        check_inputs(self, x, u)?;
        Ok(&self.a * x + &self.b * u)
    }

    fn linearize(&self, x: &State, u: &Control) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
        check_inputs(self, x, u)?;
        Ok((self.a.clone(), self.b.clone()))
    }
}

/// Central-difference Jacobians of `model.step`, for models without analytic ones
/// and for checking those that have them.
pub fn linearize_finite_difference(
    model: &dyn DynamicsModel,
    x: &State,
    u: &Control,
) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
    check_inputs(model, x, u)?;
    let eps = f64::EPSILON.cbrt();
    let n_x = model.state_dim();
    let n_u = model.control_dim();

    let mut a = DMatrix::zeros(n_x, n_x);
    for j in 0..n_x {
        let mut plus = x.clone();
        let mut minus = x.clone();
        plus[j] += eps;
        minus[j] -= eps;
        let column = (model.step(&plus, u)? - model.step(&minus, u)?) / (2.0 * eps);
        a.set_column(j, &column);
    }

    let mut b = DMatrix::zeros(n_x, n_u);
    for j in 0..n_u {
        let mut plus = u.clone();
        let mut minus = u.clone();
        plus[j] += eps;
        minus[j] -= eps;
        let column = (model.step(x, &plus)? - model.step(x, &minus)?) / (2.0 * eps);
        b.set_column(j, &column);
    }

    Ok((a, b))
}

/// Look up a reference model by name. Used by the Python bindings.
pub fn model_by_name(name: &str, dt: f64) -> Option<std::sync::Arc<dyn DynamicsModel>> {
    use std::sync::Arc;
    match name {
        "double_integrator_4d" => Some(Arc::new(DoubleIntegrator4D::new(dt))),
        "unicycle_4d" => Some(Arc::new(Unicycle4D::new(dt))),
        "car_3d" => Some(Arc::new(Car3D::new(dt))),
        "bicycle_5d" => Some(Arc::new(Bicycle5D::new(dt))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DpilqrError;
    use approx::assert_relative_eq;
    use nalgebra::dvector;

    fn assert_jacobians_match(model: &dyn DynamicsModel, x: State, u: Control) {
        let (a, b) = model.linearize(&x, &u).unwrap();
        let (a_fd, b_fd) = linearize_finite_difference(model, &x, &u).unwrap();
        assert_relative_eq!(a, a_fd, epsilon = 1e-6);
        assert_relative_eq!(b, b_fd, epsilon = 1e-6);
    }

    #[test]
    fn test_double_integrator_step() {
        let model = DoubleIntegrator4D::new(0.1);
        let next = model.step(&dvector![0.0, 0.0, 1.0, 2.0], &dvector![10.0, 0.0]).unwrap();
        assert_relative_eq!(next, dvector![0.1, 0.2, 2.0, 2.0], epsilon = 1e-12);
    }

    #[test]
    fn test_unicycle_step_heading() {
        let model = Unicycle4D::new(0.5);
        let x = dvector![0.0, 0.0, 2.0, std::f64::consts::FRAC_PI_2];
        let next = model.step(&x, &dvector![0.0, 0.0]).unwrap();
        assert_relative_eq!(next[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(next[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_car_step() {
        let model = Car3D::new(1.0);
        let next = model.step(&dvector![1.0, 1.0, 0.0], &dvector![2.0, 0.3]).unwrap();
        assert_relative_eq!(next, dvector![3.0, 1.0, 0.3], epsilon = 1e-12);
    }

    #[test]
    fn test_analytic_jacobians_match_finite_difference() {
        assert_jacobians_match(&DoubleIntegrator4D::new(0.1), dvector![1.0, -2.0, 0.3, 0.4], dvector![0.5, -0.1]);
        assert_jacobians_match(&Unicycle4D::new(0.1), dvector![1.0, -2.0, 1.5, 0.7], dvector![0.5, -0.1]);
        assert_jacobians_match(&Car3D::new(0.1), dvector![1.0, -2.0, 2.1], dvector![1.2, 0.4]);
        assert_jacobians_match(&Bicycle5D::new(0.1), dvector![1.0, -2.0, 1.5, 0.7, 0.2], dvector![0.5, -0.1]);
    }

    #[test]
    fn test_linear_dynamics_exact_jacobian() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.1, 0.0, 1.0]);
        let b = DMatrix::from_row_slice(2, 1, &[0.0, 0.1]);
        let model = LinearDynamics::new(a.clone(), b.clone(), 0.1).unwrap();
        let (a_lin, b_lin) = model.linearize(&dvector![3.0, 4.0], &dvector![1.0]).unwrap();
        assert_eq!(a_lin, a);
        assert_eq!(b_lin, b);
        assert_relative_eq!(
            model.step(&dvector![1.0, 1.0], &dvector![1.0]).unwrap(),
            dvector![1.1, 1.1],
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_linear_dynamics_rejects_bad_shapes() {
        let a = DMatrix::zeros(2, 3);
        let b = DMatrix::zeros(2, 1);
        assert!(LinearDynamics::new(a, b, 0.1).is_err());
    }

    #[test]
    fn test_wrong_dimension_is_error() {
        let model = Unicycle4D::new(0.1);
        let err = model.step(&dvector![0.0, 0.0, 0.0], &dvector![0.0, 0.0]).unwrap_err();
        assert!(matches!(err, DpilqrError::DimensionMismatch { expected: 4, actual: 3, .. }));
        assert!(model.linearize(&dvector![0.0, 0.0, 0.0, 0.0], &dvector![0.0]).is_err());
    }

    #[test]
    fn test_model_by_name() {
        assert_eq!(model_by_name("car_3d", 0.1).unwrap().state_dim(), 3);
        assert_eq!(model_by_name("bicycle_5d", 0.1).unwrap().state_dim(), 5);
        assert_eq!(model_by_name("car_3d", 0.1).unwrap().heading_index(), Some(2));
        assert_eq!(model_by_name("double_integrator_4d", 0.1).unwrap().heading_index(), None);
        assert!(model_by_name("hovercraft", 0.1).is_none());
    }
}
