//! # Centralized LQR Reference
//!
//! Closed-form solutions of the tracking problem
//!
//! ```text
//! min Σ_{t<H} (x_t − g)ᵀQ(x_t − g) + u_tᵀRu_t + (x_H − g)ᵀQ_f(x_H − g)
//! s.t. x_{t+1} = A x_t + B u_t,  x_0 given
//! ```
//!
//! for discrete linear dynamics, solved two independent ways:
//!
//! - `lqr_riccati`: affine Riccati recursion without regularization
//! - `lqr_batch_qp`: one equality-constrained QP over all states and controls,
//!   solved with OSQP
//!
//! Used to verify that iLQR recovers the LQR optimum when the problem is
//! already linear-quadratic.

use crate::cost::CostSpec;
use crate::error::{check_dim, DpilqrError, Result};
use crate::structs::{Control, State, Trajectory};
use nalgebra::{DMatrix, DVector};
use osqp::{CscMatrix, Problem, Settings};
use std::borrow::Cow;

fn check_problem(a: &DMatrix<f64>, b: &DMatrix<f64>, spec: &CostSpec, x0: &State, goal: &State) -> Result<()> {
    check_dim("reference A", a.nrows(), a.ncols())?;
    check_dim("reference B rows", a.nrows(), b.nrows())?;
    check_dim("reference initial state", a.nrows(), x0.len())?;
    check_dim("reference goal", a.nrows(), goal.len())?;
    spec.validate(a.nrows(), b.ncols())
}

/// Finite-horizon LQR by backward Riccati recursion on `V(x) = xᵀPx + 2pᵀx`.
pub fn lqr_riccati(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    spec: &CostSpec,
    x0: &State,
    goal: &State,
    horizon: usize,
) -> Result<Trajectory> {
    check_problem(a, b, spec, x0, goal)?;

    let mut p_mat = spec.qf.clone();
    let mut p_vec = -(&spec.qf * goal);
    let mut gains = Vec::with_capacity(horizon);

    for _ in 0..horizon {
        let s = &spec.r + b.transpose() * &p_mat * b;
        let cholesky = s.cholesky().ok_or_else(|| {
            DpilqrError::ReferenceSolve("R + BᵀPB is not positive definite".to_string())
        })?;
        let k_fb = cholesky.solve(&(b.transpose() * &p_mat * a));
        let k_ff = cholesky.solve(&(b.transpose() * &p_vec));

        let next_p_vec = -(&spec.q * goal) + a.transpose() * &p_vec - k_fb.transpose() * (b.transpose() * &p_vec);
        let next_p_mat = &spec.q + a.transpose() * &p_mat * a - a.transpose() * &p_mat * b * &k_fb;
        p_mat = (&next_p_mat + next_p_mat.transpose()) * 0.5;
        p_vec = next_p_vec;
        gains.push((k_fb, k_ff));
    }
    gains.reverse();

    let mut states = vec![x0.clone()];
    let mut controls: Vec<Control> = Vec::with_capacity(horizon);
    for (k_fb, k_ff) in &gains {
        let x = &states[states.len() - 1];
        let u = -(k_fb * x) - k_ff;
        let next = a * x + b * &u;
        controls.push(u);
        states.push(next);
    }
    Trajectory::new(states, controls)
}

/// Compressed-column matrix from (row, col, value) triplets.
fn csc_from_triplets(nrows: usize, ncols: usize, mut triplets: Vec<(usize, usize, f64)>) -> CscMatrix<'static> {
    triplets.sort_by(|l, r| (l.1, l.0).cmp(&(r.1, r.0)));
    let mut indptr = vec![0; ncols + 1];
    let mut indices = Vec::with_capacity(triplets.len());
    let mut data = Vec::with_capacity(triplets.len());
    for &(row, col, value) in &triplets {
        indptr[col + 1] += 1;
        indices.push(row);
        data.push(value);
    }
    for col in 0..ncols {
        indptr[col + 1] += indptr[col];
    }
    CscMatrix {
        nrows,
        ncols,
        indptr: Cow::Owned(indptr),
        indices: Cow::Owned(indices),
        data: Cow::Owned(data),
    }
}

/// Finite-horizon LQR as a single QP over `z = [x_0 … x_H, u_0 … u_{H−1}]`.
pub fn lqr_batch_qp(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    spec: &CostSpec,
    x0: &State,
    goal: &State,
    horizon: usize,
) -> Result<Trajectory> {
    check_problem(a, b, spec, x0, goal)?;
    let n_x = a.nrows();
    let n_u = b.ncols();
    let x_idx = |t: usize, i: usize| t * n_x + i;
    let u_idx = |t: usize, j: usize| (horizon + 1) * n_x + t * n_u + j;
    let n_var = (horizon + 1) * n_x + horizon * n_u;

    // Objective ½zᵀPz + qᵀz, P upper triangular
    let mut p_triplets = Vec::new();
    let mut q = vec![0.0; n_var];
    for t in 0..=horizon {
        let weight = if t < horizon { &spec.q } else { &spec.qf };
        let linear = -(weight * goal) * 2.0;
        for i in 0..n_x {
            q[x_idx(t, i)] = linear[i];
            for j in i..n_x {
                if weight[(i, j)] != 0.0 {
                    p_triplets.push((x_idx(t, i), x_idx(t, j), 2.0 * weight[(i, j)]));
                }
            }
        }
    }
    for t in 0..horizon {
        for i in 0..n_u {
            for j in i..n_u {
                if spec.r[(i, j)] != 0.0 {
                    p_triplets.push((u_idx(t, i), u_idx(t, j), 2.0 * spec.r[(i, j)]));
                }
            }
        }
    }

    // Equality constraints: x_0 = x0, x_{t+1} − A x_t − B u_t = 0
    let n_con = (horizon + 1) * n_x;
    let mut a_triplets = Vec::new();
    let mut bounds = vec![0.0; n_con];
    for i in 0..n_x {
        a_triplets.push((i, x_idx(0, i), 1.0));
        bounds[i] = x0[i];
    }
    for t in 0..horizon {
        for i in 0..n_x {
            let row = (t + 1) * n_x + i;
            a_triplets.push((row, x_idx(t + 1, i), 1.0));
            for j in 0..n_x {
                if a[(i, j)] != 0.0 {
                    a_triplets.push((row, x_idx(t, j), -a[(i, j)]));
                }
            }
            for j in 0..n_u {
                if b[(i, j)] != 0.0 {
                    a_triplets.push((row, u_idx(t, j), -b[(i, j)]));
                }
            }
        }
    }

    let p_matrix = csc_from_triplets(n_var, n_var, p_triplets);
    let a_matrix = csc_from_triplets(n_con, n_var, a_triplets);

    let settings = Settings::default()
        .verbose(false)
        .eps_abs(1e-10)
        .eps_rel(1e-10)
        .max_iter(50_000)
        .polishing(true);

    let mut problem = Problem::new(p_matrix, &q, a_matrix, &bounds, &bounds, &settings)
        .map_err(|e| DpilqrError::ReferenceSolve(format!("setup failed: {e:?}")))?;

    let result = problem.solve();
    let solution = match &result {
        osqp::Status::Solved(sol) => sol.x(),
        osqp::Status::SolvedInaccurate(sol) => sol.x(),
        osqp::Status::MaxIterationsReached(sol) => sol.x(),
        _ => return Err(DpilqrError::ReferenceSolve("OSQP found no solution".to_string())),
    };

    let controls: Vec<Control> = (0..horizon)
        .map(|t| DVector::from_fn(n_u, |j, _| solution[u_idx(t, j)]))
        .collect();

    // Roll the controls out so the returned trajectory is exactly feasible.
    let mut states = vec![x0.clone()];
    for u in &controls {
        let next = a * &states[states.len() - 1] + b * u;
        states.push(next);
    }
    Trajectory::new(states, controls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::ProximityCost;
    use approx::assert_relative_eq;
    use nalgebra::dvector;

    fn double_integrator(dt: f64) -> (DMatrix<f64>, DMatrix<f64>) {
        let a = DMatrix::from_row_slice(
            4,
            4,
            &[1.0, 0.0, dt, 0.0, 0.0, 1.0, 0.0, dt, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0],
        );
        let b = DMatrix::from_row_slice(4, 2, &[0.0, 0.0, 0.0, 0.0, dt, 0.0, 0.0, dt]);
        (a, b)
    }

    fn spec() -> CostSpec {
        CostSpec::diagonal(&[1.0, 1.0, 0.1, 0.1], &[0.1, 0.1], &[10.0, 10.0, 1.0, 1.0], ProximityCost::default())
    }

    #[test]
    fn test_riccati_and_qp_agree() {
        let (a, b) = double_integrator(0.1);
        let x0 = dvector![0.0, 0.0, 0.0, 0.0];
        let goal = dvector![1.0, -1.0, 0.0, 0.0];
        let riccati = lqr_riccati(&a, &b, &spec(), &x0, &goal, 12).unwrap();
        let qp = lqr_batch_qp(&a, &b, &spec(), &x0, &goal, 12).unwrap();
        for t in 0..12 {
            assert_relative_eq!(riccati.control(t), qp.control(t), epsilon = 1e-3);
        }
    }

    #[test]
    fn test_riccati_at_goal_applies_no_control() {
        let (a, b) = double_integrator(0.1);
        let goal = dvector![1.0, 2.0, 0.0, 0.0];
        let traj = lqr_riccati(&a, &b, &spec(), &goal, &goal, 5).unwrap();
        for u in traj.controls() {
            assert_relative_eq!(u, &dvector![0.0, 0.0], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_riccati_single_step_closed_form() {
        let (a, b) = double_integrator(0.1);
        let spec = spec();
        let x0 = dvector![0.0, 0.0, 0.0, 0.0];
        let goal = dvector![0.0, 0.0, 1.0, 0.0];
        let traj = lqr_riccati(&a, &b, &spec, &x0, &goal, 1).unwrap();
        // (R + BᵀQfB)⁻¹ BᵀQf (g − A x0) with R = 0.1, BᵀQfB = 0.01
        assert_relative_eq!(traj.control(0)[0], 0.1 / 0.11, epsilon = 1e-12);
        assert_relative_eq!(traj.control(0)[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_reference_rejects_mismatched_shapes() {
        let (a, b) = double_integrator(0.1);
        let x0 = dvector![0.0, 0.0];
        let goal = dvector![0.0, 0.0, 0.0, 0.0];
        assert!(matches!(
            lqr_riccati(&a, &b, &spec(), &x0, &goal, 3),
            Err(DpilqrError::DimensionMismatch { .. })
        ));
        assert!(lqr_batch_qp(&a, &b, &spec(), &x0, &goal, 3).is_err());
    }

    #[test]
    fn test_csc_from_triplets_column_order() {
        let m = csc_from_triplets(2, 3, vec![(1, 2, 5.0), (0, 0, 1.0), (1, 0, 2.0)]);
        assert_eq!(&m.indptr[..], &[0, 2, 2, 3]);
        assert_eq!(&m.indices[..], &[0, 1, 1]);
        assert_eq!(&m.data[..], &[1.0, 2.0, 5.0]);
    }
}
