use nalgebra::{DMatrix, DVector};

use crate::{Error, Result};

/// Residual function: writes the error vector for the given parameters.
pub type ResidualFn<'a> = &'a dyn Fn(&DVector<f64>, &mut DVector<f64>);

/// Analytic Jacobian: writes d err / d params for the given parameters.
pub type JacobianFn<'a> = &'a dyn Fn(&DVector<f64>, &mut DMatrix<f64>);

/// Constraint callback: pulls an over-parameterised vector back onto its
/// manifold after every accepted or trial update.
pub type ConstrainFn<'a> = &'a dyn Fn(&mut DVector<f64>);

pub struct LmOptions {
    pub max_iterations: usize,
    pub initial_lambda: f64,
    pub max_lambda: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            initial_lambda: 1e-3,
            max_lambda: 1e10,
        }
    }
}

/// Forward-difference step for parameter `p`: relative with an absolute floor.
#[inline]
pub(crate) fn numeric_delta(p: f64) -> f64 {
    (1e-3 * p).abs().max(1e-5)
}

/// Numeric Jacobian in the same style as the solvers: forward differences
/// against a pre-computed base error vector.
pub fn numeric_jacobian(
    params: &DVector<f64>,
    base_err: &DVector<f64>,
    f: ResidualFn,
    jac: &mut DMatrix<f64>,
) {
    let mut p = params.clone();
    let mut err = DVector::zeros(base_err.len());
    for c in 0..params.len() {
        let delta = numeric_delta(params[c]);
        p[c] = params[c] + delta;
        f(&p, &mut err);
        let inv = 1.0 / delta;
        for r in 0..base_err.len() {
            jac[(r, c)] = (err[r] - base_err[r]) * inv;
        }
        p[c] = params[c];
    }
}

/// Solves the lambda-augmented normal equations, Cholesky first with an LU
/// fallback for the indefinite case.
pub(crate) fn solve_normal_equations(lhs: DMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>> {
    if let Some(ch) = lhs.clone().cholesky() {
        return Ok(ch.solve(rhs));
    }
    lhs.lu()
        .solve(rhs)
        .ok_or_else(|| Error::NumericalFailure("singular normal equations".into()))
}

/// Levenberg-Marquardt minimisation of `|f(params)|²`.
///
/// `params` holds the starting point on call and the converged answer on
/// return; the residual 2-norm of the answer is returned. A reasonable
/// starting point matters, ideally from a linear method, since the iteration
/// can settle into a local minimum. The Jacobian is computed numerically
/// when `jacobian` is `None`; supplying one usually buys runtime, not
/// quality.
pub fn levenberg_marquardt(
    params: &mut DVector<f64>,
    residual_len: usize,
    f: ResidualFn,
    jacobian: Option<JacobianFn>,
    constrain: Option<ConstrainFn>,
    opts: &LmOptions,
) -> Result<f64> {
    if residual_len == 0 || params.is_empty() {
        return Err(Error::InvalidParameter(
            "LM needs at least one residual and one parameter".into(),
        ));
    }

    let n = params.len();
    let mut err = DVector::zeros(residual_len);
    f(params, &mut err);
    let mut err_norm = err.norm_squared();

    let mut jac = DMatrix::zeros(residual_len, n);
    let mut trial = DVector::zeros(n);
    let mut trial_err = DVector::zeros(residual_len);
    let mut lambda = opts.initial_lambda;

    for iteration in 0..opts.max_iterations {
        match jacobian {
            Some(dj) => dj(params, &mut jac),
            None => numeric_jacobian(params, &err, f, &mut jac),
        }

        let jtj = jac.transpose() * &jac;
        let jte = jac.transpose() * &err;

        while lambda <= opts.max_lambda {
            let mut lhs = jtj.clone();
            for i in 0..n {
                lhs[(i, i)] *= 1.0 + lambda;
            }
            let step = solve_normal_equations(lhs, &jte)?;

            trial.copy_from(params);
            trial -= &step;
            if let Some(c) = constrain {
                c(&mut trial);
            }

            f(&trial, &mut trial_err);
            let trial_norm = trial_err.norm_squared();
            if trial_norm < err_norm {
                err_norm = trial_norm;
                params.copy_from(&trial);
                err.copy_from(&trial_err);
                lambda *= 0.1;
                if lambda == 0.0 {
                    lambda = 1e-6;
                }
                tracing::debug!(iteration, residual = err_norm.sqrt(), "lm step accepted");
                break;
            }
            lambda *= 10.0;
        }
        if lambda > opts.max_lambda {
            break;
        }
    }

    Ok(err_norm.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quadratic_bowl() {
        // err = [p0 - 3, p1 + 2], minimum at (3, -2).
        let mut p = DVector::from_vec(vec![0.0, 0.0]);
        let f = |p: &DVector<f64>, e: &mut DVector<f64>| {
            e[0] = p[0] - 3.0;
            e[1] = p[1] + 2.0;
        };
        let res = levenberg_marquardt(&mut p, 2, &f, None, None, &LmOptions::default()).unwrap();
        assert!(res < 1e-6);
        assert!((p[0] - 3.0).abs() < 1e-4);
        assert!((p[1] + 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_rosenbrock() {
        // Classic banana valley, expressed as a two-term residual.
        let mut p = DVector::from_vec(vec![-1.2, 1.0]);
        let f = |p: &DVector<f64>, e: &mut DVector<f64>| {
            e[0] = 10.0 * (p[1] - p[0] * p[0]);
            e[1] = 1.0 - p[0];
        };
        let res = levenberg_marquardt(&mut p, 2, &f, None, None, &LmOptions::default()).unwrap();
        assert!(res < 1e-4, "residual {}", res);
        assert!((p[0] - 1.0).abs() < 1e-3);
        assert!((p[1] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_constraint_keeps_unit_norm() {
        // Fit a direction to noisy copies of itself under a unit-norm
        // constraint; the answer must stay on the sphere.
        let target = [0.6, 0.8];
        let mut p = DVector::from_vec(vec![1.0, 0.0]);
        let f = move |p: &DVector<f64>, e: &mut DVector<f64>| {
            e[0] = p[0] - target[0];
            e[1] = p[1] - target[1];
        };
        let c = |p: &mut DVector<f64>| {
            let n = p.norm();
            if n > 0.0 {
                *p /= n;
            }
        };
        levenberg_marquardt(&mut p, 2, &f, None, Some(&c), &LmOptions::default()).unwrap();
        assert!((p.norm() - 1.0).abs() < 1e-9);
        assert!((p[0] - 0.6).abs() < 1e-3);
    }

    #[test]
    fn test_analytic_jacobian_agrees() {
        let f = |p: &DVector<f64>, e: &mut DVector<f64>| {
            e[0] = p[0] * p[0] - 4.0;
        };
        let dj = |p: &DVector<f64>, j: &mut DMatrix<f64>| {
            j[(0, 0)] = 2.0 * p[0];
        };
        let mut p_num = DVector::from_vec(vec![1.0]);
        let mut p_ana = p_num.clone();
        levenberg_marquardt(&mut p_num, 1, &f, None, None, &LmOptions::default()).unwrap();
        levenberg_marquardt(&mut p_ana, 1, &f, Some(&dj), None, &LmOptions::default()).unwrap();
        assert!((p_num[0] - 2.0).abs() < 1e-4);
        assert!((p_ana[0] - 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_empty_problem_rejected() {
        let mut p = DVector::zeros(0);
        let f = |_: &DVector<f64>, _: &mut DVector<f64>| {};
        assert!(levenberg_marquardt(&mut p, 0, &f, None, None, &LmOptions::default()).is_err());
    }
}
