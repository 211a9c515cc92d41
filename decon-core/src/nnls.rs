use crate::common::*;

/// Outcome of a bounded non-negative least-squares solve.
pub struct NnlsFit {
    pub coefficients: DVec,
    /// outer iterations actually spent; hitting the cap is not an error
    pub iterations: usize,
}

const GRADIENT_TOL: f32 = 1e-6;
const RIDGE: f32 = 1e-8;

/// Solve `min_x ||a x - b||^2` subject to `x >= 0` with a
/// Lawson-Hanson style active-set method.
///
/// `a` is `n_obs x n_coef`. The solve is best-effort: when `max_iter`
/// outer iterations are exhausted the current iterate is returned as
/// is, together with the number of iterations used.
pub fn nnls(a: &Mat, b: &DVec, max_iter: usize) -> NnlsFit {
    let n_coef = a.ncols();
    let mut x = DVec::zeros(n_coef);
    let mut passive = vec![false; n_coef];
    let mut iterations = 0;

    while iterations < max_iter {
        iterations += 1;

        // gradient of the residual: a^T (b - a x)
        let residual = b - a * &x;
        let gradient = a.transpose() * residual;

        // most violating coefficient still clamped at zero
        let mut best = GRADIENT_TOL;
        let mut entering = None;
        for (i, &g) in gradient.iter().enumerate() {
            if !passive[i] && g > best {
                best = g;
                entering = Some(i);
            }
        }
        let Some(entering) = entering else {
            break;
        };
        passive[entering] = true;

        // refit on the passive set until the subproblem stays nonnegative
        loop {
            let active: Vec<usize> = (0..n_coef).filter(|&i| passive[i]).collect();
            if active.is_empty() {
                break;
            }
            let Some(z) = solve_subproblem(a, b, &active) else {
                break;
            };

            // entries within rounding noise of zero count as feasible
            if z.iter().all(|&v| v >= -GRADIENT_TOL) {
                x.fill(0.0);
                for (zi, &i) in z.iter().zip(active.iter()) {
                    x[i] = zi.max(0.0);
                }
                break;
            }

            // step toward z until the first coefficient hits zero
            let mut alpha = f32::MAX;
            let mut leaving = None;
            for (zi, &i) in z.iter().zip(active.iter()) {
                if *zi < -GRADIENT_TOL {
                    let denom = x[i] - *zi;
                    if denom > f32::EPSILON {
                        let ratio = x[i] / denom;
                        if ratio < alpha {
                            alpha = ratio;
                            leaving = Some(i);
                        }
                    }
                }
            }
            let Some(leaving) = leaving else {
                // no finite step: accept the clamped refit and stop
                x.fill(0.0);
                for (zi, &i) in z.iter().zip(active.iter()) {
                    x[i] = zi.max(0.0);
                }
                break;
            };
            for (zi, &i) in z.iter().zip(active.iter()) {
                x[i] += alpha * (*zi - x[i]);
            }
            passive[leaving] = false;
            x[leaving] = 0.0;
        }
    }

    NnlsFit {
        coefficients: x,
        iterations,
    }
}

/// Unconstrained least squares restricted to the `active` columns,
/// via ridge-stabilized normal equations.
fn solve_subproblem(a: &Mat, b: &DVec, active: &[usize]) -> Option<DVec> {
    let sub = a.select_columns(active.iter());
    let mut ata = sub.transpose() * &sub;
    let atb = sub.transpose() * b;
    for i in 0..ata.nrows() {
        ata[(i, i)] += RIDGE;
    }
    ata.lu().solve(&atb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn recovers_nonnegative_combination() {
        // b = 2*col0 + 0.5*col2, col1 unused
        let a = Mat::from_row_iterator(
            4,
            3,
            [
                1.0, 0.0, 0.0, //
                0.0, 1.0, 2.0, //
                1.0, 0.0, 2.0, //
                0.0, 1.0, 0.0,
            ],
        );
        let truth = DVec::from_vec(vec![2.0, 0.0, 0.5]);
        let b = &a * &truth;

        let fit = nnls(&a, &b, 100);
        for i in 0..3 {
            assert_abs_diff_eq!(fit.coefficients[i], truth[i], epsilon = 1e-4);
        }
        assert!(fit.iterations <= 100);
    }

    #[test]
    fn negative_contribution_is_clamped_to_zero() {
        let a = Mat::from_row_iterator(
            3,
            2,
            [
                1.0, 1.0, //
                1.0, 0.0, //
                0.0, 1.0,
            ],
        );
        // best unconstrained fit would give column 1 a negative weight
        let b = DVec::from_vec(vec![1.0, 2.0, -1.0]);

        let fit = nnls(&a, &b, 100);
        assert!(fit.coefficients.iter().all(|&v| v >= 0.0));
        assert_eq!(fit.coefficients[1], 0.0);
        assert!(fit.coefficients[0] > 0.0);
    }

    #[test]
    fn near_collinear_columns_stay_finite() {
        // columns differing only by f32 rounding noise; the passive-set
        // refit for the redundant column lands within epsilon of zero
        let a = Mat::from_row_iterator(
            3,
            2,
            [
                1.0,
                1.0 + 1e-7,
                1.0,
                1.0,
                1.0,
                1.0 - 1e-7,
            ],
        );
        let b = DVec::from_vec(vec![1.0, 1.0, 1.0]);

        let fit = nnls(&a, &b, 100);
        assert!(fit.coefficients.iter().all(|v| v.is_finite()));
        assert!(fit.coefficients.iter().all(|&v| v >= 0.0));
        assert_abs_diff_eq!(fit.coefficients.sum(), 1.0, epsilon = 1e-3);
    }

    #[test]
    fn zero_target_yields_zero_solution() {
        let a = Mat::from_element(3, 2, 1.0);
        let b = DVec::zeros(3);
        let fit = nnls(&a, &b, 100);
        assert!(fit.coefficients.iter().all(|&v| v == 0.0));
        assert_eq!(fit.iterations, 1);
    }
}
