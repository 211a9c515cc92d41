use crate::common::*;
use crate::nnls::nnls;

/// Iteration cap for each per-sample least-squares solve. Best-effort:
/// whatever the solver holds at the cap is accepted.
pub const NNLS_MAX_ITER: usize = 3000;

/// Floor applied to proportions before the log transform, so that no
/// `-inf` can enter the unconstrained representation.
const ALPHA_FLOOR: f32 = 1e-6;

/// First estimate of the optimization variables, in unconstrained space.
pub struct InitialParams {
    /// samples x tissues, `ln(alpha)`
    pub alpha_logit: Mat,
    /// tissues x markers, `logit` of the (possibly expanded) atlas rates
    pub gamma_logit: Mat,
    /// known tissues plus synthesized unknowns
    pub n_tissues: usize,
}

/// Constrained least-squares initialization of tissue proportions.
///
/// Each cfDNA sample is regressed on the atlas methylation rates under
/// a nonnegativity constraint, weighting markers by the sample's
/// normalized depth. When `n_unknown_tissues > 0`, synthetic profiles
/// for tissues absent from the atlas are appended one at a time and
/// the regression is repeated with the expanded atlas.
///
/// Inputs must already be pseudo-count corrected; rates here are
/// guaranteed strictly inside (0,1) so the logit transform is safe.
pub fn initialize(
    atlas_meth: &Mat,
    atlas_depth: &Mat,
    cfdna_meth: &Mat,
    cfdna_depth: &Mat,
    n_unknown_tissues: usize,
) -> anyhow::Result<InitialParams> {
    let mut atlas_rates = atlas_meth.component_div(atlas_depth);
    let cfdna_rates = cfdna_meth.component_div(cfdna_depth);
    let total_depth = cfdna_depth.sum();
    let weights = cfdna_depth.map(|v| v / total_depth);

    let mut alpha = solve_proportions(&atlas_rates, &cfdna_rates, &weights);
    floor_rows(&mut alpha);

    if n_unknown_tissues > 0 {
        // per-marker envelope of the known profiles; the synthesized
        // rows snap to it and never leave (0,1)
        let n_markers = atlas_rates.ncols();
        let lower: Vec<f32> = (0..n_markers)
            .map(|j| atlas_rates.column(j).min())
            .collect();
        let upper: Vec<f32> = (0..n_markers)
            .map(|j| atlas_rates.column(j).max())
            .collect();

        for round in 0..n_unknown_tissues {
            let profile =
                synthesize_unknown_profile(&alpha, &atlas_rates, &cfdna_rates, &lower, &upper);
            atlas_rates = append_row(&atlas_rates, &profile);
            info!(
                "synthesized unknown tissue profile {} of {}",
                round + 1,
                n_unknown_tissues
            );
            alpha = solve_proportions(&atlas_rates, &cfdna_rates, &weights);
            floor_rows(&mut alpha);
        }
    }

    let alpha_logit = alpha.map(|v| v.ln());
    let gamma_logit = atlas_rates.map(|r| (r / (1.0 - r)).ln());
    let n_tissues = gamma_logit.nrows();

    Ok(InitialParams {
        alpha_logit,
        gamma_logit,
        n_tissues,
    })
}

/// Restore the simplex constraint after a least-squares round. Applied
/// after every round, so the residuals driving each synthesis step see
/// the floored proportions.
fn floor_rows(alpha: &mut Mat) {
    for mut row in alpha.row_iter_mut() {
        row.add_scalar_mut(ALPHA_FLOOR);
        let total = row.sum();
        row /= total;
    }
}

/// Depth-weighted NNLS per sample, rows renormalized to sum to one.
fn solve_proportions(atlas_rates: &Mat, cfdna_rates: &Mat, weights: &Mat) -> Mat {
    let n_samples = cfdna_rates.nrows();
    let n_tissues = atlas_rates.nrows();
    let n_markers = atlas_rates.ncols();
    let mut alpha = Mat::zeros(n_samples, n_tissues);

    for i in 0..n_samples {
        // rows of the atlas become columns of the design matrix,
        // each marker scaled by the root of its depth weight
        let mut design = Mat::zeros(n_markers, n_tissues);
        let mut target = DVec::zeros(n_markers);
        for j in 0..n_markers {
            let w = weights[(i, j)].sqrt();
            for t in 0..n_tissues {
                design[(j, t)] = w * atlas_rates[(t, j)];
            }
            target[j] = w * cfdna_rates[(i, j)];
        }

        let fit = nnls(&design, &target, NNLS_MAX_ITER);
        log::debug!("sample {}: nnls used {} iterations", i, fit.iterations);

        let total = fit.coefficients.sum();
        for t in 0..n_tissues {
            alpha[(i, t)] = if total > 0.0 {
                fit.coefficients[t] / total
            } else {
                1.0 / n_tissues as f32
            };
        }
    }

    alpha
}

/// Heuristic profile for a tissue missing from the atlas.
///
/// Markers systematically under-predicted by the current fit (median
/// residual <= 0 across samples) get the highest known rate, the rest
/// the lowest, pushing the new tissue toward explaining what the known
/// profiles cannot. A deliberate, tunable rule; kept as given.
pub fn synthesize_unknown_profile(
    alpha: &Mat,
    atlas_rates: &Mat,
    cfdna_rates: &Mat,
    lower: &[f32],
    upper: &[f32],
) -> Vec<f32> {
    let reconstructed = alpha * atlas_rates;
    let residuals = reconstructed - cfdna_rates;

    (0..residuals.ncols())
        .map(|j| {
            let mut column: Vec<f32> = residuals.column(j).iter().copied().collect();
            if median(&mut column) <= 0.0 {
                upper[j]
            } else {
                lower[j]
            }
        })
        .collect()
}

fn median(values: &mut [f32]) -> f32 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

fn append_row(mat: &Mat, row: &[f32]) -> Mat {
    let mut out = mat.clone().insert_row(mat.nrows(), 0.0);
    let last = mat.nrows();
    for (j, &v) in row.iter().enumerate() {
        out[(last, j)] = v;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pseudo_counts::{add_pseudo_counts, DEFAULT_PSEUDO_COUNT};
    use approx::assert_abs_diff_eq;

    fn toy_inputs() -> (Mat, Mat, Mat, Mat) {
        let atlas_meth = Mat::from_row_iterator(
            2,
            4,
            [
                90.0, 10.0, 80.0, 20.0, //
                10.0, 90.0, 30.0, 70.0,
            ],
        );
        let atlas_depth = Mat::from_element(2, 4, 100.0);
        let cfdna_meth = Mat::from_row_iterator(
            3,
            4,
            [
                50.0, 50.0, 55.0, 45.0, //
                74.0, 26.0, 70.0, 30.0, //
                26.0, 74.0, 40.0, 60.0,
            ],
        );
        let cfdna_depth = Mat::from_element(3, 4, 100.0);
        (atlas_meth, atlas_depth, cfdna_meth, cfdna_depth)
    }

    fn simplex_rows(alpha_logit: &Mat) {
        for row in alpha_logit.row_iter() {
            let total: f32 = row.iter().map(|v| v.exp()).sum();
            assert_abs_diff_eq!(total, 1.0, epsilon = 1e-5);
            assert!(row.iter().all(|v| v.exp() >= 0.0));
        }
    }

    #[test]
    fn proportions_lie_on_the_simplex() {
        let (am, ad, cm, cd) = toy_inputs();
        let (am, ad) = add_pseudo_counts(&am, &ad, DEFAULT_PSEUDO_COUNT).unwrap();
        let (cm, cd) = add_pseudo_counts(&cm, &cd, DEFAULT_PSEUDO_COUNT).unwrap();

        let init = initialize(&am, &ad, &cm, &cd, 0).unwrap();
        assert_eq!(init.n_tissues, 2);
        assert_eq!(init.alpha_logit.shape(), (3, 2));
        simplex_rows(&init.alpha_logit);
    }

    #[test]
    fn unknown_tissues_expand_the_atlas() {
        let (am, ad, cm, cd) = toy_inputs();
        let (am, ad) = add_pseudo_counts(&am, &ad, DEFAULT_PSEUDO_COUNT).unwrap();
        let (cm, cd) = add_pseudo_counts(&cm, &cd, DEFAULT_PSEUDO_COUNT).unwrap();

        let init = initialize(&am, &ad, &cm, &cd, 2).unwrap();
        assert_eq!(init.n_tissues, 4);
        assert_eq!(init.alpha_logit.shape(), (3, 4));
        assert_eq!(init.gamma_logit.shape(), (4, 4));
        simplex_rows(&init.alpha_logit);
    }

    #[test]
    fn proportions_stay_floored_across_synthesis_rounds() {
        let (am, ad, cm, cd) = toy_inputs();
        let (am, ad) = add_pseudo_counts(&am, &ad, DEFAULT_PSEUDO_COUNT).unwrap();
        let (cm, cd) = add_pseudo_counts(&cm, &cd, DEFAULT_PSEUDO_COUNT).unwrap();

        // synthesized profiles may get zero weight from the refit; the
        // floor keeps every log-proportion finite
        let init = initialize(&am, &ad, &cm, &cd, 2).unwrap();
        for v in init.alpha_logit.iter() {
            assert!(v.is_finite());
            assert!(v.exp() > 0.0);
        }
        simplex_rows(&init.alpha_logit);
    }

    #[test]
    fn even_mixture_is_recovered_closely() {
        let (am, ad, cm, cd) = toy_inputs();
        let (am, ad) = add_pseudo_counts(&am, &ad, DEFAULT_PSEUDO_COUNT).unwrap();
        let (cm, cd) = add_pseudo_counts(&cm, &cd, DEFAULT_PSEUDO_COUNT).unwrap();

        // sample 0 sits halfway between the two atlas profiles
        let init = initialize(&am, &ad, &cm, &cd, 0).unwrap();
        let a00 = init.alpha_logit[(0, 0)].exp();
        assert_abs_diff_eq!(a00, 0.5, epsilon = 0.1);
    }

    #[test]
    fn synthesized_profile_snaps_to_the_envelope() {
        let alpha = Mat::from_element(2, 2, 0.5);
        let atlas = Mat::from_row_iterator(2, 2, [0.2, 0.8, 0.4, 0.6]);
        // observed well above the reconstruction at marker 0,
        // well below at marker 1
        let cfdna = Mat::from_row_iterator(2, 2, [0.9, 0.1, 0.9, 0.1]);
        let lower = vec![0.2, 0.6];
        let upper = vec![0.4, 0.8];

        let profile = synthesize_unknown_profile(&alpha, &atlas, &cfdna, &lower, &upper);
        assert_eq!(profile, vec![0.4, 0.6]);
    }
}
