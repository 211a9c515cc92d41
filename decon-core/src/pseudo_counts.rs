use crate::common::*;

pub const DEFAULT_PSEUDO_COUNT: f32 = 0.8;

/// Repair degenerate methylation counts before any rate is taken.
///
/// Cells observed at exactly 0% or 100% methylation would map to the
/// boundary of the (0,1) interval and break the log-odds transform
/// downstream. Each such cell receives a fractional pseudo-count whose
/// methylated share follows a prior rate built from the row and column
/// marginal rates of the matrix pair.
///
/// Returns the corrected `(methylated, depths)` pair. The inputs are
/// left untouched; correction happens once, at model construction.
pub fn add_pseudo_counts(
    methylated: &Mat,
    depths: &Mat,
    pc: f32,
) -> anyhow::Result<(Mat, Mat)> {
    if methylated.shape() != depths.shape() {
        anyhow::bail!(
            "methylated {:?} and depth {:?} matrices differ in shape",
            methylated.shape(),
            depths.shape()
        );
    }

    let mut meth = methylated.clone();
    let mut depth = depths.clone();
    let (nrows, ncols) = meth.shape();

    let total_depth: f32 = depth.sum();
    if total_depth <= 0.0 {
        anyhow::bail!("depth matrix sums to zero");
    }
    let avg_meth = meth.sum() / total_depth;

    // marginal rates, nudging fully un/over-methylated margins
    let marginal_rate = |m_tot: f32, d_tot: f32| -> f32 {
        if m_tot == 0.0 || m_tot == d_tot {
            (m_tot + pc * avg_meth) / (d_tot + pc)
        } else {
            m_tot / d_tot
        }
    };

    let row_rates: Vec<f32> = (0..nrows)
        .map(|i| marginal_rate(meth.row(i).sum(), depth.row(i).sum()))
        .collect();
    let col_rates: Vec<f32> = (0..ncols)
        .map(|j| marginal_rate(meth.column(j).sum(), depth.column(j).sum()))
        .collect();

    // prior rate per cell: outer product of the marginal rates
    for i in 0..nrows {
        for j in 0..ncols {
            let m = meth[(i, j)];
            let d = depth[(i, j)];
            if m == 0.0 || m == d {
                let prior = (row_rates[i] * col_rates[j]).clamp(0.01, 0.99);
                meth[(i, j)] = m + pc * prior;
                depth[(i, j)] = d + pc;
            }
        }
    }

    // a violation here means the input counts were malformed
    for i in 0..nrows {
        for j in 0..ncols {
            let m = meth[(i, j)];
            let d = depth[(i, j)];
            if !m.is_finite() || !d.is_finite() {
                anyhow::bail!("non-finite count at ({}, {}) after imputation", i, j);
            }
            if m <= 0.0 {
                anyhow::bail!("non-positive methylated count at ({}, {})", i, j);
            }
            if m >= d {
                anyhow::bail!(
                    "methylated count {} is not below depth {} at ({}, {})",
                    m,
                    d,
                    i,
                    j
                );
            }
        }
    }

    Ok((meth, depth))
}
