use crate::common::*;
use crate::tensor_convert::mat_to_tensor;

use candle_core::{Device, Result, Tensor};
use candle_nn::ops;

/// Depth-weighted squared reconstruction error on reparameterized
/// variables.
///
/// The free variables live in unconstrained space; the simplex and
/// (0,1) constraints are enforced here, by softmax and sigmoid, never
/// by projection. Gradients flow through both transforms via candle's
/// reverse-mode autodiff.
pub struct ReconstructionLoss {
    /// observed cfDNA methylation rates, samples x markers
    meth_rates: Tensor,
    /// `(depth / total_depth)^beta`, samples x markers
    weights: Tensor,
}

impl ReconstructionLoss {
    /// * `beta` - coverage-weighting exponent; 0 weighs every cell
    ///   equally, 1 weighs cells by their share of total depth
    pub fn new(
        cfdna_meth: &Mat,
        cfdna_depth: &Mat,
        beta: f32,
        device: &Device,
    ) -> Result<Self> {
        let rates = cfdna_meth.component_div(cfdna_depth);
        let total = cfdna_depth.sum();
        let weights = cfdna_depth.map(|d| (d / total).powf(beta));

        Ok(Self {
            meth_rates: mat_to_tensor(&rates, device)?,
            weights: mat_to_tensor(&weights, device)?,
        })
    }

    /// `sum w * (softmax(alpha_logit) . sigmoid(gamma_logit) - rates)^2`
    pub fn loss(&self, alpha_logit: &Tensor, gamma_logit: &Tensor) -> Result<Tensor> {
        let alpha = ops::softmax(alpha_logit, 1)?;
        let gamma = ops::sigmoid(gamma_logit)?;
        let reconstructed = alpha.matmul(&gamma)?;
        let squared_error = (reconstructed - &self.meth_rates)?.sqr()?;
        (&self.weights * squared_error)?.sum_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn toy_loss(beta: f32) -> (ReconstructionLoss, Tensor, Tensor) {
        let device = Device::Cpu;
        let meth = Mat::from_row_iterator(2, 3, [3.0, 6.0, 9.0, 8.0, 4.0, 2.0]);
        let depth = Mat::from_element(2, 3, 10.0);
        let loss = ReconstructionLoss::new(&meth, &depth, beta, &device).unwrap();

        let alpha_logit = Tensor::from_vec(vec![0.3_f32, -0.2, 0.1, 0.4], (2, 2), &device).unwrap();
        let gamma_logit =
            Tensor::from_vec(vec![-1.0_f32, 0.0, 1.0, 0.5, -0.5, 2.0], (2, 3), &device).unwrap();
        (loss, alpha_logit, gamma_logit)
    }

    #[test]
    fn transforms_respect_their_constraints() {
        let (_, alpha_logit, gamma_logit) = toy_loss(1.0);

        let alpha = ops::softmax(&alpha_logit, 1).unwrap();
        let rows: Vec<Vec<f32>> = alpha.to_vec2().unwrap();
        for row in rows {
            let total: f32 = row.iter().sum();
            assert_abs_diff_eq!(total, 1.0, epsilon = 1e-6);
            assert!(row.iter().all(|&v| v >= 0.0));
        }

        let gamma = ops::sigmoid(&gamma_logit).unwrap();
        let cells: Vec<Vec<f32>> = gamma.to_vec2().unwrap();
        for row in cells {
            assert!(row.iter().all(|&v| v > 0.0 && v < 1.0));
        }
    }

    #[test]
    fn loss_is_finite_and_nonnegative() {
        let (loss, alpha_logit, gamma_logit) = toy_loss(0.5);
        let value = loss
            .loss(&alpha_logit, &gamma_logit)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(value.is_finite());
        assert!(value >= 0.0);
    }

    #[test]
    fn beta_zero_weighs_every_cell_equally() {
        let (weighted, alpha_logit, gamma_logit) = toy_loss(0.0);
        let value = weighted
            .loss(&alpha_logit, &gamma_logit)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();

        // recompute the plain sum of squared errors by hand
        let device = Device::Cpu;
        let alpha = ops::softmax(&alpha_logit, 1).unwrap();
        let gamma = ops::sigmoid(&gamma_logit).unwrap();
        let recon = alpha.matmul(&gamma).unwrap();
        let meth = Mat::from_row_iterator(2, 3, [3.0, 6.0, 9.0, 8.0, 4.0, 2.0]);
        let depth = Mat::from_element(2, 3, 10.0);
        let rates = mat_to_tensor(&meth.component_div(&depth), &device).unwrap();
        let sse = (recon - &rates)
            .unwrap()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();

        assert_abs_diff_eq!(value, sse, epsilon = 1e-5);
    }
}
