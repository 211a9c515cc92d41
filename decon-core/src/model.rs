use crate::common::*;
use crate::initializer::initialize;
use crate::objective::ReconstructionLoss;
use crate::optimizer::{MultiGroupOptimizer, ScheduleConfig};
use crate::pseudo_counts::{add_pseudo_counts, DEFAULT_PSEUDO_COUNT};
use crate::tensor_convert::{mat_to_tensor, tensor_to_mat};

use candle_core::{Device, Var};
use candle_nn::ops;
use indicatif::{ProgressBar, ProgressDrawTarget};

#[derive(Debug, Clone)]
pub struct DeconvolveConfig {
    /// coverage-weighting exponent of the loss; the engine default is
    /// 1.0 (full coverage-proportional weighting), the CLI passes 0.5
    pub beta: f32,
    /// tissues to infer beyond the atlas
    pub n_unknown_tissues: usize,
    pub max_n_iter: usize,
    /// consecutive non-improving iterations tolerated before stopping
    pub patience: usize,
    pub pseudo_count: f32,
    /// base learning rate for the proportion logits
    pub learning_rate: f64,
    pub schedule: ScheduleConfig,
    pub show_progress: bool,
    pub verbose: bool,
}

impl Default for DeconvolveConfig {
    fn default() -> Self {
        Self {
            beta: 1.0,
            n_unknown_tissues: 0,
            max_n_iter: 2000,
            patience: 1000,
            pseudo_count: DEFAULT_PSEUDO_COUNT,
            learning_rate: 1e-2,
            schedule: ScheduleConfig::default(),
            show_progress: false,
            verbose: false,
        }
    }
}

/// How a deconvolution run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// the stall counter reached `patience`
    Converged,
    MaxIterReached,
}

/// The deconvolution engine: pseudo-count imputation at construction,
/// constrained least-squares initialization, then iterative refinement
/// of the proportion logits under the depth-weighted reconstruction
/// loss.
///
/// Count matrices are corrected once, in `new`, and immutable
/// afterwards. The profile logits stay a held-fixed buffer in this
/// configuration; their gradient is computed every iteration and could
/// be registered as a second optimizer group.
pub struct Deconvolver {
    atlas_meth: Mat,
    atlas_depth: Mat,
    cfdna_meth: Mat,
    cfdna_depth: Mat,
    n_known_tissues: usize,
    config: DeconvolveConfig,
    loss_history: Vec<f32>,
    status: Option<RunStatus>,
}

impl Deconvolver {
    /// Validates and imputes both count pairs. Malformed inputs are
    /// fatal here, never repaired later.
    pub fn new(
        atlas_meth: &Mat,
        atlas_depth: &Mat,
        cfdna_meth: &Mat,
        cfdna_depth: &Mat,
        config: DeconvolveConfig,
    ) -> anyhow::Result<Self> {
        validate_pair(atlas_meth, atlas_depth, "atlas")?;
        validate_pair(cfdna_meth, cfdna_depth, "cfdna")?;
        if atlas_meth.ncols() != cfdna_meth.ncols() {
            anyhow::bail!(
                "atlas covers {} markers but cfdna covers {}",
                atlas_meth.ncols(),
                cfdna_meth.ncols()
            );
        }

        let (atlas_meth, atlas_depth) =
            add_pseudo_counts(atlas_meth, atlas_depth, config.pseudo_count)?;
        let (cfdna_meth, cfdna_depth) =
            add_pseudo_counts(cfdna_meth, cfdna_depth, config.pseudo_count)?;

        Ok(Self {
            n_known_tissues: atlas_meth.nrows(),
            atlas_meth,
            atlas_depth,
            cfdna_meth,
            cfdna_depth,
            config,
            loss_history: Vec::new(),
            status: None,
        })
    }

    pub fn n_known_tissues(&self) -> usize {
        self.n_known_tissues
    }

    pub fn n_samples(&self) -> usize {
        self.cfdna_meth.nrows()
    }

    /// One scalar loss per iteration of the last run.
    pub fn loss_history(&self) -> &[f32] {
        &self.loss_history
    }

    pub fn status(&self) -> Option<RunStatus> {
        self.status
    }

    /// Run the full pipeline and return the samples x tissues
    /// proportion matrix (known tissues first, then unknowns).
    pub fn deconvolute(&mut self) -> anyhow::Result<Mat> {
        let device = Device::Cpu;
        let config = self.config.clone();

        let init = initialize(
            &self.atlas_meth,
            &self.atlas_depth,
            &self.cfdna_meth,
            &self.cfdna_depth,
            config.n_unknown_tissues,
        )?;
        info!(
            "initialized {} samples over {} tissues ({} unknown)",
            self.n_samples(),
            init.n_tissues,
            config.n_unknown_tissues
        );

        let alpha_logit = Var::from_tensor(&mat_to_tensor(&init.alpha_logit, &device)?)?;
        let gamma_logit = Var::from_tensor(&mat_to_tensor(&init.gamma_logit, &device)?)?;

        let objective =
            ReconstructionLoss::new(&self.cfdna_meth, &self.cfdna_depth, config.beta, &device)?;

        let mut optimizer = MultiGroupOptimizer::new(config.schedule);
        optimizer.register(vec![alpha_logit.clone()], config.learning_rate)?;

        let pb = ProgressBar::new(config.max_n_iter as u64);
        if !config.show_progress || config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        self.loss_history.clear();
        self.status = None;
        let mut best_loss = f32::INFINITY;
        let mut stalled = 0;
        let mut status = RunStatus::MaxIterReached;

        for iteration in 0..config.max_n_iter {
            let loss_t = objective.loss(alpha_logit.as_tensor(), gamma_logit.as_tensor())?;
            let loss = loss_t.to_scalar::<f32>()?;

            if !loss.is_finite() {
                anyhow::bail!("loss became non-finite at iteration {}", iteration);
            }
            self.loss_history.push(loss);

            // a fresh gradient store per backward pass; dropping the
            // previous one is what clears accumulated gradients
            let grads = loss_t.backward()?;
            optimizer.step(loss, &grads)?;

            pb.inc(1);
            if config.verbose && iteration % 100 == 0 {
                info!("[{}] loss: {}", iteration, loss);
            }

            if loss >= best_loss {
                stalled += 1;
                if stalled >= config.patience {
                    status = RunStatus::Converged;
                    break;
                }
            } else {
                best_loss = loss;
                stalled = 0;
            }
        }
        pb.finish_and_clear();

        self.status = Some(status);
        info!(
            "finished after {} iterations ({:?}), best loss {}",
            self.loss_history.len(),
            status,
            best_loss.min(*self.loss_history.last().unwrap_or(&best_loss))
        );

        let alpha = ops::softmax(alpha_logit.as_tensor(), 1)?;
        Ok(tensor_to_mat(&alpha)?)
    }
}

fn validate_pair(meth: &Mat, depth: &Mat, label: &str) -> anyhow::Result<()> {
    if meth.shape() != depth.shape() {
        anyhow::bail!(
            "{}: methylated {:?} and depth {:?} matrices differ in shape",
            label,
            meth.shape(),
            depth.shape()
        );
    }
    if meth.nrows() == 0 || meth.ncols() == 0 {
        anyhow::bail!("{}: empty count matrix", label);
    }
    for i in 0..meth.nrows() {
        for j in 0..meth.ncols() {
            let m = meth[(i, j)];
            let d = depth[(i, j)];
            if m < 0.0 || d < 0.0 {
                anyhow::bail!("{}: negative count at ({}, {})", label, i, j);
            }
            if m > d {
                anyhow::bail!(
                    "{}: methylated count {} exceeds depth {} at ({}, {})",
                    label,
                    m,
                    d,
                    i,
                    j
                );
            }
        }
    }
    Ok(())
}
