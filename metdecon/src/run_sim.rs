use crate::common::*;
use crate::input::{write_count_table, CountTable};
use crate::run_deconv::write_proportions;

use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Beta, Binomial, Distribution, Gamma, Poisson};

#[derive(Parser, Debug, Clone)]
pub struct SimArgs {
    /// number of tissues in the simulated atlas
    #[arg(long, default_value_t = 8)]
    n_tissues: usize,

    /// number of marker regions
    #[arg(long, default_value_t = 200)]
    n_markers: usize,

    /// number of cfDNA samples
    #[arg(long, default_value_t = 20)]
    n_samples: usize,

    /// mean sequencing depth per marker (Poisson rate)
    #[arg(long, default_value_t = 100.0)]
    coverage: f64,

    /// Dirichlet concentration of the mixing proportions; small values
    /// give sparse mixtures
    #[arg(long, default_value_t = 1.0)]
    concentration: f64,

    /// random seed
    #[arg(short, long, default_value_t = 42)]
    rseed: u64,

    /// output file header; writes {output}.atlas.tsv,
    /// {output}.cfdna.tsv and {output}.truth.csv
    #[arg(short, long, required = true)]
    output: Box<str>,

    /// verbosity
    #[arg(long, short)]
    verbose: bool,
}

pub struct SimulatedDataset {
    pub atlas: CountTable,
    pub cfdna: CountTable,
    /// ground-truth mixing proportions, samples x tissues
    pub alpha: Mat,
}

pub fn run_simulate(args: SimArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let mut rng = StdRng::seed_from_u64(args.rseed);
    let dataset = generate_dataset(&args, &mut rng)?;

    let atlas_file = format!("{}.atlas.tsv", args.output);
    let cfdna_file = format!("{}.cfdna.tsv", args.output);
    let truth_file = format!("{}.truth.csv", args.output);

    write_count_table(&dataset.atlas, &atlas_file)?;
    write_count_table(&dataset.cfdna, &cfdna_file)?;
    write_proportions(
        &dataset.alpha,
        &dataset.cfdna.entity_names,
        &dataset.atlas.entity_names,
        0,
        &truth_file,
    )?;

    info!("simulated atlas stored at {}", atlas_file);
    info!("simulated cfdna cohort stored at {}", cfdna_file);
    info!("ground-truth proportions stored at {}", truth_file);
    Ok(())
}

/// Draw a full synthetic dataset from an explicit, seedable generator.
///
/// Pure-tissue methylation rates come from a bimodal Beta so markers
/// are informative; mixing proportions are Dirichlet rows (normalized
/// Gamma draws); depths are Poisson; methylated counts are Binomial
/// given the mixed rate `alpha . gamma`.
pub fn generate_dataset(args: &SimArgs, rng: &mut StdRng) -> anyhow::Result<SimulatedDataset> {
    if args.n_tissues == 0 || args.n_markers == 0 || args.n_samples == 0 {
        anyhow::bail!("tissue, marker and sample counts must all be positive");
    }
    if args.coverage <= 0.0 {
        anyhow::bail!("coverage must be positive, got {}", args.coverage);
    }

    let beta_dist = Beta::new(0.3, 0.3)?;
    let gamma_dist = Gamma::new(args.concentration, 1.0)?;
    let poisson = Poisson::new(args.coverage)?;

    // pure-tissue methylation rates, kept off the (0,1) boundary
    let gamma = Mat::from_fn(args.n_tissues, args.n_markers, |_, _| {
        (beta_dist.sample(rng) as f32).clamp(0.01, 0.99)
    });

    let mut alpha = Mat::from_fn(args.n_samples, args.n_tissues, |_, _| {
        (gamma_dist.sample(rng) as f32).max(1e-6)
    });
    for mut row in alpha.row_iter_mut() {
        let total = row.sum();
        row /= total;
    }

    let mixed_rates = &alpha * &gamma;

    let sample_depth = |rng: &mut StdRng| poisson.sample(rng).max(1.0).round();
    let sample_counts = |depth: f64, rate: f32, rng: &mut StdRng| -> anyhow::Result<f32> {
        let p = (rate as f64).clamp(0.0, 1.0);
        let binomial = Binomial::new(depth as u64, p)?;
        Ok(binomial.sample(rng) as f32)
    };

    let mut atlas_depth = Mat::zeros(args.n_tissues, args.n_markers);
    let mut atlas_meth = Mat::zeros(args.n_tissues, args.n_markers);
    for t in 0..args.n_tissues {
        for j in 0..args.n_markers {
            let d = sample_depth(rng);
            atlas_depth[(t, j)] = d as f32;
            atlas_meth[(t, j)] = sample_counts(d, gamma[(t, j)], rng)?;
        }
    }

    let mut cfdna_depth = Mat::zeros(args.n_samples, args.n_markers);
    let mut cfdna_meth = Mat::zeros(args.n_samples, args.n_markers);
    for i in 0..args.n_samples {
        for j in 0..args.n_markers {
            let d = sample_depth(rng);
            cfdna_depth[(i, j)] = d as f32;
            cfdna_meth[(i, j)] = sample_counts(d, mixed_rates[(i, j)], rng)?;
        }
    }

    let marker_names: Vec<Box<str>> = (0..args.n_markers)
        .map(|j| {
            let chrom = 1 + j % 22;
            let start = 1000 * (j + 1);
            format!("chr{}-{}-{}", chrom, start, start + 500).into()
        })
        .collect();
    let tissue_names: Vec<Box<str>> = (0..args.n_tissues)
        .map(|t| format!("Tissue{}", t + 1).into())
        .collect();
    let sample_names: Vec<Box<str>> = (0..args.n_samples)
        .map(|i| format!("Sample{}", i + 1).into())
        .collect();

    Ok(SimulatedDataset {
        atlas: CountTable {
            methylated: atlas_meth,
            depths: atlas_depth,
            entity_names: tissue_names,
            marker_names: marker_names.clone(),
        },
        cfdna: CountTable {
            methylated: cfdna_meth,
            depths: cfdna_depth,
            entity_names: sample_names,
            marker_names,
        },
        alpha,
    })
}
