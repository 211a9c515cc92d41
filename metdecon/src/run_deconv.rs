use crate::common::*;
use crate::input::*;

use decon_core::model::{DeconvolveConfig, Deconvolver};

use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Parser, Debug, Clone)]
pub struct DeconvArgs {
    /// reference atlas count file (tsv, optionally gzipped):
    /// markers as rows, one methylated and one depth column per tissue
    #[arg(short, long, required = true)]
    atlas: Box<str>,

    /// cfDNA cohort count file, same layout with one column pair per
    /// sample, covering the same marker regions as the atlas
    #[arg(short, long, required = true)]
    cfdna: Box<str>,

    /// where to write the deconvolution results as a CSV file
    /// (e.g. alpha.csv)
    #[arg(short, long, required = true)]
    out: Box<str>,

    /// number of unknown tissues to infer and add to the atlas
    #[arg(short = 'u', long, default_value_t = 0)]
    n_unknown_tissues: usize,

    /// importance attached to the coverage (must be >= 0)
    #[arg(short, long, default_value_t = 0.5)]
    beta: f32,

    /// maximum number of optimization iterations
    #[arg(long, default_value_t = 2000)]
    max_n_iter: usize,

    /// iterations without improvement tolerated before early stopping
    #[arg(long, default_value_t = 1000)]
    patience: usize,

    /// verbosity
    #[arg(long, short)]
    verbose: bool,
}

pub fn run_deconvolve(args: DeconvArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    if !args.beta.is_finite() || args.beta < 0.0 {
        anyhow::bail!("beta must be a nonnegative number, got {}", args.beta);
    }

    let atlas = load_count_table(&args.atlas)?;
    let cfdna = load_count_table(&args.cfdna)?;
    validate_matching_markers(&atlas, &cfdna)?;

    info!("input atlas file: {}", args.atlas);
    info!("input cfdna file: {}", args.cfdna);
    info!("cfdna profiles: {}", cfdna.entity_names.len());
    info!("tissues in the atlas: {}", atlas.entity_names.len());
    info!("markers: {}", atlas.marker_names.len());

    let config = DeconvolveConfig {
        beta: args.beta,
        n_unknown_tissues: args.n_unknown_tissues,
        max_n_iter: args.max_n_iter,
        patience: args.patience,
        show_progress: !args.verbose,
        verbose: args.verbose,
        ..Default::default()
    };

    let mut model = Deconvolver::new(
        &atlas.methylated,
        &atlas.depths,
        &cfdna.methylated,
        &cfdna.depths,
        config,
    )?;
    let alpha = model.deconvolute()?;

    write_proportions(
        &alpha,
        &cfdna.entity_names,
        &atlas.entity_names,
        args.n_unknown_tissues,
        &args.out,
    )?;
    info!("deconvolution results stored at {}", args.out);
    Ok(())
}

/// CSV with one row per sample; values are percentages with three
/// decimals, unknown tissues labeled `Unknown{i}`.
pub fn write_proportions(
    alpha: &Mat,
    sample_names: &[Box<str>],
    tissue_names: &[Box<str>],
    n_unknown_tissues: usize,
    output_file: &str,
) -> anyhow::Result<()> {
    if let Some(folder) = Path::new(output_file).parent() {
        if !folder.as_os_str().is_empty() {
            std::fs::create_dir_all(folder)?;
        }
    }

    let mut buf = BufWriter::new(File::create(output_file)?);

    let mut header = vec!["Sample".to_string()];
    header.extend(tissue_names.iter().map(|n| n.to_string()));
    header.extend((0..n_unknown_tissues).map(|i| format!("Unknown{}", i + 1)));
    writeln!(buf, "{}", header.join(","))?;

    for (i, sample) in sample_names.iter().enumerate() {
        let mut fields = vec![sample.to_string()];
        for j in 0..alpha.ncols() {
            fields.push(format!("{:.3}", 100.0 * alpha[(i, j)]));
        }
        writeln!(buf, "{}", fields.join(","))?;
    }
    buf.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proportions_csv_lists_unknown_columns() {
        let alpha = Mat::from_row_iterator(1, 3, [0.5, 0.25, 0.25]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha.csv");
        let path = path.to_str().unwrap();

        write_proportions(
            &alpha,
            &["S1".into()],
            &["Liver".into(), "Blood".into()],
            1,
            path,
        )
        .unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "Sample,Liver,Blood,Unknown1");
        assert_eq!(lines.next().unwrap(), "S1,50.000,25.000,25.000");
    }
}
