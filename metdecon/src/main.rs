mod common;
mod input;
mod run_deconv;
mod run_sim;

use crate::run_deconv::*;
use crate::run_sim::*;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Estimate tissue-of-origin proportions for each cfDNA sample
    /// against a reference methylation atlas.
    Deconvolve(DeconvArgs),

    /// Generate a synthetic atlas/cfDNA dataset with known mixing
    /// proportions for simulation studies.
    Simulate(SimArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Deconvolve(args) => {
            run_deconvolve(args.clone())?;
        }
        Commands::Simulate(args) => {
            run_simulate(args.clone())?;
        }
    }

    Ok(())
}
