use std::error::Error;

use clap::{Parser, Subcommand};
use commands::{resume::ResumeArgs, run::RunArgs, ConfigArgs};
use tracing_subscriber::EnvFilter;

mod commands;
mod models;

#[derive(Parser, Debug)]
#[command(name = "calibtool", about = "Resumable model calibration driver")]
struct Cli {
    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a calibration, applying a policy to any existing run.
    Run(RunArgs),
    /// Continue an interrupted calibration from a chosen point.
    Resume(ResumeArgs),
    /// Cancel the running batch and wait until it has stopped.
    Kill(ConfigArgs),
    /// Delete every job, suite and checkpoint of a calibration.
    Cleanup(ConfigArgs),
    /// Re-run the plotters over existing results.
    Replot(ConfigArgs),
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&cli.log))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Command::Run(args) => commands::run::run(&args),
        Command::Resume(args) => commands::resume::run(&args),
        Command::Kill(args) => commands::kill::run(&args),
        Command::Cleanup(args) => commands::cleanup::run(&args),
        Command::Replot(args) => commands::replot::run(&args),
    }
}
