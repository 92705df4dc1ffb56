pub mod cleanup;
pub mod kill;
pub mod replot;
pub mod resume;
pub mod run;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use calib_run::{CalibConfig, CalibManager, FinalizeReport, LocalExecutor};
use clap::Args;
use serde_json::json;

use crate::models;

/// Directory, under the calibration root, holding local executor suites.
pub const LOCAL_SUITES_DIR: &str = ".local-suites";

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// YAML configuration of the calibration.
    #[arg(long)]
    pub config: PathBuf,
}

/// Builds a manager backed by the in-process executor.
pub fn manager(args: &ConfigArgs) -> Result<CalibManager, Box<dyn Error>> {
    let config = CalibConfig::load(&args.config)?;
    let executor = LocalExecutor::new(
        config.directory.join(LOCAL_SUITES_DIR),
        models::lookup(&config.local.model)?,
    )
    .with_workers(config.local.workers);
    Ok(CalibManager::new(config, Arc::new(executor))?)
}

pub fn print_report(report: &FinalizeReport) -> Result<(), Box<dyn Error>> {
    let orphans: Vec<String> = report.orphans.iter().map(ToString::to_string).collect();
    let summary = json!({
        "iterations": report.iterations,
        "param_names": report.final_samples.param_names,
        "weighted_mean": report.final_samples.weighted_mean(),
        "final_points": report.final_samples.points.len(),
        "orphans": orphans,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
