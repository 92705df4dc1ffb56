use std::error::Error;

use calib_core::StatusPoint;
use calib_run::ResumeRequest;
use clap::Args;
use tracing::warn;

use super::{manager, print_report, ConfigArgs};

#[derive(Args, Debug)]
pub struct ResumeArgs {
    #[command(flatten)]
    pub target: ConfigArgs,
    /// Iteration to restart; defaults to the latest.
    #[arg(long)]
    pub iteration: Option<usize>,
    /// Transition to restart from, e.g. `commission` or `analyze`.
    #[arg(long)]
    pub iter_step: Option<StatusPoint>,
    /// Accept that the executor location differs from the recorded one.
    #[arg(long)]
    pub confirm_location_change: bool,
}

pub fn run(args: &ResumeArgs) -> Result<(), Box<dyn Error>> {
    let mut manager = manager(&args.target)?;
    let request = ResumeRequest {
        iteration: args.iteration,
        status: args.iter_step,
        confirm_location_change: args.confirm_location_change,
    };
    match manager.resume(request) {
        Ok(report) => print_report(&report),
        Err(err) if err.is_soft() => {
            warn!("{err}");
            Err("rerun with --confirm-location-change to resume from commission".into())
        }
        Err(err) => Err(err.into()),
    }
}
