use std::error::Error;

use calib_run::ConflictPolicy;
use clap::{Args, ValueEnum};
use tracing::info;

use super::{manager, print_report, ConfigArgs};

/// What to do when the calibration directory already holds a run.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OnExisting {
    Resume,
    Backup,
    Clean,
    Replot,
    Abort,
}

impl From<OnExisting> for ConflictPolicy {
    fn from(value: OnExisting) -> Self {
        match value {
            OnExisting::Resume => ConflictPolicy::Resume,
            OnExisting::Backup => ConflictPolicy::BackupAndRestart,
            OnExisting::Clean => ConflictPolicy::CleanAndRestart,
            OnExisting::Replot => ConflictPolicy::Replot,
            OnExisting::Abort => ConflictPolicy::Abort,
        }
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub target: ConfigArgs,
    /// Policy applied to an existing calibration of the same name.
    #[arg(long, value_enum, default_value_t = OnExisting::Abort)]
    pub on_existing: OnExisting,
}

pub fn run(args: &RunArgs) -> Result<(), Box<dyn Error>> {
    let mut manager = manager(&args.target)?;
    match manager.run(args.on_existing.into())? {
        Some(report) => print_report(&report),
        None => {
            info!(
                directory = %manager.calibration_dir().display(),
                "existing calibration left in place"
            );
            Ok(())
        }
    }
}
