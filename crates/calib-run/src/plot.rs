use std::path::Path;

use calib_core::{CalibError, ResultTable, SampleSet};
use tracing::info;

/// What a plotter sees of one iteration.
#[derive(Debug, Clone, Copy)]
pub struct PlotContext<'a> {
    /// Calibration name.
    pub calibration: &'a str,
    /// Iteration being plotted.
    pub iteration: usize,
    /// Samples of the iteration.
    pub samples: &'a SampleSet,
    /// Results of every iteration up to and including this one.
    pub history: &'a ResultTable,
    /// Directory of the iteration, for any artefacts.
    pub directory: &'a Path,
}

/// Visualization hook invoked by the iteration state machine.
pub trait Plotter {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Called once the batch of an iteration has been submitted.
    fn after_commission(&self, _ctx: &PlotContext<'_>) -> Result<(), CalibError> {
        Ok(())
    }

    /// Called after the iteration's results were analyzed.
    fn plot(&self, ctx: &PlotContext<'_>) -> Result<(), CalibError>;
}

/// Logs the best rows of the leaderboard.
#[derive(Debug, Clone)]
pub struct SummaryPlotter {
    top: usize,
}

impl SummaryPlotter {
    /// Plotter reporting the `top` best samples.
    pub fn new(top: usize) -> Self {
        Self { top }
    }
}

impl Default for SummaryPlotter {
    fn default() -> Self {
        Self::new(5)
    }
}

impl Plotter for SummaryPlotter {
    fn name(&self) -> &str {
        "summary"
    }

    fn after_commission(&self, ctx: &PlotContext<'_>) -> Result<(), CalibError> {
        info!(
            calibration = ctx.calibration,
            iteration = ctx.iteration,
            samples = ctx.samples.len(),
            "batch commissioned"
        );
        Ok(())
    }

    fn plot(&self, ctx: &PlotContext<'_>) -> Result<(), CalibError> {
        let names = &ctx.history.param_names;
        for (rank, row) in ctx.history.leaderboard().into_iter().take(self.top).enumerate() {
            let params = names
                .iter()
                .zip(&row.params)
                .map(|(name, value)| format!("{name}={value:.4}"))
                .collect::<Vec<_>>()
                .join(" ");
            info!(
                calibration = ctx.calibration,
                iteration = ctx.iteration,
                rank = rank + 1,
                from_iteration = row.iteration,
                sample = row.sample,
                total = row.total,
                "{params}"
            );
        }
        Ok(())
    }
}
