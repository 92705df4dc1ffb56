//! The contract every next-point algorithm implements.

use calib_core::serde::to_json_value;
use calib_core::{CalibError, FinalSamples, ResultTable, SampleSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::imis::ImisState;
use crate::optim_tool::OptimToolState;

/// Serializable snapshot of any next-point algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", content = "state", rename_all = "kebab-case")]
pub enum NextPointState {
    /// Incremental mixture importance sampling.
    Imis(ImisState),
    /// Stochastic-perturbation gradient ascent.
    OptimTool(OptimToolState),
}

impl NextPointState {
    /// Short name of the algorithm that produced the snapshot.
    pub fn algorithm(&self) -> &'static str {
        match self {
            NextPointState::Imis(_) => "imis",
            NextPointState::OptimTool(_) => "optim-tool",
        }
    }
}

/// Strategy choosing the parameter vectors of each iteration.
///
/// Every method is called from the single control thread, one at a time.
/// Implementations validate their configuration in their constructor so a
/// bad setting fails before any simulation is commissioned.
pub trait NextPointAlgorithm {
    /// Initial design for iteration 0, model-derived candidates afterwards.
    ///
    /// Calling it again for an iteration that was already generated returns
    /// the same samples without touching the model.
    fn get_samples_for_iteration(&mut self, iteration: usize) -> Result<SampleSet, CalibError>;

    /// Ingests per-sample outcomes; repeated identical calls leave the same state.
    fn set_results_for_iteration(
        &mut self,
        iteration: usize,
        results: &ResultTable,
    ) -> Result<(), CalibError>;

    /// Secondary bookkeeping once results are set.
    fn update_iteration(&mut self, iteration: usize) -> Result<(), CalibError>;

    /// Stopping rule.
    fn end_condition(&self) -> bool;

    /// Points (and weights) reported once the algorithm stopped.
    fn get_final_samples(&self) -> Result<FinalSamples, CalibError>;

    /// Full snapshot of the internal model.
    fn get_state(&self) -> NextPointState;

    /// Restores a snapshot produced by [`NextPointAlgorithm::get_state`].
    fn set_state(&mut self, state: NextPointState) -> Result<(), CalibError>;

    /// Calibrated parameter names in vector order.
    fn get_param_names(&self) -> Vec<String>;

    /// How the algorithm wants an iteration's results persisted.
    fn get_results_to_cache(&self, results: &ResultTable) -> Result<Value, CalibError> {
        to_json_value(&results.rows)
    }

    /// Re-synchronizes the model with a (possibly truncated) result history
    /// after a snapshot was restored for a resume.
    fn prepare_for_resume(&mut self, _history: &ResultTable) -> Result<(), CalibError> {
        Ok(())
    }
}
