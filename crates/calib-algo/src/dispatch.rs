//! Static dispatch over the configured algorithm.

use calib_core::{CalibError, FinalSamples, ResultTable, SampleSet};
use serde_json::Value;

use crate::config::AlgorithmConfig;
use crate::contract::{NextPointAlgorithm, NextPointState};
use crate::imis::Imis;
use crate::optim_tool::OptimTool;
use crate::prior::Prior;

/// Algorithm selected by an [`AlgorithmConfig`].
#[derive(Debug, Clone)]
pub enum NextPoint {
    /// Incremental mixture importance sampling.
    Imis(Imis),
    /// Stochastic-perturbation gradient ascent.
    OptimTool(OptimTool),
}

impl NextPoint {
    /// Builds and validates the configured algorithm.
    pub fn from_config(
        prior: Prior,
        config: &AlgorithmConfig,
        master_seed: u64,
    ) -> Result<Self, CalibError> {
        Ok(match config {
            AlgorithmConfig::Imis(config) => {
                NextPoint::Imis(Imis::new(prior, config.clone(), master_seed)?)
            }
            AlgorithmConfig::OptimTool(config) => {
                NextPoint::OptimTool(OptimTool::new(prior, config.clone(), master_seed)?)
            }
        })
    }

    fn inner(&self) -> &dyn NextPointAlgorithm {
        match self {
            NextPoint::Imis(algo) => algo,
            NextPoint::OptimTool(algo) => algo,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn NextPointAlgorithm {
        match self {
            NextPoint::Imis(algo) => algo,
            NextPoint::OptimTool(algo) => algo,
        }
    }
}

impl NextPointAlgorithm for NextPoint {
    fn get_samples_for_iteration(&mut self, iteration: usize) -> Result<SampleSet, CalibError> {
        self.inner_mut().get_samples_for_iteration(iteration)
    }

    fn set_results_for_iteration(
        &mut self,
        iteration: usize,
        results: &ResultTable,
    ) -> Result<(), CalibError> {
        self.inner_mut().set_results_for_iteration(iteration, results)
    }

    fn update_iteration(&mut self, iteration: usize) -> Result<(), CalibError> {
        self.inner_mut().update_iteration(iteration)
    }

    fn end_condition(&self) -> bool {
        self.inner().end_condition()
    }

    fn get_final_samples(&self) -> Result<FinalSamples, CalibError> {
        self.inner().get_final_samples()
    }

    fn get_state(&self) -> NextPointState {
        self.inner().get_state()
    }

    fn set_state(&mut self, state: NextPointState) -> Result<(), CalibError> {
        self.inner_mut().set_state(state)
    }

    fn get_param_names(&self) -> Vec<String> {
        self.inner().get_param_names()
    }

    fn get_results_to_cache(&self, results: &ResultTable) -> Result<Value, CalibError> {
        self.inner().get_results_to_cache(results)
    }

    fn prepare_for_resume(&mut self, history: &ResultTable) -> Result<(), CalibError> {
        self.inner_mut().prepare_for_resume(history)
    }
}
