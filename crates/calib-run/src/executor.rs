use std::collections::BTreeMap;

use calib_core::{CalibError, SampleSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of one simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimState {
    /// Submitted, not started.
    Pending,
    /// Executing.
    Running,
    /// Finished with an output.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Stopped before completion.
    Cancelled,
}

impl SimState {
    /// True once the simulation can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(self, SimState::Succeeded | SimState::Failed | SimState::Cancelled)
    }
}

/// Persistable reference to a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    /// Backend identifier of the job.
    pub job_id: String,
    /// Suite the job belongs to.
    pub suite_id: String,
    /// Execution location that accepted the job.
    pub location: String,
}

/// One simulation of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationHandle {
    /// Backend identifier of the simulation.
    pub sim_id: String,
    /// Sample index the simulation evaluates.
    pub sample: usize,
    /// Replicate number.
    pub replicate: usize,
    /// Seed handed to the model.
    pub seed: u64,
}

/// Result of a batch submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedBatch {
    /// Handle of the new job.
    pub job: JobHandle,
    /// Simulations created for the job.
    pub simulations: Vec<SimulationHandle>,
}

/// Output of one successful simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationOutput {
    /// Sample index the simulation evaluated.
    pub sample: usize,
    /// Replicate number.
    pub replicate: usize,
    /// Model output document.
    pub values: Value,
}

/// Everything an executor needs to commission one iteration.
#[derive(Debug, Clone, Copy)]
pub struct BatchRequest<'a> {
    /// Iteration the batch belongs to.
    pub iteration: usize,
    /// Parameter vectors to simulate.
    pub samples: &'a SampleSet,
    /// Simulations per sample.
    pub replicates: usize,
    /// Master seed from which simulation seeds derive.
    pub master_seed: u64,
    /// Opaque simulation configuration block.
    pub config: &'a Value,
    /// Suite receiving the job.
    pub suite_id: &'a str,
}

/// Job execution backend.
///
/// Implementations are shared between the control thread and anyone issuing
/// a `kill`, hence `Send + Sync`.
pub trait Executor: Send + Sync {
    /// Label of the execution backend; compared on resume.
    fn location(&self) -> String;

    /// Creates a named suite and returns its id.
    fn create_suite(&self, name: &str) -> Result<String, CalibError>;

    /// Submits one simulation per sample and replicate.
    fn submit_batch(&self, request: &BatchRequest<'_>) -> Result<SubmittedBatch, CalibError>;

    /// Current state of every simulation keyed by simulation id.
    fn poll_status(&self, job: &JobHandle) -> Result<BTreeMap<String, SimState>, CalibError>;

    /// Requests cancellation of every non-terminal simulation.
    fn cancel(&self, job: &JobHandle) -> Result<(), CalibError>;

    /// Removes the job and its outputs.
    fn hard_delete(&self, job: &JobHandle) -> Result<(), CalibError>;

    /// Removes a suite and whatever it still holds.
    fn delete_suite(&self, suite_id: &str) -> Result<(), CalibError>;

    /// Jobs currently held by a suite.
    fn list_jobs(&self, suite_id: &str) -> Result<Vec<JobHandle>, CalibError>;

    /// Outputs of the job's successful simulations.
    fn outputs(&self, job: &JobHandle) -> Result<Vec<SimulationOutput>, CalibError>;

    /// True once every simulation is terminal.
    fn is_done(&self, job: &JobHandle) -> Result<bool, CalibError> {
        Ok(self.poll_status(job)?.values().all(|state| state.is_terminal()))
    }

    /// True when any simulation failed or was cancelled.
    fn any_failed_or_cancelled(&self, job: &JobHandle) -> Result<bool, CalibError> {
        Ok(self
            .poll_status(job)?
            .values()
            .any(|state| matches!(state, SimState::Failed | SimState::Cancelled)))
    }
}

/// Number of simulations per state.
pub fn count_states(states: &BTreeMap<String, SimState>) -> BTreeMap<SimState, usize> {
    let mut counts = BTreeMap::new();
    for state in states.values() {
        *counts.entry(*state).or_insert(0) += 1;
    }
    counts
}
