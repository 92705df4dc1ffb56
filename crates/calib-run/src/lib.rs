#![deny(missing_docs)]
#![doc = "Resumable calibration runs: configuration, checkpoints, executor and analyzer seams, the per-iteration state machine and the calibration manager."]

/// Simulation outputs to per-sample log-likelihoods.
pub mod analyzer;
/// Crash-safe calibration and iteration checkpoints.
pub mod checkpoint;
/// YAML configuration schema and defaults.
pub mod config;
/// Job execution backend contract.
pub mod executor;
/// Per-iteration state machine.
pub mod iteration;
/// In-process executor backed by a rayon pool.
pub mod local;
/// Calibration-level lifecycle operations.
pub mod manager;
/// Plotter hooks.
pub mod plot;
/// Leaderboard and final-sample tables.
pub mod summary;

pub use analyzer::{Analyzer, AnalyzerOutput, ScalarOutputAnalyzer, Site, WeightedAnalyzer};
pub use checkpoint::{CalibCheckpoint, IterationRecord, StatusEvent};
pub use config::{CalibConfig, LocalConfig, PollConfig, SeedPolicy};
pub use executor::{
    BatchRequest, Executor, JobHandle, SimState, SimulationHandle, SimulationOutput, SubmittedBatch,
};
pub use iteration::{IterationContext, IterationOutcome, IterationState};
pub use local::{LocalExecutor, ModelFn, ModelInput};
pub use manager::{
    CalibManager, ConflictPolicy, FinalizeReport, ResumePlan, ResumeRequest, StartOutcome,
};
pub use plot::{PlotContext, Plotter, SummaryPlotter};
