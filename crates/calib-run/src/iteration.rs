//! Per-iteration state machine.
//!
//! `run` performs whichever transitions of
//! `iteration_start -> commission -> running -> analyze -> plot -> next_point -> done`
//! have not completed yet, checkpointing the iteration after each one.
//! `resume` rewinds a loaded iteration so the next `run` re-executes exactly
//! the requested transition.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;

use calib_algo::{NextPointAlgorithm, NextPointState};
use calib_core::errors::{CalibError, ErrorInfo};
use calib_core::provenance::timestamp_now;
use calib_core::{ResultTable, SampleSet, StatusPoint};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::analyzer::{combine, Site};
use crate::checkpoint::{IterationRecord, StatusEvent};
use crate::config::PollConfig;
use crate::executor::{count_states, BatchRequest, Executor, SimState, SimulationOutput};
use crate::plot::{PlotContext, Plotter};
use crate::summary::{write_leaderboard, LEADERBOARD_FILE};

/// Collaborators shared by every iteration of a calibration.
pub struct IterationContext<'a> {
    /// Calibration name.
    pub calibration: &'a str,
    /// Calibration directory.
    pub calib_dir: &'a Path,
    /// Execution backend.
    pub executor: &'a dyn Executor,
    /// Sites and their analyzers.
    pub sites: &'a [Site],
    /// Plotters invoked after commission and analysis.
    pub plotters: &'a [Box<dyn Plotter>],
    /// Polling cadence.
    pub poll: &'a PollConfig,
    /// Simulations per sample.
    pub replicates: usize,
    /// Master seed for simulation seeds.
    pub master_seed: u64,
    /// Opaque simulation configuration block.
    pub simulation: &'a Value,
}

/// How an iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// The iteration reached `Done`; the calibration continues.
    Continue,
    /// The stopping rule fired after `Plot`.
    Finished,
}

/// One iteration and its checkpoint.
#[derive(Debug, Clone)]
pub struct IterationState {
    record: IterationRecord,
    calib_dir: PathBuf,
}

impl IterationState {
    /// Fresh iteration submitting into `suite_id`.
    pub fn new(calib_dir: &Path, iteration: usize, suite_id: &str) -> Self {
        Self {
            record: IterationRecord::new(iteration, suite_id),
            calib_dir: calib_dir.to_path_buf(),
        }
    }

    /// Loads a checkpointed iteration.
    pub fn load(calib_dir: &Path, iteration: usize) -> Result<Self, CalibError> {
        Ok(Self {
            record: IterationRecord::load(calib_dir, iteration)?,
            calib_dir: calib_dir.to_path_buf(),
        })
    }

    /// Persisted record.
    pub fn record(&self) -> &IterationRecord {
        &self.record
    }

    /// Iteration number.
    pub fn iteration(&self) -> usize {
        self.record.iteration
    }

    /// Last completed transition.
    pub fn status(&self) -> Option<StatusPoint> {
        self.record.status
    }

    /// Redirects future submissions to another suite, forgetting any job
    /// submitted to the previous one.
    pub fn set_suite(&mut self, suite_id: &str) {
        self.record.suite_id = suite_id.to_string();
        self.record.job = None;
        self.record.simulations.clear();
    }

    fn directory(&self) -> PathBuf {
        IterationRecord::dir(&self.calib_dir, self.record.iteration)
    }

    fn persist(&self) -> Result<(), CalibError> {
        self.record.store(&self.calib_dir)
    }

    fn samples(&self) -> Result<&SampleSet, CalibError> {
        self.record.samples.as_ref().ok_or_else(|| {
            CalibError::Serde(
                ErrorInfo::new("iteration-no-samples", "iteration has no persisted samples")
                    .with_context("iteration", self.record.iteration),
            )
        })
    }

    fn advance(
        &mut self,
        status: StatusPoint,
        algo: &dyn NextPointAlgorithm,
    ) -> Result<(), CalibError> {
        self.record.status = Some(status);
        self.record.timeline.push(StatusEvent {
            status,
            at: timestamp_now(),
        });
        self.record.algorithm_state = Some(algo.get_state());
        self.persist()?;
        info!(iteration = self.record.iteration, status = %status, "iteration transition");
        Ok(())
    }

    /// Performs every pending transition.
    pub fn run(
        &mut self,
        ctx: &IterationContext<'_>,
        algo: &mut dyn NextPointAlgorithm,
        history: &mut ResultTable,
    ) -> Result<IterationOutcome, CalibError> {
        while let Some(next) = StatusPoint::pending_after(self.record.status) {
            match next {
                StatusPoint::IterationStart => {
                    self.record.started_at = Some(timestamp_now());
                    self.advance(StatusPoint::IterationStart, algo)?;
                }
                StatusPoint::Commission => self.commission(ctx, algo, history)?,
                StatusPoint::Running => self.wait_for_batch(ctx, algo)?,
                StatusPoint::Analyze => self.analyze(ctx, algo, history)?,
                StatusPoint::Plot => self.plot(ctx, algo, history)?,
                // Also reached when resuming a plotted iteration, so a
                // converged run never commissions another batch.
                StatusPoint::NextPoint if algo.end_condition() => {
                    info!(iteration = self.record.iteration, "stopping rule satisfied");
                    return Ok(IterationOutcome::Finished);
                }
                StatusPoint::NextPoint => {
                    algo.update_iteration(self.record.iteration)?;
                    self.advance(StatusPoint::NextPoint, algo)?;
                }
                StatusPoint::Done => self.advance(StatusPoint::Done, algo)?,
            }
        }
        Ok(IterationOutcome::Continue)
    }

    /// Generates (or reuses) the samples and submits the batch unless a job
    /// handle is already persisted.
    pub fn commission(
        &mut self,
        ctx: &IterationContext<'_>,
        algo: &mut dyn NextPointAlgorithm,
        history: &ResultTable,
    ) -> Result<(), CalibError> {
        let iteration = self.record.iteration;
        if self.record.samples.is_none() {
            let samples = algo.get_samples_for_iteration(iteration)?;
            samples.validate()?;
            self.record.samples = Some(samples);
            self.record.algorithm_state = Some(algo.get_state());
            self.persist()?;
        }
        if self.record.job.is_none() {
            let samples = self.samples()?;
            let batch = ctx.executor.submit_batch(&BatchRequest {
                iteration,
                samples,
                replicates: ctx.replicates,
                master_seed: ctx.master_seed,
                config: ctx.simulation,
                suite_id: &self.record.suite_id,
            })?;
            self.record.job = Some(batch.job);
            self.record.simulations = batch.simulations;
            self.persist()?;
        } else {
            info!(iteration, "batch already commissioned; reusing its job");
        }

        let directory = self.directory();
        let plot_ctx = PlotContext {
            calibration: ctx.calibration,
            iteration,
            samples: self.samples()?,
            history,
            directory: &directory,
        };
        for plotter in ctx.plotters {
            if let Err(err) = plotter.after_commission(&plot_ctx) {
                warn!(plotter = plotter.name(), error = %err, "post-commission hook failed");
            }
        }
        self.advance(StatusPoint::Commission, algo)
    }

    /// Polls the batch until every simulation is terminal.
    ///
    /// Any failed or cancelled simulation cancels the rest and halts the
    /// calibration.
    pub fn wait_for_batch(
        &mut self,
        ctx: &IterationContext<'_>,
        algo: &dyn NextPointAlgorithm,
    ) -> Result<(), CalibError> {
        let iteration = self.record.iteration;
        let job = self.record.job.clone().ok_or_else(|| {
            CalibError::Executor(
                ErrorInfo::new("iteration-no-job", "no job handle to wait for")
                    .with_context("iteration", iteration)
                    .with_hint("resume from commission"),
            )
        })?;
        loop {
            let states = ctx.executor.poll_status(&job)?;
            let counts = count_states(&states);
            let failed = counts.get(&SimState::Failed).copied().unwrap_or(0);
            let cancelled = counts.get(&SimState::Cancelled).copied().unwrap_or(0);
            if failed + cancelled > 0 {
                if let Err(err) = ctx.executor.cancel(&job) {
                    warn!(job = %job.job_id, error = %err, "could not cancel remaining simulations");
                }
                return Err(CalibError::SimulationFailure(
                    ErrorInfo::new("simulation-failed", "simulations failed or were cancelled")
                        .with_context("iteration", iteration)
                        .with_context("job", &job.job_id)
                        .with_context("failed", failed)
                        .with_context("cancelled", cancelled)
                        .with_hint("fix the cause, then resume from commission"),
                ));
            }
            let done = states.values().filter(|state| state.is_terminal()).count();
            info!(iteration, done, total = states.len(), "batch progress");
            if done == states.len() {
                break;
            }
            debug!(iteration, interval = ctx.poll.poll_interval, "sleeping before next poll");
            thread::sleep(ctx.poll.poll_duration());
        }
        self.advance(StatusPoint::Running, algo)
    }

    /// Runs (or replays) the analyzers and feeds the results to the algorithm.
    pub fn analyze(
        &mut self,
        ctx: &IterationContext<'_>,
        algo: &mut dyn NextPointAlgorithm,
        history: &mut ResultTable,
    ) -> Result<(), CalibError> {
        let iteration = self.record.iteration;
        let mut outputs: Option<Vec<SimulationOutput>> = None;
        let mut per_analyzer = BTreeMap::new();
        for site in ctx.sites {
            for entry in &site.analyzers {
                let key = site.key(entry.analyzer.as_ref());
                let values = match self.record.analyzer_cache.get(&key) {
                    Some(cache) => entry.analyzer.from_cache(cache)?,
                    None => {
                        if outputs.is_none() {
                            outputs = Some(self.fetch_outputs(ctx)?);
                        }
                        let produced = entry
                            .analyzer
                            .analyze(outputs.as_deref().unwrap_or_default())?;
                        self.record.analyzer_cache.insert(key.clone(), produced.cache);
                        self.persist()?;
                        produced.per_sample
                    }
                };
                per_analyzer.insert(key, values);
            }
        }

        let samples = self.samples()?;
        let rows = combine(samples, ctx.sites, &per_analyzer)?;
        let table = ResultTable {
            param_names: samples.param_names.clone(),
            rows,
        };
        self.record.results_cache = Some(algo.get_results_to_cache(&table)?);
        history.merge(&table.rows);
        self.record.results = table.rows;
        algo.set_results_for_iteration(iteration, history)?;
        write_leaderboard(&ctx.calib_dir.join(LEADERBOARD_FILE), history)?;
        self.advance(StatusPoint::Analyze, algo)
    }

    fn fetch_outputs(&self, ctx: &IterationContext<'_>) -> Result<Vec<SimulationOutput>, CalibError> {
        let job = self.record.job.as_ref().ok_or_else(|| {
            CalibError::Executor(
                ErrorInfo::new("iteration-no-job", "no job handle to read outputs from")
                    .with_context("iteration", self.record.iteration),
            )
        })?;
        ctx.executor.outputs(job)
    }

    /// Invokes the plotters; their failures are logged, not raised.
    pub fn plot(
        &mut self,
        ctx: &IterationContext<'_>,
        algo: &dyn NextPointAlgorithm,
        history: &ResultTable,
    ) -> Result<(), CalibError> {
        let directory = self.directory();
        let plot_ctx = PlotContext {
            calibration: ctx.calibration,
            iteration: self.record.iteration,
            samples: self.samples()?,
            history,
            directory: &directory,
        };
        for plotter in ctx.plotters {
            if let Err(err) = plotter.plot(&plot_ctx) {
                warn!(plotter = plotter.name(), error = %err, "plotter failed");
            }
        }
        self.advance(StatusPoint::Plot, algo)
    }

    /// Rewinds the iteration so that the next `run` performs `target`.
    ///
    /// `previous` is the snapshot of iteration `k - 1` (`None` for iteration
    /// 0, where `algo` must be freshly constructed). It is restored whenever
    /// this iteration's samples are discarded, because they will be generated
    /// again. Otherwise this iteration's own snapshot is restored, which
    /// already includes its sample generation.
    ///
    /// Resuming at the first incomplete transition keeps whatever that
    /// transition had already persisted: a submitted job is reused instead of
    /// submitted twice, and finished analyzers are not run again.
    pub fn resume(
        &mut self,
        target: StatusPoint,
        algo: &mut dyn NextPointAlgorithm,
        previous: Option<NextPointState>,
        history: &mut ResultTable,
    ) -> Result<(), CalibError> {
        let iteration = self.record.iteration;
        let recovering = StatusPoint::pending_after(self.record.status) == Some(target);
        let redo_commission = target < StatusPoint::Commission
            || (target == StatusPoint::Commission && !recovering);
        let redo_analysis =
            target < StatusPoint::Analyze || (target == StatusPoint::Analyze && !recovering);

        let snapshot = if redo_commission {
            previous
        } else {
            self.record.algorithm_state.clone().or(previous)
        };
        match snapshot {
            Some(snapshot) => algo.set_state(snapshot)?,
            None if iteration == 0 && target <= StatusPoint::Commission => {}
            None => {
                return Err(CalibError::Serde(
                    ErrorInfo::new("iteration-no-snapshot", "algorithm snapshot missing")
                        .with_context("iteration", iteration)
                        .with_context("target", target),
                ))
            }
        }

        if target < StatusPoint::Plot {
            history.truncate_after(iteration.checked_sub(1));
        } else {
            history.truncate_after(Some(iteration));
            history.merge(&self.record.results);
        }
        algo.prepare_for_resume(history)?;

        if redo_commission {
            self.record.samples = None;
            self.record.job = None;
            self.record.simulations.clear();
        }
        if redo_analysis {
            self.record.analyzer_cache.clear();
        }
        if target <= StatusPoint::Analyze {
            self.record.results_cache = None;
            self.record.results.clear();
        }
        let status = target.previous();
        self.record.status = status;
        self.record.timeline.retain(|event| Some(event.status) <= status);
        self.record.algorithm_state = Some(algo.get_state());
        self.persist()?;
        info!(iteration, target = %target, recovering, "iteration rewound");
        Ok(())
    }
}
