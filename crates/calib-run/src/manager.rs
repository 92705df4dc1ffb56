//! Calibration lifecycle: start, iterate, resume, kill, clean up, finalize.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use calib_algo::{NextPoint, NextPointAlgorithm, NextPointState, Prior};
use calib_core::errors::{CalibError, ErrorInfo, OrphanResourceWarning};
use calib_core::hash::stable_hash_string;
use calib_core::provenance::{timestamp_now, timestamp_slug};
use calib_core::serde::{to_json_value, to_yaml_string};
use calib_core::{FinalSamples, ResultTable, StatusPoint};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analyzer::Site;
use crate::checkpoint::{
    write_atomic, CalibCheckpoint, IterationRecord, CHECKPOINT_SCHEMA, RESOLVED_CONFIG_FILE,
};
use crate::config::{validate_name, CalibConfig};
use crate::executor::{Executor, JobHandle};
use crate::iteration::{IterationContext, IterationOutcome, IterationState};
use crate::plot::{PlotContext, Plotter, SummaryPlotter};
use crate::summary::{write_final_samples, FINAL_SAMPLES_FILE};

/// What `start` does when the calibration directory already holds a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Continue the existing run.
    Resume,
    /// Move the existing directory aside and start over.
    BackupAndRestart,
    /// Cancel and delete the existing run, then start over.
    CleanAndRestart,
    /// Re-run the plotters over the existing results only.
    Replot,
    /// Leave everything untouched.
    Abort,
}

/// Result of `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// No previous run existed.
    Fresh,
    /// A previous run was discarded; `backup` names where it went, if kept.
    Restarted {
        /// Location of the moved directory.
        backup: Option<PathBuf>,
    },
    /// The previous run should be resumed.
    Resume,
    /// Plotters were replayed over this many iterations.
    Replotted {
        /// Iterations plotted.
        iterations: usize,
    },
    /// Nothing was done.
    Aborted,
}

/// Where a resume should restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeRequest {
    /// Iteration to restart; defaults to the latest.
    pub iteration: Option<usize>,
    /// Transition to re-execute; defaults to the first incomplete one.
    pub status: Option<StatusPoint>,
    /// Accept that the executor location differs from the recorded one.
    pub confirm_location_change: bool,
}

/// Resolved resume point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    /// Iteration to restart.
    pub iteration: usize,
    /// Transition performed first.
    pub status: StatusPoint,
    /// The executor reports a different location than the checkpoint.
    pub location_changed: bool,
    /// The iteration never persisted a job handle.
    pub job_missing: bool,
    /// Final samples were already written.
    pub finalized: bool,
}

/// Outcome of a finished calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeReport {
    /// Iterations present on disk.
    pub iterations: usize,
    /// Samples reported by the algorithm.
    pub final_samples: FinalSamples,
    /// Jobs no iteration references.
    pub orphans: Vec<OrphanResourceWarning>,
}

/// Drives a calibration through its iterations.
pub struct CalibManager {
    config: CalibConfig,
    prior: Prior,
    executor: Arc<dyn Executor>,
    sites: Vec<Site>,
    plotters: Vec<Box<dyn Plotter>>,
    calib_dir: PathBuf,
    checkpoint: Option<CalibCheckpoint>,
    algorithm: Option<NextPoint>,
    pending: Option<IterationState>,
}

impl CalibManager {
    /// Validates the configuration; touches neither disk nor executor.
    pub fn new(config: CalibConfig, executor: Arc<dyn Executor>) -> Result<Self, CalibError> {
        config.validate()?;
        let prior = config.prior()?;
        NextPoint::from_config(
            prior.clone(),
            &config.algorithm,
            config.seed_policy.master_seed,
        )?;
        Ok(Self {
            sites: Site::from_config(&config.sites),
            plotters: vec![Box::new(SummaryPlotter::default())],
            calib_dir: config.calibration_dir(),
            config,
            prior,
            executor,
            checkpoint: None,
            algorithm: None,
            pending: None,
        })
    }

    /// Adds a plotter after the default summary.
    pub fn with_plotter(mut self, plotter: Box<dyn Plotter>) -> Self {
        self.plotters.push(plotter);
        self
    }

    /// Replaces the configured sites, e.g. to use custom analyzers.
    pub fn with_sites(mut self, sites: Vec<Site>) -> Self {
        self.sites = sites;
        self
    }

    /// Directory holding the checkpoints.
    pub fn calibration_dir(&self) -> &Path {
        &self.calib_dir
    }

    /// Calibration configuration.
    pub fn config(&self) -> &CalibConfig {
        &self.config
    }

    fn fresh_algorithm(&self) -> Result<NextPoint, CalibError> {
        NextPoint::from_config(
            self.prior.clone(),
            &self.config.algorithm,
            self.config.seed_policy.master_seed,
        )
    }

    /// Algorithm as it stood at the end of `iteration`.
    fn algorithm_after(&self, iteration: Option<usize>) -> Result<NextPoint, CalibError> {
        let mut algo = self.fresh_algorithm()?;
        if let Some(state) = self.snapshot_of(iteration)? {
            algo.set_state(state)?;
        }
        Ok(algo)
    }

    fn snapshot_of(&self, iteration: Option<usize>) -> Result<Option<NextPointState>, CalibError> {
        match iteration {
            Some(k) => Ok(IterationRecord::load(&self.calib_dir, k)?.algorithm_state),
            None => Ok(None),
        }
    }

    fn checkpoint(&mut self) -> Result<CalibCheckpoint, CalibError> {
        match self.checkpoint.take() {
            Some(checkpoint) => Ok(checkpoint),
            None => CalibCheckpoint::load(&self.calib_dir),
        }
    }

    /// Applies `policy` if a previous run exists, otherwise initializes one.
    pub fn start(&mut self, policy: ConflictPolicy) -> Result<StartOutcome, CalibError> {
        validate_name(&self.config.name)?;
        if !CalibCheckpoint::exists(&self.calib_dir) {
            self.initialize()?;
            return Ok(StartOutcome::Fresh);
        }
        info!(calibration = %self.config.name, ?policy, "existing calibration found");
        match policy {
            ConflictPolicy::Resume => Ok(StartOutcome::Resume),
            ConflictPolicy::BackupAndRestart => {
                let backup = self.backup_path();
                fs::rename(&self.calib_dir, &backup)
                    .map_err(|err| CalibError::io("backup-rename", &self.calib_dir, err))?;
                info!(backup = %backup.display(), "previous calibration moved aside");
                self.initialize()?;
                Ok(StartOutcome::Restarted {
                    backup: Some(backup),
                })
            }
            ConflictPolicy::CleanAndRestart => {
                self.cleanup()?;
                self.initialize()?;
                Ok(StartOutcome::Restarted { backup: None })
            }
            ConflictPolicy::Replot => Ok(StartOutcome::Replotted {
                iterations: self.replot()?,
            }),
            ConflictPolicy::Abort => {
                info!(calibration = %self.config.name, "left existing calibration untouched");
                Ok(StartOutcome::Aborted)
            }
        }
    }

    fn backup_path(&self) -> PathBuf {
        let base = format!("{}_backup_{}", self.config.name, timestamp_slug());
        let mut candidate = self.config.directory.join(&base);
        let mut attempt = 1;
        while candidate.exists() {
            candidate = self.config.directory.join(format!("{base}_{attempt}"));
            attempt += 1;
        }
        candidate
    }

    fn initialize(&mut self) -> Result<(), CalibError> {
        fs::create_dir_all(&self.calib_dir)
            .map_err(|err| CalibError::io("calibration-dir", &self.calib_dir, err))?;
        let suite = self.executor.create_suite(&self.config.name)?;
        let config = to_json_value(&self.config)?;
        let checkpoint = CalibCheckpoint {
            schema: CHECKPOINT_SCHEMA,
            name: self.config.name.clone(),
            location: self.executor.location(),
            suite_ids: vec![suite],
            max_iterations: self.config.max_iterations,
            iteration: 0,
            started_at: timestamp_now(),
            param_names: self.prior.names(),
            sites: self
                .sites
                .iter()
                .map(|site| (site.name.clone(), site.analyzer_names()))
                .collect(),
            results: ResultTable::new(self.prior.names()),
            config_hash: stable_hash_string(&config)?,
            config,
            final_samples: None,
        };
        checkpoint.store(&self.calib_dir)?;
        let resolved = to_yaml_string(&self.config)?;
        write_atomic(&self.calib_dir.join(RESOLVED_CONFIG_FILE), resolved.as_bytes())?;
        info!(
            calibration = %checkpoint.name,
            location = %checkpoint.location,
            hash = %checkpoint.config_hash,
            "calibration initialized"
        );
        self.checkpoint = Some(checkpoint);
        self.algorithm = Some(self.fresh_algorithm()?);
        self.pending = None;
        Ok(())
    }

    /// Starts (or resumes) the calibration and runs it to completion.
    ///
    /// Returns `None` when `policy` replotted or aborted.
    pub fn run(&mut self, policy: ConflictPolicy) -> Result<Option<FinalizeReport>, CalibError> {
        match self.start(policy)? {
            StartOutcome::Fresh | StartOutcome::Restarted { .. } => self.run_iterations(0).map(Some),
            StartOutcome::Resume => self.resume(ResumeRequest::default()).map(Some),
            StartOutcome::Replotted { .. } | StartOutcome::Aborted => Ok(None),
        }
    }

    /// Runs iterations from `from` until the stopping rule fires or the
    /// iteration limit is reached, then finalizes.
    pub fn run_iterations(&mut self, from: usize) -> Result<FinalizeReport, CalibError> {
        let mut checkpoint = self.checkpoint()?;
        let mut algo = match self.algorithm.take() {
            Some(algo) => algo,
            None => self.algorithm_after(from.checked_sub(1))?,
        };
        let mut pending = self.pending.take();
        let suite = checkpoint.current_suite()?.to_string();
        let ctx = IterationContext {
            calibration: &self.config.name,
            calib_dir: &self.calib_dir,
            executor: self.executor.as_ref(),
            sites: &self.sites,
            plotters: &self.plotters,
            poll: &self.config.poll,
            replicates: self.config.replicates,
            master_seed: self.config.seed_policy.master_seed,
            simulation: &self.config.simulation,
        };

        for iteration in from..self.config.max_iterations {
            let mut state = match pending.take() {
                Some(state) if state.iteration() == iteration => state,
                _ => IterationState::new(&self.calib_dir, iteration, &suite),
            };
            checkpoint.iteration = iteration;
            checkpoint.store(&self.calib_dir)?;
            let outcome = state.run(&ctx, &mut algo, &mut checkpoint.results);
            checkpoint.store(&self.calib_dir)?;
            if outcome? == IterationOutcome::Finished {
                info!(iteration, "calibration converged");
                break;
            }
        }

        self.checkpoint = Some(checkpoint);
        self.algorithm = Some(algo);
        self.finalize()
    }

    /// Writes the final samples and reports orphaned jobs.
    pub fn finalize(&mut self) -> Result<FinalizeReport, CalibError> {
        let mut checkpoint = self.checkpoint()?;
        let iterations = IterationRecord::count(&self.calib_dir);
        let algo = match self.algorithm.take() {
            Some(algo) => algo,
            None => self.algorithm_after(iterations.checked_sub(1))?,
        };
        let final_samples = algo.get_final_samples()?;
        checkpoint.final_samples = Some(final_samples.clone());
        checkpoint.store(&self.calib_dir)?;
        write_final_samples(&self.calib_dir.join(FINAL_SAMPLES_FILE), &final_samples)?;
        let orphans = self.collect_orphans(&checkpoint, iterations);
        info!(
            calibration = %checkpoint.name,
            iterations,
            points = final_samples.points.len(),
            orphans = orphans.len(),
            "calibration finalized"
        );
        self.checkpoint = Some(checkpoint);
        self.algorithm = Some(algo);
        Ok(FinalizeReport {
            iterations,
            final_samples,
            orphans,
        })
    }

    fn collect_orphans(
        &self,
        checkpoint: &CalibCheckpoint,
        iterations: usize,
    ) -> Vec<OrphanResourceWarning> {
        let mut referenced = BTreeSet::new();
        for iteration in 0..iterations {
            match IterationRecord::load(&self.calib_dir, iteration) {
                Ok(record) => referenced.extend(record.job.map(|job| job.job_id)),
                Err(err) => warn!(iteration, error = %err, "unreadable iteration skipped"),
            }
        }

        let mut orphans = Vec::new();
        for suite in &checkpoint.suite_ids {
            let jobs = match self.executor.list_jobs(suite) {
                Ok(jobs) => jobs,
                Err(err) => {
                    warn!(suite = %suite, error = %err, "could not list jobs");
                    continue;
                }
            };
            for job in jobs {
                if referenced.contains(&job.job_id) {
                    continue;
                }
                let purged = self.config.purge_orphans
                    && match self.executor.hard_delete(&job) {
                        Ok(()) => true,
                        Err(err) => {
                            warn!(job = %job.job_id, error = %err, "could not purge job");
                            false
                        }
                    };
                let warning = OrphanResourceWarning {
                    suite_id: suite.clone(),
                    job_id: job.job_id,
                    purged,
                };
                warn!("{warning}");
                orphans.push(warning);
            }
        }
        orphans
    }

    /// Resolves a resume request against the checkpoints on disk.
    pub fn plan_resume(&self, request: &ResumeRequest) -> Result<ResumePlan, CalibError> {
        if !CalibCheckpoint::exists(&self.calib_dir) {
            return Err(CalibError::Configuration(
                ErrorInfo::new("resume-no-calibration", "nothing to resume")
                    .with_context("directory", self.calib_dir.display())
                    .with_hint("start the calibration first"),
            ));
        }
        let checkpoint = CalibCheckpoint::load(&self.calib_dir)?;
        let location_changed = checkpoint.location != self.executor.location();
        let finalized = checkpoint.final_samples.is_some();

        let Some(latest) = IterationRecord::count(&self.calib_dir).checked_sub(1) else {
            if let Some(requested) = request.iteration.filter(|k| *k > 0) {
                return Err(CalibError::ResumeConflict(
                    ErrorInfo::new("resume-iteration", "requested iteration does not exist")
                        .with_context("requested", requested)
                        .with_context("latest", "none"),
                ));
            }
            if let Some(requested) = request.status.filter(|s| *s > StatusPoint::IterationStart) {
                return Err(CalibError::ResumeConflict(
                    ErrorInfo::new("resume-status", "requested transition was never reached")
                        .with_context("iteration", 0)
                        .with_context("requested", requested)
                        .with_context("first_incomplete", StatusPoint::IterationStart),
                ));
            }
            return Ok(ResumePlan {
                iteration: 0,
                status: StatusPoint::IterationStart,
                location_changed,
                job_missing: true,
                finalized,
            });
        };

        let iteration = request.iteration.unwrap_or(latest);
        if iteration > latest {
            return Err(CalibError::ResumeConflict(
                ErrorInfo::new("resume-iteration", "requested iteration does not exist")
                    .with_context("requested", iteration)
                    .with_context("latest", latest),
            ));
        }
        let record = IterationRecord::load(&self.calib_dir, iteration)?;
        let first_incomplete = StatusPoint::pending_after(record.status).unwrap_or(StatusPoint::Done);
        let mut status = request.status.unwrap_or(first_incomplete);
        if status > first_incomplete {
            return Err(CalibError::ResumeConflict(
                ErrorInfo::new("resume-status", "requested transition was never reached")
                    .with_context("iteration", iteration)
                    .with_context("requested", status)
                    .with_context("first_incomplete", first_incomplete),
            ));
        }
        let job_missing = record.job.is_none();
        if (job_missing || location_changed) && status > StatusPoint::Commission {
            status = StatusPoint::Commission;
        }
        Ok(ResumePlan {
            iteration,
            status,
            location_changed,
            job_missing,
            finalized,
        })
    }

    /// Rewinds to the requested point and continues the calibration.
    pub fn resume(&mut self, request: ResumeRequest) -> Result<FinalizeReport, CalibError> {
        let plan = self.plan_resume(&request)?;
        let mut checkpoint = CalibCheckpoint::load(&self.calib_dir)?;
        let location = self.executor.location();
        if plan.location_changed && !request.confirm_location_change {
            return Err(CalibError::ExecutionLocationChanged(
                ErrorInfo::new("location-changed", "execution location differs from the checkpoint")
                    .with_context("recorded", &checkpoint.location)
                    .with_context("current", &location)
                    .with_context("resume_at", plan.status)
                    .with_hint("confirm the location change to resume from commission"),
            ));
        }
        if plan.finalized && request.iteration.is_none() && request.status.is_none() {
            info!(calibration = %checkpoint.name, "already finalized; refreshing final outputs");
            self.checkpoint = Some(checkpoint);
            self.algorithm = None;
            return self.finalize();
        }

        if plan.location_changed {
            let suite = self.executor.create_suite(&self.config.name)?;
            info!(from = %checkpoint.location, to = %location, suite = %suite, "switching location");
            checkpoint.location = location;
            checkpoint.suite_ids.push(suite);
        }

        let iteration = plan.iteration;
        for later in (iteration + 1..IterationRecord::count(&self.calib_dir)).rev() {
            let dir = IterationRecord::dir(&self.calib_dir, later);
            fs::remove_dir_all(&dir).map_err(|err| CalibError::io("resume-discard", &dir, err))?;
            debug!(iteration = later, "discarded later iteration");
        }

        let suite = checkpoint.current_suite()?.to_string();
        let mut state = if IterationRecord::exists(&self.calib_dir, iteration) {
            IterationState::load(&self.calib_dir, iteration)?
        } else {
            IterationState::new(&self.calib_dir, iteration, &suite)
        };
        if plan.location_changed {
            state.set_suite(&suite);
        }
        let previous = self.snapshot_of(iteration.checked_sub(1))?;
        let mut algo = self.fresh_algorithm()?;
        state.resume(plan.status, &mut algo, previous, &mut checkpoint.results)?;

        checkpoint.iteration = iteration;
        checkpoint.final_samples = None;
        checkpoint.store(&self.calib_dir)?;
        info!(iteration, status = %plan.status, "resuming calibration");

        self.checkpoint = Some(checkpoint);
        self.algorithm = Some(algo);
        self.pending = Some(state);
        self.run_iterations(iteration)
    }

    /// Cancels the latest iteration's job and waits until it has stopped.
    pub fn kill(&self) -> Result<Option<JobHandle>, CalibError> {
        let Some(latest) = IterationRecord::count(&self.calib_dir).checked_sub(1) else {
            info!(calibration = %self.config.name, "no iteration to kill");
            return Ok(None);
        };
        let Some(job) = IterationRecord::load(&self.calib_dir, latest)?.job else {
            info!(iteration = latest, "iteration has no job to kill");
            return Ok(None);
        };
        self.executor.cancel(&job)?;
        loop {
            let states = self.executor.poll_status(&job)?;
            let live = states.values().filter(|state| !state.is_terminal()).count();
            if live == 0 {
                break;
            }
            debug!(job = %job.job_id, live, "waiting for cancellation");
            thread::sleep(self.config.poll.kill_duration());
        }
        info!(iteration = latest, job = %job.job_id, "job killed");
        Ok(Some(job))
    }

    /// Cancels and deletes every job and suite, then removes the directory.
    pub fn cleanup(&mut self) -> Result<(), CalibError> {
        let suites = if CalibCheckpoint::exists(&self.calib_dir) {
            match CalibCheckpoint::load(&self.calib_dir) {
                Ok(checkpoint) => checkpoint.suite_ids,
                Err(err) => {
                    warn!(error = %err, "unreadable checkpoint; suites are not deleted");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        for iteration in 0.. {
            if !IterationRecord::exists(&self.calib_dir, iteration) {
                break;
            }
            let record = match IterationRecord::load(&self.calib_dir, iteration) {
                Ok(record) => record,
                Err(err) => {
                    warn!(iteration, error = %err, "unreadable iteration; stopping job cleanup");
                    break;
                }
            };
            if let Some(job) = &record.job {
                if let Err(err) = self.executor.cancel(job) {
                    warn!(job = %job.job_id, error = %err, "cancel failed");
                }
                if let Err(err) = self.executor.hard_delete(job) {
                    warn!(job = %job.job_id, error = %err, "delete failed");
                }
            }
        }
        for suite in &suites {
            if let Err(err) = self.executor.delete_suite(suite) {
                warn!(suite = %suite, error = %err, "suite delete failed");
            }
        }
        if self.calib_dir.exists() {
            fs::remove_dir_all(&self.calib_dir)
                .map_err(|err| CalibError::io("cleanup-remove", &self.calib_dir, err))?;
        }
        self.checkpoint = None;
        self.algorithm = None;
        self.pending = None;
        info!(calibration = %self.config.name, "calibration cleaned up");
        Ok(())
    }

    /// Re-runs the plotters over every analyzed iteration; returns how many.
    pub fn replot(&self) -> Result<usize, CalibError> {
        let mut history = ResultTable::new(self.prior.names());
        let mut plotted = 0;
        for iteration in 0..IterationRecord::count(&self.calib_dir) {
            let record = IterationRecord::load(&self.calib_dir, iteration)?;
            if record.status < Some(StatusPoint::Analyze) {
                break;
            }
            history.merge(&record.results);
            let Some(samples) = record.samples.as_ref() else {
                continue;
            };
            let directory = IterationRecord::dir(&self.calib_dir, iteration);
            let ctx = PlotContext {
                calibration: &self.config.name,
                iteration,
                samples,
                history: &history,
                directory: &directory,
            };
            for plotter in &self.plotters {
                if let Err(err) = plotter.plot(&ctx) {
                    warn!(plotter = plotter.name(), error = %err, "plotter failed");
                }
            }
            plotted += 1;
        }
        info!(calibration = %self.config.name, iterations = plotted, "replotted");
        Ok(plotted)
    }
}
