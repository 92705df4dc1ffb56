//! In-process executor.
//!
//! Layout under the executor root:
//!
//! ```text
//! <root>/<suite>/suite.json
//! <root>/<suite>/<job>/job.json
//! <root>/<suite>/<job>/sims/<sim>.json
//! <root>/<suite>/<job>/CANCEL
//! ```
//!
//! Each batch runs on one background thread that fans simulations out over a
//! rayon pool. Simulation records are rewritten atomically on every state
//! change, so pollers never observe a torn document.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use calib_core::errors::{CalibError, ErrorInfo};
use calib_core::hash::short_id;
use calib_core::provenance::timestamp_now;
use calib_core::simulation_seed;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::checkpoint::{load_json, store_json};
use crate::executor::{
    BatchRequest, Executor, JobHandle, SimState, SimulationHandle, SimulationOutput,
    SubmittedBatch,
};

const SUITE_FILE: &str = "suite.json";
const JOB_FILE: &str = "job.json";
const SIMS_DIR: &str = "sims";
const CANCEL_MARKER: &str = "CANCEL";

/// Arguments of one model evaluation.
#[derive(Debug, Clone, Copy)]
pub struct ModelInput<'a> {
    /// Parameter vector.
    pub params: &'a [f64],
    /// Parameter names, aligned with `params`.
    pub param_names: &'a [String],
    /// Seed of this simulation.
    pub seed: u64,
    /// Simulation configuration block.
    pub config: &'a Value,
}

/// Simulator run by the local executor; an `Err` marks the simulation failed.
pub type ModelFn = Arc<dyn Fn(&ModelInput<'_>) -> Result<Value, String> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SuiteRecord {
    suite_id: String,
    name: String,
    created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
    job: JobHandle,
    iteration: usize,
    param_names: Vec<String>,
    samples: BTreeMap<usize, Vec<f64>>,
    simulations: Vec<SimulationHandle>,
    config: Value,
    submitted_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimRecord {
    handle: SimulationHandle,
    state: SimState,
    output: Option<Value>,
    error: Option<String>,
    updated_at: String,
}

impl SimRecord {
    fn new(handle: SimulationHandle) -> Self {
        Self {
            handle,
            state: SimState::Pending,
            output: None,
            error: None,
            updated_at: timestamp_now(),
        }
    }

    fn with_state(mut self, state: SimState) -> Self {
        self.state = state;
        self.updated_at = timestamp_now();
        self
    }
}

fn executor_error(code: &str, message: impl Into<String>) -> CalibError {
    CalibError::Executor(ErrorInfo::new(code, message))
}

/// Executor running a model function inside the current process.
pub struct LocalExecutor {
    root: PathBuf,
    location: String,
    workers: usize,
    model: ModelFn,
    nonce: AtomicU64,
    live: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl LocalExecutor {
    /// Executor storing suites under `root`.
    pub fn new(root: impl Into<PathBuf>, model: ModelFn) -> Self {
        Self {
            root: root.into(),
            location: "local".to_string(),
            workers: 1,
            model,
            nonce: AtomicU64::new(0),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the size of the per-batch thread pool.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Overrides the location label reported to the manager.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    /// Root directory of the executor.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn suite_dir(&self, suite_id: &str) -> PathBuf {
        self.root.join(suite_id)
    }

    fn job_dir(&self, job: &JobHandle) -> PathBuf {
        self.suite_dir(&job.suite_id).join(&job.job_id)
    }

    fn fresh_id(
        &self,
        prefix: &str,
        seed: &Value,
        taken: impl Fn(&str) -> bool,
    ) -> Result<String, CalibError> {
        loop {
            let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
            let id = short_id(
                prefix,
                &json!({ "seed": seed, "at": timestamp_now(), "nonce": nonce }),
            )?;
            if !taken(&id) {
                return Ok(id);
            }
        }
    }

    /// Finished workers are reaped here so the table only holds running jobs.
    fn is_live(&self, job_id: &str) -> Result<bool, CalibError> {
        let mut live = self
            .live
            .lock()
            .map_err(|_| executor_error("local-lock", "job table lock poisoned"))?;
        let finished = match live.get(job_id) {
            None => return Ok(false),
            Some(handle) => handle.is_finished(),
        };
        if !finished {
            return Ok(true);
        }
        if let Some(worker) = live.remove(job_id) {
            if worker.join().is_err() {
                warn!(job = %job_id, "local worker panicked");
            }
        }
        debug!(job = %job_id, "local worker reaped");
        Ok(false)
    }

    #[cfg(test)]
    fn tracked_workers(&self) -> usize {
        self.live.lock().map_or(0, |live| live.len())
    }

    fn load_job(&self, job: &JobHandle) -> Result<JobRecord, CalibError> {
        let path = self.job_dir(job).join(JOB_FILE);
        if !path.is_file() {
            return Err(CalibError::Executor(
                ErrorInfo::new("local-unknown-job", "job does not exist")
                    .with_context("job", &job.job_id)
                    .with_context("suite", &job.suite_id),
            ));
        }
        load_json(&path)
    }

    fn sim_records(&self, job: &JobHandle) -> Result<Vec<SimRecord>, CalibError> {
        let record = self.load_job(job)?;
        let sims_dir = self.job_dir(job).join(SIMS_DIR);
        record
            .simulations
            .iter()
            .map(|handle| load_json(&sims_dir.join(format!("{}.json", handle.sim_id))))
            .collect()
    }
}

fn run_batch(
    job_dir: PathBuf,
    tasks: Vec<(SimulationHandle, Vec<f64>)>,
    param_names: Vec<String>,
    config: Value,
    model: ModelFn,
    workers: usize,
) {
    let sims_dir = job_dir.join(SIMS_DIR);
    let pool = match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
        Ok(pool) => pool,
        Err(err) => {
            warn!(error = %err, "local thread pool unavailable; failing batch");
            for (handle, _) in tasks {
                let mut record = SimRecord::new(handle).with_state(SimState::Failed);
                record.error = Some(err.to_string());
                let path = sims_dir.join(format!("{}.json", record.handle.sim_id));
                if let Err(err) = store_json(&path, &record) {
                    warn!(error = %err, "could not record simulation failure");
                }
            }
            return;
        }
    };
    pool.install(|| {
        tasks.par_iter().for_each(|(handle, params)| {
            let input = ModelInput {
                params,
                param_names: &param_names,
                seed: handle.seed,
                config: &config,
            };
            if let Err(err) = run_simulation(&job_dir, &sims_dir, handle, &input, &model) {
                warn!(sim = %handle.sim_id, error = %err, "simulation record not written");
            }
        })
    });
}

fn run_simulation(
    job_dir: &Path,
    sims_dir: &Path,
    handle: &SimulationHandle,
    input: &ModelInput<'_>,
    model: &ModelFn,
) -> Result<(), CalibError> {
    let path = sims_dir.join(format!("{}.json", handle.sim_id));
    let record = SimRecord::new(handle.clone());
    if job_dir.join(CANCEL_MARKER).exists() {
        return store_json(&path, &record.with_state(SimState::Cancelled));
    }
    store_json(&path, &record.clone().with_state(SimState::Running))?;
    let finished = match model(input) {
        Ok(output) => {
            let mut record = record.with_state(SimState::Succeeded);
            record.output = Some(output);
            record
        }
        Err(message) => {
            debug!(sim = %handle.sim_id, %message, "simulation failed");
            let mut record = record.with_state(SimState::Failed);
            record.error = Some(message);
            record
        }
    };
    store_json(&path, &finished)
}

impl Executor for LocalExecutor {
    fn location(&self) -> String {
        self.location.clone()
    }

    fn create_suite(&self, name: &str) -> Result<String, CalibError> {
        let suite_id = self.fresh_id("suite", &json!(name), |id| self.suite_dir(id).exists())?;
        let record = SuiteRecord {
            suite_id: suite_id.clone(),
            name: name.to_string(),
            created_at: timestamp_now(),
        };
        store_json(&self.suite_dir(&suite_id).join(SUITE_FILE), &record)?;
        info!(suite = %suite_id, name, "local suite created");
        Ok(suite_id)
    }

    fn submit_batch(&self, request: &BatchRequest<'_>) -> Result<SubmittedBatch, CalibError> {
        let suite_dir = self.suite_dir(request.suite_id);
        if !suite_dir.join(SUITE_FILE).is_file() {
            return Err(CalibError::Executor(
                ErrorInfo::new("local-unknown-suite", "suite does not exist")
                    .with_context("suite", request.suite_id),
            ));
        }
        let job_id = self.fresh_id(
            "job",
            &json!({ "suite": request.suite_id, "iteration": request.iteration }),
            |id| suite_dir.join(id).exists(),
        )?;
        let job = JobHandle {
            job_id: job_id.clone(),
            suite_id: request.suite_id.to_string(),
            location: self.location.clone(),
        };

        let mut simulations = Vec::with_capacity(request.samples.len() * request.replicates);
        let mut tasks = Vec::with_capacity(simulations.capacity());
        for (&sample, params) in &request.samples.samples {
            for replicate in 0..request.replicates {
                let handle = SimulationHandle {
                    sim_id: format!("s{sample:05}_r{replicate:03}"),
                    sample,
                    replicate,
                    seed: simulation_seed(request.master_seed, request.iteration, sample, replicate),
                };
                tasks.push((handle.clone(), params.clone()));
                simulations.push(handle);
            }
        }

        let job_dir = self.job_dir(&job);
        let sims_dir = job_dir.join(SIMS_DIR);
        for handle in &simulations {
            store_json(
                &sims_dir.join(format!("{}.json", handle.sim_id)),
                &SimRecord::new(handle.clone()),
            )?;
        }
        let record = JobRecord {
            job: job.clone(),
            iteration: request.iteration,
            param_names: request.samples.param_names.clone(),
            samples: request.samples.samples.clone(),
            simulations: simulations.clone(),
            config: request.config.clone(),
            submitted_at: timestamp_now(),
        };
        store_json(&job_dir.join(JOB_FILE), &record)?;

        let param_names = record.param_names;
        let config = record.config;
        let model = Arc::clone(&self.model);
        let workers = self.workers;
        let worker_dir = job_dir.clone();
        let worker = thread::Builder::new()
            .name(format!("local-{job_id}"))
            .spawn(move || run_batch(worker_dir, tasks, param_names, config, model, workers))
            .map_err(|err| CalibError::io("local-spawn", &job_dir, err))?;
        self.live
            .lock()
            .map_err(|_| executor_error("local-lock", "job table lock poisoned"))?
            .insert(job_id.clone(), worker);
        info!(
            job = %job_id,
            suite = request.suite_id,
            iteration = request.iteration,
            simulations = simulations.len(),
            "local batch submitted"
        );
        Ok(SubmittedBatch { job, simulations })
    }

    fn poll_status(&self, job: &JobHandle) -> Result<BTreeMap<String, SimState>, CalibError> {
        // Liveness first: a worker finishing between the two reads leaves final records.
        let live = self.is_live(&job.job_id)?;
        let records = self.sim_records(job)?;
        Ok(records
            .into_iter()
            .map(|record| {
                let state = if !live && !record.state.is_terminal() {
                    SimState::Cancelled
                } else {
                    record.state
                };
                (record.handle.sim_id, state)
            })
            .collect())
    }

    fn cancel(&self, job: &JobHandle) -> Result<(), CalibError> {
        let job_dir = self.job_dir(job);
        self.load_job(job)?;
        fs::write(job_dir.join(CANCEL_MARKER), timestamp_now())
            .map_err(|err| CalibError::io("local-cancel", &job_dir, err))?;
        if !self.is_live(&job.job_id)? {
            let sims_dir = job_dir.join(SIMS_DIR);
            for record in self.sim_records(job)? {
                if !record.state.is_terminal() {
                    let path = sims_dir.join(format!("{}.json", record.handle.sim_id));
                    store_json(&path, &record.with_state(SimState::Cancelled))?;
                }
            }
        }
        info!(job = %job.job_id, "local job cancellation requested");
        Ok(())
    }

    fn hard_delete(&self, job: &JobHandle) -> Result<(), CalibError> {
        let job_dir = self.job_dir(job);
        if !job_dir.exists() {
            return Ok(());
        }
        self.cancel(job)?;
        let worker = self
            .live
            .lock()
            .map_err(|_| executor_error("local-lock", "job table lock poisoned"))?
            .remove(&job.job_id);
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!(job = %job.job_id, "local worker panicked");
            }
        }
        fs::remove_dir_all(&job_dir).map_err(|err| CalibError::io("local-delete", &job_dir, err))?;
        info!(job = %job.job_id, "local job deleted");
        Ok(())
    }

    fn delete_suite(&self, suite_id: &str) -> Result<(), CalibError> {
        for job in self.list_jobs(suite_id)? {
            self.hard_delete(&job)?;
        }
        let suite_dir = self.suite_dir(suite_id);
        if suite_dir.exists() {
            fs::remove_dir_all(&suite_dir)
                .map_err(|err| CalibError::io("local-delete", &suite_dir, err))?;
        }
        info!(suite = suite_id, "local suite deleted");
        Ok(())
    }

    fn list_jobs(&self, suite_id: &str) -> Result<Vec<JobHandle>, CalibError> {
        let suite_dir = self.suite_dir(suite_id);
        if !suite_dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries =
            fs::read_dir(&suite_dir).map_err(|err| CalibError::io("local-list", &suite_dir, err))?;
        let mut jobs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CalibError::io("local-list", &suite_dir, err))?;
            let path = entry.path().join(JOB_FILE);
            if path.is_file() {
                let record: JobRecord = load_json(&path)?;
                jobs.push(record.job);
            }
        }
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(jobs)
    }

    fn outputs(&self, job: &JobHandle) -> Result<Vec<SimulationOutput>, CalibError> {
        Ok(self
            .sim_records(job)?
            .into_iter()
            .filter(|record| record.state == SimState::Succeeded)
            .filter_map(|record| {
                record.output.map(|values| SimulationOutput {
                    sample: record.handle.sample,
                    replicate: record.handle.replicate,
                    values,
                })
            })
            .collect())
    }
}
