//! Stochastic-perturbation gradient ascent on the total log-likelihood.
//!
//! Each iteration evaluates the current center plus a cloud of points drawn
//! uniformly inside a hypersphere around it. A least-squares hyperplane through
//! the results gives the local gradient, and the center takes a fixed-length
//! step along it. Coordinates are scaled by the prior range so every parameter
//! moves on the same footing.

use calib_core::errors::{CalibError, ErrorInfo};
use calib_core::{FinalSamples, ResultTable, RngHandle, SampleSet};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::OptimToolConfig;
use crate::contract::{NextPointAlgorithm, NextPointState};
use crate::prior::Prior;

/// Bookkeeping for one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimIteration {
    /// Iteration number.
    pub iteration: usize,
    /// Center the perturbations were drawn around.
    pub center: Vec<f64>,
    /// Evaluated points; index 0 is the center itself.
    pub points: Vec<Vec<f64>>,
    /// Total log-likelihood per point once ingested.
    pub totals: Option<Vec<f64>>,
    /// Fitted gradient in range-normalized coordinates.
    pub gradient: Option<Vec<f64>>,
    /// Center of the following iteration.
    pub next_center: Option<Vec<f64>>,
}

/// Complete OptimTool state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OptimToolState {
    /// One entry per generated iteration.
    pub iterations: Vec<OptimIteration>,
}

/// OptimTool next-point algorithm.
#[derive(Debug, Clone)]
pub struct OptimTool {
    prior: Prior,
    config: OptimToolConfig,
    master_seed: u64,
    bounds: Vec<(f64, f64)>,
    state: OptimToolState,
}

impl OptimTool {
    /// Validates the configuration against the prior.
    pub fn new(prior: Prior, config: OptimToolConfig, master_seed: u64) -> Result<Self, CalibError> {
        let dim = prior.dim();
        let bounds = prior.bounds();
        if let Some((index, _)) = bounds
            .iter()
            .enumerate()
            .find(|(_, (lo, hi))| !lo.is_finite() || !hi.is_finite())
        {
            return Err(CalibError::Configuration(
                ErrorInfo::new("optim-unbounded", "optim-tool needs bounded priors")
                    .with_context("param", &prior.names()[index])
                    .with_hint("use uniform or log_uniform priors"),
            ));
        }
        if config.samples_per_iteration <= dim {
            return Err(CalibError::Configuration(
                ErrorInfo::new(
                    "optim-samples-per-iteration",
                    "samples_per_iteration must exceed the number of parameters",
                )
                .with_context("samples_per_iteration", config.samples_per_iteration)
                .with_context("dimensions", dim),
            ));
        }
        if !(config.perturbation_radius > 0.0 && config.step_size > 0.0) || config.n_stagnant == 0
        {
            return Err(CalibError::configuration(
                "optim-step",
                "perturbation_radius, step_size and n_stagnant must be positive",
            ));
        }
        if let Some(center) = &config.initial_center {
            let inside = center.len() == dim
                && center
                    .iter()
                    .zip(&bounds)
                    .all(|(x, (lo, hi))| (*lo..=*hi).contains(x));
            if !inside {
                return Err(CalibError::configuration(
                    "optim-initial-center",
                    "initial_center must lie inside the prior bounds",
                ));
            }
        }
        Ok(Self {
            prior,
            config,
            master_seed,
            bounds,
            state: OptimToolState::default(),
        })
    }

    /// Read-only view of the model state.
    pub fn state(&self) -> &OptimToolState {
        &self.state
    }

    fn ranges(&self) -> Vec<f64> {
        self.bounds.iter().map(|(lo, hi)| hi - lo).collect()
    }

    fn clamp(&self, point: &mut [f64]) {
        for (value, (lo, hi)) in point.iter_mut().zip(&self.bounds) {
            *value = value.clamp(*lo, *hi);
        }
    }

    fn entry(&self, iteration: usize) -> Result<&OptimIteration, CalibError> {
        self.state.iterations.get(iteration).ok_or_else(|| {
            CalibError::Configuration(
                ErrorInfo::new("optim-unknown-iteration", "iteration was never sampled")
                    .with_context("iteration", iteration),
            )
        })
    }

    fn sample_set(&self, entry: &OptimIteration) -> SampleSet {
        SampleSet::from_points(entry.iteration, self.prior.names(), entry.points.clone())
    }

    fn starting_center(&self, iteration: usize) -> Result<Vec<f64>, CalibError> {
        if iteration == 0 {
            return Ok(self.config.initial_center.clone().unwrap_or_else(|| {
                self.bounds.iter().map(|(lo, hi)| 0.5 * (lo + hi)).collect()
            }));
        }
        if self.state.iterations.len() != iteration {
            return Err(CalibError::Configuration(
                ErrorInfo::new("optim-iteration-order", "iterations must be generated in order")
                    .with_context("requested", iteration)
                    .with_context("generated", self.state.iterations.len()),
            ));
        }
        self.state.iterations[iteration - 1]
            .next_center
            .clone()
            .ok_or_else(|| {
                CalibError::Numeric(
                    ErrorInfo::new("optim-no-step", "previous iteration has no next center")
                        .with_context("iteration", iteration - 1),
                )
            })
    }

    /// Best evaluated point and its total.
    fn best(&self) -> Option<(Vec<f64>, f64)> {
        self.state
            .iterations
            .iter()
            .filter_map(|entry| entry.totals.as_ref().map(|totals| (entry, totals)))
            .flat_map(|(entry, totals)| entry.points.iter().zip(totals.iter()))
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(point, total)| (point.clone(), *total))
    }

    fn running_best(&self) -> Vec<f64> {
        let mut best = f64::NEG_INFINITY;
        self.state
            .iterations
            .iter()
            .filter_map(|entry| entry.totals.as_ref())
            .map(|totals| {
                best = totals.iter().copied().fold(best, f64::max);
                best
            })
            .collect()
    }
}

impl NextPointAlgorithm for OptimTool {
    fn get_samples_for_iteration(&mut self, iteration: usize) -> Result<SampleSet, CalibError> {
        if let Some(entry) = self.state.iterations.get(iteration) {
            return Ok(self.sample_set(entry));
        }
        let center = self.starting_center(iteration)?;
        let ranges = self.ranges();
        let dim = center.len();
        let mut rng = RngHandle::for_iteration(self.master_seed, iteration);
        let mut points = vec![center.clone()];
        for _ in 0..self.config.samples_per_iteration {
            let direction: Vec<f64> = (0..dim).map(|_| rng.sample(StandardNormal)).collect();
            let norm = direction.iter().map(|v| v * v).sum::<f64>().sqrt().max(f64::MIN_POSITIVE);
            let radius =
                self.config.perturbation_radius * rng.gen::<f64>().powf(1.0 / dim as f64);
            let mut point: Vec<f64> = center
                .iter()
                .zip(&direction)
                .zip(&ranges)
                .map(|((c, d), range)| c + radius * d / norm * range)
                .collect();
            self.clamp(&mut point);
            points.push(point);
        }
        let entry = OptimIteration {
            iteration,
            center,
            points,
            totals: None,
            gradient: None,
            next_center: None,
        };
        let set = self.sample_set(&entry);
        self.state.iterations.push(entry);
        info!(iteration, samples = set.len(), "optim-tool samples generated");
        Ok(set)
    }

    fn set_results_for_iteration(
        &mut self,
        iteration: usize,
        results: &ResultTable,
    ) -> Result<(), CalibError> {
        let by_sample = results.totals_for(iteration);
        let ranges = self.ranges();
        let entry = self.entry(iteration)?;
        let mut totals = Vec::with_capacity(entry.points.len());
        for index in 0..entry.points.len() {
            let total = *by_sample.get(&index).ok_or_else(|| {
                CalibError::Analyzer(
                    ErrorInfo::new("optim-missing-sample", "no result for a commissioned sample")
                        .with_context("iteration", iteration)
                        .with_context("sample", index),
                )
            })?;
            if !total.is_finite() {
                return Err(CalibError::Analyzer(
                    ErrorInfo::new("optim-invalid-result", "optim-tool needs finite totals")
                        .with_context("iteration", iteration)
                        .with_context("sample", index),
                ));
            }
            totals.push(total);
        }

        let dim = entry.center.len();
        let design = DMatrix::from_fn(entry.points.len(), dim + 1, |row, col| {
            if col == 0 {
                1.0
            } else {
                (entry.points[row][col - 1] - entry.center[col - 1]) / ranges[col - 1]
            }
        });
        let response = DVector::from_column_slice(&totals);
        let coefficients = design
            .svd(true, true)
            .solve(&response, 1e-12)
            .map_err(|msg| CalibError::Numeric(ErrorInfo::new("optim-regression", msg)))?;
        let gradient: Vec<f64> = coefficients.iter().skip(1).copied().collect();

        let entry = &mut self.state.iterations[iteration];
        entry.totals = Some(totals);
        entry.gradient = Some(gradient);
        Ok(())
    }

    fn update_iteration(&mut self, iteration: usize) -> Result<(), CalibError> {
        let ranges = self.ranges();
        let entry = self.entry(iteration)?;
        let gradient = entry.gradient.clone().ok_or_else(|| {
            CalibError::Numeric(
                ErrorInfo::new("optim-no-gradient", "results were not set for the iteration")
                    .with_context("iteration", iteration),
            )
        })?;
        let norm = gradient.iter().map(|g| g * g).sum::<f64>().sqrt();
        let mut next = entry.center.clone();
        if norm > 0.0 {
            for ((value, g), range) in next.iter_mut().zip(&gradient).zip(&ranges) {
                *value += self.config.step_size * g / norm * range;
            }
        }
        self.clamp(&mut next);
        info!(iteration, gradient_norm = norm, "optim-tool step");
        self.state.iterations[iteration].next_center = Some(next);
        Ok(())
    }

    fn end_condition(&self) -> bool {
        let best = self.running_best();
        let window = self.config.n_stagnant;
        if best.len() <= window {
            return false;
        }
        let last = best[best.len() - 1];
        let earlier = best[best.len() - 1 - window];
        last - earlier < self.config.tolerance
    }

    fn get_final_samples(&self) -> Result<FinalSamples, CalibError> {
        let (point, _) = self.best().ok_or_else(|| {
            CalibError::Numeric(ErrorInfo::new(
                "optim-no-results",
                "final samples need at least one analyzed iteration",
            ))
        })?;
        Ok(FinalSamples {
            param_names: self.prior.names(),
            points: vec![point],
            weights: vec![1.0],
        })
    }

    fn get_state(&self) -> NextPointState {
        NextPointState::OptimTool(self.state.clone())
    }

    fn set_state(&mut self, state: NextPointState) -> Result<(), CalibError> {
        match state {
            NextPointState::OptimTool(state) => {
                self.state = state;
                Ok(())
            }
            other => Err(CalibError::Configuration(
                ErrorInfo::new("state-algorithm-mismatch", "snapshot belongs to another algorithm")
                    .with_context("expected", "optim-tool")
                    .with_context("found", other.algorithm()),
            )),
        }
    }

    fn get_param_names(&self) -> Vec<String> {
        self.prior.names()
    }

    fn prepare_for_resume(&mut self, history: &ResultTable) -> Result<(), CalibError> {
        let keep = history.last_iteration();
        for entry in &mut self.state.iterations {
            if keep.map_or(true, |last| entry.iteration > last) {
                entry.totals = None;
                entry.gradient = None;
                entry.next_center = None;
            }
        }
        Ok(())
    }
}
