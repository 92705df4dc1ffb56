//! Incremental Mixture Importance Sampling.
//!
//! The initial stage draws `N0` points from the prior. Every importance stage
//! fits one Gaussian kernel around the currently heaviest sample and draws `B`
//! new points from it, so after `k` kernels the proposal envelope is
//!
//! ```text
//! envelope(x) = (N0 / Nk) prior(x) + (B / Nk) sum_j kernel_j(x),   Nk = N0 + k B
//! ```
//!
//! and each accumulated sample carries the importance weight
//! `prior · likelihood / envelope`. Weights are computed in log space from
//! the log-likelihood totals delivered by the analyzers.

use std::f64::consts::E;

use calib_core::errors::{CalibError, ErrorInfo};
use calib_core::serde::to_json_value;
use calib_core::{derive_substream_seed, FinalSamples, ResultTable, RngHandle, SampleSet};
use rand::distributions::{Distribution as _, WeightedIndex};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::ImisConfig;
use crate::contract::{NextPointAlgorithm, NextPointState};
use crate::linalg::{fit_kernel, log_sum_exp, weighted_covariance, GaussianKernel};
use crate::prior::Prior;

/// Bounded redraws for kernel samples falling outside the prior support.
const MAX_RESAMPLE_ATTEMPTS: usize = 100;

/// Substream reserved for the final weighted resampling.
const FINAL_STREAM: u64 = u64::MAX;

/// One accumulated draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImisSample {
    /// Iteration that drew the sample.
    pub iteration: usize,
    /// Index within that iteration.
    pub sample: usize,
    /// Prior density at the sample.
    pub prior_density: f64,
    /// Ingested log-likelihood; `None` until results arrive.
    pub log_likelihood: Option<f64>,
    /// Parameter vector.
    pub params: Vec<f64>,
}

/// Per-iteration weight diagnostics recorded by `update_iteration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImisDiagnostics {
    /// Iteration the diagnostics describe.
    pub iteration: usize,
    /// Kish effective sample size `1 / sum(w^2)`.
    pub effective_sample_size: f64,
    /// Largest normalized weight.
    pub max_weight: f64,
    /// Expected number of unique draws under weighted resampling.
    pub stopping_statistic: f64,
}

/// Complete IMIS model state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImisState {
    /// Size of the initial stage.
    pub n_initial_samples: usize,
    /// Every sample drawn so far, ordered by iteration then index.
    pub samples: Vec<ImisSample>,
    /// Fitted kernel centers, one per importance stage.
    pub centers: Vec<Vec<f64>>,
    /// Fitted kernel covariances, aligned with `centers`.
    pub covariances: Vec<Vec<Vec<f64>>>,
    /// `kernel_densities[i][j]`: density of kernel `j` at sample `i`.
    pub kernel_densities: Vec<Vec<f64>>,
    /// Diagonal of the prior covariance used by the distance metric.
    pub prior_variance: Vec<f64>,
    /// Normalized importance weights of the samples whose results are known.
    pub weights: Vec<f64>,
    /// Diagnostics, one entry per completed iteration.
    pub diagnostics: Vec<ImisDiagnostics>,
}

/// Expected number of unique draws when resampling `n_resamples` times.
pub fn stopping_statistic(weights: &[f64], n_resamples: usize) -> f64 {
    let r = n_resamples as f64;
    weights.iter().map(|w| 1.0 - (1.0 - w).powf(r)).sum()
}

/// Threshold `(1 - 1/e) R` the statistic must exceed to stop.
pub fn stopping_threshold(n_resamples: usize) -> f64 {
    (1.0 - E.recip()) * n_resamples as f64
}

/// IMIS next-point algorithm.
#[derive(Debug, Clone)]
pub struct Imis {
    prior: Prior,
    config: ImisConfig,
    master_seed: u64,
    state: ImisState,
}

impl Imis {
    /// Validates the configuration against the prior and builds an empty model.
    pub fn new(prior: Prior, config: ImisConfig, master_seed: u64) -> Result<Self, CalibError> {
        let n_initial = config.n_initial_samples();
        let per_iteration = config.samples_per_iteration;
        let dim = prior.dim();
        if n_initial == 0 {
            return Err(CalibError::configuration(
                "imis-initial-samples",
                "initial stage needs at least one sample",
            ));
        }
        if per_iteration > n_initial {
            return Err(CalibError::Configuration(
                ErrorInfo::new(
                    "imis-samples-per-iteration",
                    "samples_per_iteration exceeds the initial sample count",
                )
                .with_context("samples_per_iteration", per_iteration)
                .with_context("n_initial_samples", n_initial),
            ));
        }
        if per_iteration <= dim {
            return Err(CalibError::Configuration(
                ErrorInfo::new(
                    "imis-samples-per-iteration",
                    "samples_per_iteration must exceed the number of parameters",
                )
                .with_context("samples_per_iteration", per_iteration)
                .with_context("dimensions", dim)
                .with_hint("kernel covariances are under-determined otherwise"),
            ));
        }
        if config.n_resamples == 0 {
            return Err(CalibError::configuration(
                "imis-resamples",
                "n_resamples must be positive",
            ));
        }
        if let Some(points) = &config.initial_points {
            if let Some(bad) = points.iter().position(|point| point.len() != dim) {
                return Err(CalibError::Configuration(
                    ErrorInfo::new("imis-initial-points", "initial point has the wrong dimension")
                        .with_context("index", bad)
                        .with_context("dimensions", dim),
                ));
            }
        }
        Ok(Self {
            prior,
            config,
            master_seed,
            state: ImisState {
                n_initial_samples: n_initial,
                ..ImisState::default()
            },
        })
    }

    /// Read-only view of the model state.
    pub fn state(&self) -> &ImisState {
        &self.state
    }

    /// Current normalized importance weights.
    pub fn weights(&self) -> &[f64] {
        &self.state.weights
    }

    fn sample_set(&self, iteration: usize) -> SampleSet {
        SampleSet {
            iteration,
            param_names: self.prior.names(),
            samples: self
                .state
                .samples
                .iter()
                .filter(|row| row.iteration == iteration)
                .map(|row| (row.sample, row.params.clone()))
                .collect(),
        }
    }

    fn last_generated(&self) -> Option<usize> {
        self.state.samples.last().map(|row| row.iteration)
    }

    /// Normalized weights of every sample drawn up to and including `through`,
    /// using the envelope that existed once that iteration's samples were drawn.
    fn compute_weights(&self, through: usize) -> Result<Vec<f64>, CalibError> {
        let rows: Vec<&ImisSample> = self
            .state
            .samples
            .iter()
            .take_while(|row| row.iteration <= through)
            .collect();
        let n_kernels = through.min(self.state.centers.len());
        let n_total = rows.len() as f64;
        let initial_share = self.state.n_initial_samples as f64 / n_total;
        let kernel_share = self.config.samples_per_iteration as f64 / n_total;

        let mut log_weights = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            let log_likelihood = row.log_likelihood.ok_or_else(|| {
                CalibError::Numeric(
                    ErrorInfo::new("imis-missing-result", "sample has no ingested result")
                        .with_context("iteration", row.iteration)
                        .with_context("sample", row.sample),
                )
            })?;
            if row.prior_density <= 0.0 {
                log_weights.push(f64::NEG_INFINITY);
                continue;
            }
            let mixture: f64 = self.state.kernel_densities[index][..n_kernels].iter().sum();
            let envelope = initial_share * row.prior_density + kernel_share * mixture;
            log_weights.push(row.prior_density.ln() + log_likelihood - envelope.ln());
        }

        let normalizer = log_sum_exp(&log_weights);
        if !normalizer.is_finite() {
            return Err(CalibError::Numeric(
                ErrorInfo::new("imis-degenerate-weights", "every importance weight vanished")
                    .with_context("iteration", through)
                    .with_hint("check that the analyzers return finite log-likelihoods"),
            ));
        }
        Ok(log_weights
            .into_iter()
            .map(|value| (value - normalizer).exp())
            .collect())
    }

    fn initial_stage(&mut self) -> Result<(), CalibError> {
        let points = match &self.config.initial_points {
            Some(points) => points.clone(),
            None => {
                let mut rng = RngHandle::for_iteration(self.master_seed, 0);
                (0..self.config.initial_samples)
                    .map(|_| self.prior.sample(&mut rng))
                    .collect()
            }
        };

        let fallback = self.prior.variances();
        let n = points.len() as f64;
        self.state.prior_variance = (0..self.prior.dim())
            .map(|d| {
                let mean = points.iter().map(|p| p[d]).sum::<f64>() / n;
                let var = points.iter().map(|p| (p[d] - mean).powi(2)).sum::<f64>() / n;
                if var.is_finite() && var > 0.0 {
                    var
                } else {
                    fallback[d]
                }
            })
            .collect();

        for (index, params) in points.into_iter().enumerate() {
            self.state.samples.push(ImisSample {
                iteration: 0,
                sample: index,
                prior_density: self.prior.density(&params),
                log_likelihood: None,
                params,
            });
            self.state.kernel_densities.push(Vec::new());
        }
        Ok(())
    }

    fn importance_stage(&mut self, iteration: usize) -> Result<(), CalibError> {
        let previous = iteration - 1;
        if self.last_generated() != Some(previous) {
            return Err(CalibError::Configuration(
                ErrorInfo::new("imis-iteration-order", "iterations must be generated in order")
                    .with_context("requested", iteration)
                    .with_context(
                        "last_generated",
                        self.last_generated()
                            .map_or_else(|| "none".to_string(), |last| last.to_string()),
                    ),
            ));
        }
        let weights = if self.state.weights.len() == self.state.samples.len() {
            self.state.weights.clone()
        } else {
            self.compute_weights(previous)?
        };

        let per_iteration = self.config.samples_per_iteration;
        let n_total = self.state.samples.len();
        let center_index = weights
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(index, _)| index)
            .unwrap_or(0);
        let center = self.state.samples[center_index].params.clone();

        // Coordinate-wise variance-normalized distance, not full Mahalanobis.
        let mut by_distance: Vec<(usize, f64)> = self
            .state
            .samples
            .iter()
            .enumerate()
            .map(|(index, row)| {
                let distance = row
                    .params
                    .iter()
                    .zip(&center)
                    .zip(&self.state.prior_variance)
                    .map(|((x, c), var)| (x - c).powi(2) / var)
                    .sum::<f64>();
                (index, distance)
            })
            .collect();
        by_distance.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        let nearest: Vec<usize> = by_distance
            .iter()
            .take(per_iteration)
            .map(|(index, _)| *index)
            .collect();

        let floor = 1.0 / n_total as f64;
        let mut local_weights: Vec<f64> = nearest.iter().map(|&i| weights[i] + floor).collect();
        let local_sum: f64 = local_weights.iter().sum();
        for weight in &mut local_weights {
            *weight /= local_sum;
        }
        let points: Vec<&[f64]> = nearest
            .iter()
            .map(|&i| self.state.samples[i].params.as_slice())
            .collect();
        let covariance = weighted_covariance(&points, &local_weights, &center);
        let kernel = fit_kernel(center, covariance)?;
        let factored = kernel.factor()?;

        let mut rng = RngHandle::for_iteration(self.master_seed, iteration);
        let mut draws: Vec<Vec<f64>> = (0..per_iteration)
            .map(|_| factored.sample(&mut rng))
            .collect();
        for _ in 0..MAX_RESAMPLE_ATTEMPTS {
            let invalid: Vec<usize> = draws
                .iter()
                .enumerate()
                .filter(|(_, draw)| self.prior.density(draw) <= 0.0)
                .map(|(index, _)| index)
                .collect();
            if invalid.is_empty() {
                break;
            }
            debug!(iteration, invalid = invalid.len(), "redrawing samples outside prior support");
            for index in invalid {
                draws[index] = factored.sample(&mut rng);
            }
        }
        let still_invalid = draws
            .iter()
            .filter(|draw| self.prior.density(draw) <= 0.0)
            .count();
        if still_invalid > 0 {
            warn!(
                iteration,
                still_invalid, "samples left outside prior support after bounded redraws"
            );
        }

        let old_kernels: Vec<GaussianKernel> = self
            .state
            .centers
            .iter()
            .zip(&self.state.covariances)
            .map(|(center, covariance)| GaussianKernel {
                center: center.clone(),
                covariance: covariance.clone(),
            })
            .collect();
        let mut new_rows = vec![Vec::with_capacity(old_kernels.len() + 1); draws.len()];
        for old in &old_kernels {
            for (row, density) in new_rows.iter_mut().zip(old.densities(&draws)?) {
                row.push(density);
            }
        }

        for (index, (params, densities)) in draws.into_iter().zip(new_rows).enumerate() {
            self.state.samples.push(ImisSample {
                iteration,
                sample: index,
                prior_density: self.prior.density(&params),
                log_likelihood: None,
                params,
            });
            self.state.kernel_densities.push(densities);
        }

        let all_points: Vec<Vec<f64>> = self
            .state
            .samples
            .iter()
            .map(|row| row.params.clone())
            .collect();
        let column = kernel.densities(&all_points)?;
        for (row, density) in self.state.kernel_densities.iter_mut().zip(column) {
            row.push(density);
        }
        self.state.centers.push(kernel.center);
        self.state.covariances.push(kernel.covariance);
        Ok(())
    }
}

impl NextPointAlgorithm for Imis {
    fn get_samples_for_iteration(&mut self, iteration: usize) -> Result<SampleSet, CalibError> {
        if self.state.samples.iter().any(|row| row.iteration == iteration) {
            return Ok(self.sample_set(iteration));
        }
        if iteration == 0 {
            self.initial_stage()?;
        } else {
            self.importance_stage(iteration)?;
        }
        let set = self.sample_set(iteration);
        info!(
            iteration,
            samples = set.len(),
            kernels = self.state.centers.len(),
            "imis samples generated"
        );
        Ok(set)
    }

    fn set_results_for_iteration(
        &mut self,
        iteration: usize,
        results: &ResultTable,
    ) -> Result<(), CalibError> {
        let totals = results.totals_for(iteration);
        if !self.state.samples.iter().any(|row| row.iteration == iteration) {
            return Err(CalibError::Configuration(
                ErrorInfo::new("imis-unknown-iteration", "results for an iteration never sampled")
                    .with_context("iteration", iteration),
            ));
        }
        for row in self
            .state
            .samples
            .iter_mut()
            .filter(|row| row.iteration == iteration)
        {
            let total = *totals.get(&row.sample).ok_or_else(|| {
                CalibError::Analyzer(
                    ErrorInfo::new("imis-missing-sample", "no result for a commissioned sample")
                        .with_context("iteration", iteration)
                        .with_context("sample", row.sample),
                )
            })?;
            if total.is_nan() || total == f64::INFINITY {
                return Err(CalibError::Analyzer(
                    ErrorInfo::new("imis-invalid-result", "log-likelihood is not a number")
                        .with_context("iteration", iteration)
                        .with_context("sample", row.sample),
                ));
            }
            row.log_likelihood = Some(total.max(f64::MIN));
        }
        self.state.weights = self.compute_weights(iteration)?;
        Ok(())
    }

    fn update_iteration(&mut self, iteration: usize) -> Result<(), CalibError> {
        let weights = &self.state.weights;
        let diagnostics = ImisDiagnostics {
            iteration,
            effective_sample_size: 1.0 / weights.iter().map(|w| w * w).sum::<f64>(),
            max_weight: weights.iter().copied().fold(0.0, f64::max),
            stopping_statistic: stopping_statistic(weights, self.config.n_resamples),
        };
        info!(
            iteration,
            ess = diagnostics.effective_sample_size,
            max_weight = diagnostics.max_weight,
            statistic = diagnostics.stopping_statistic,
            threshold = stopping_threshold(self.config.n_resamples),
            "imis iteration summary"
        );
        self.state
            .diagnostics
            .retain(|entry| entry.iteration != iteration);
        self.state.diagnostics.push(diagnostics);
        self.state.diagnostics.sort_by_key(|entry| entry.iteration);
        Ok(())
    }

    fn end_condition(&self) -> bool {
        !self.state.weights.is_empty()
            && stopping_statistic(&self.state.weights, self.config.n_resamples)
                > stopping_threshold(self.config.n_resamples)
    }

    fn get_final_samples(&self) -> Result<FinalSamples, CalibError> {
        let weights = &self.state.weights;
        let sampler = WeightedIndex::new(weights).map_err(|err| {
            CalibError::Numeric(
                ErrorInfo::new("imis-final-weights", err.to_string())
                    .with_hint("final samples need at least one analyzed iteration"),
            )
        })?;
        let mut rng = RngHandle::from_seed(derive_substream_seed(self.master_seed, FINAL_STREAM));
        let mut points = Vec::with_capacity(self.config.n_resamples);
        let mut drawn_weights = Vec::with_capacity(self.config.n_resamples);
        for _ in 0..self.config.n_resamples {
            let index = sampler.sample(&mut rng);
            points.push(self.state.samples[index].params.clone());
            drawn_weights.push(weights[index]);
        }
        Ok(FinalSamples {
            param_names: self.prior.names(),
            points,
            weights: drawn_weights,
        })
    }

    fn get_state(&self) -> NextPointState {
        NextPointState::Imis(self.state.clone())
    }

    fn set_state(&mut self, state: NextPointState) -> Result<(), CalibError> {
        match state {
            NextPointState::Imis(state) => {
                if state.n_initial_samples != self.config.n_initial_samples() {
                    return Err(CalibError::Configuration(
                        ErrorInfo::new("imis-state-mismatch", "snapshot was produced with another initial stage size")
                            .with_context("snapshot", state.n_initial_samples)
                            .with_context("configured", self.config.n_initial_samples()),
                    ));
                }
                if state.samples.len() != state.kernel_densities.len() {
                    return Err(CalibError::Serde(ErrorInfo::new(
                        "imis-state-corrupt",
                        "kernel density rows do not match the sample table",
                    )));
                }
                self.state = state;
                Ok(())
            }
            other => Err(CalibError::Configuration(
                ErrorInfo::new("state-algorithm-mismatch", "snapshot belongs to another algorithm")
                    .with_context("expected", "imis")
                    .with_context("found", other.algorithm()),
            )),
        }
    }

    fn get_param_names(&self) -> Vec<String> {
        self.prior.names()
    }

    fn get_results_to_cache(&self, results: &ResultTable) -> Result<Value, CalibError> {
        let totals: std::collections::BTreeMap<usize, f64> = results
            .rows
            .iter()
            .map(|row| (row.sample, row.total))
            .collect();
        Ok(json!({
            "iteration": results.last_iteration(),
            "total": to_json_value(&totals)?,
        }))
    }

    fn prepare_for_resume(&mut self, history: &ResultTable) -> Result<(), CalibError> {
        let keep = history.last_iteration();
        for row in &mut self.state.samples {
            if keep.map_or(true, |last| row.iteration > last) {
                row.log_likelihood = None;
            }
        }
        self.state
            .diagnostics
            .retain(|entry| keep.map_or(false, |last| entry.iteration <= last));
        self.state.weights = match keep {
            Some(last) if self.last_generated().map_or(false, |generated| generated >= last) => {
                self.compute_weights(last)?
            }
            _ => Vec::new(),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prior::{Distribution, ParamSpec};

    fn prior_1d() -> Prior {
        Prior::new(vec![ParamSpec {
            name: "x".into(),
            distribution: Distribution::Normal { mean: 0.0, sd: 5.0 },
        }])
        .unwrap()
    }

    #[test]
    fn stopping_rule_arithmetic() {
        let statistic = stopping_statistic(&[0.5, 0.5], 10);
        assert!((statistic - 2.0 * (1.0 - 0.5f64.powi(10))).abs() < 1e-12);
        assert!((stopping_threshold(10) - 6.321205588).abs() < 1e-6);
        assert!(statistic < stopping_threshold(10));
    }

    #[test]
    fn initial_weights_follow_likelihood() {
        let config = ImisConfig {
            initial_samples: 20,
            samples_per_iteration: 5,
            n_resamples: 10,
            initial_points: None,
        };
        let mut imis = Imis::new(prior_1d(), config, 9).unwrap();
        let set = imis.get_samples_for_iteration(0).unwrap();
        let mut table = ResultTable::new(vec!["x".into()]);
        let rows: Vec<_> = set
            .samples
            .iter()
            .map(|(&sample, params)| calib_core::ResultRow {
                iteration: 0,
                sample,
                params: params.clone(),
                analyzers: Default::default(),
                total: -0.5 * (params[0] - 2.0).powi(2),
            })
            .collect();
        table.merge(&rows);
        imis.set_results_for_iteration(0, &table).unwrap();
        let weights = imis.weights();
        assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        let best = rows
            .iter()
            .max_by(|a, b| a.total.total_cmp(&b.total))
            .unwrap()
            .sample;
        let heaviest = weights
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap()
            .0;
        assert_eq!(best, heaviest);
    }

    #[test]
    fn out_of_order_iteration_is_rejected() {
        let mut imis = Imis::new(prior_1d(), ImisConfig::default(), 1).unwrap();
        assert!(imis.get_samples_for_iteration(2).is_err());
    }
}
