//! Sample and result tables exchanged between the state machine and algorithms.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{CalibError, ErrorInfo};

/// Parameter vectors requested for one iteration, keyed by sample index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSet {
    /// Iteration the samples belong to.
    pub iteration: usize,
    /// Ordered parameter names labelling each vector component.
    pub param_names: Vec<String>,
    /// Parameter vectors keyed by their sample index.
    pub samples: BTreeMap<usize, Vec<f64>>,
}

impl SampleSet {
    /// Builds a sample set numbering the provided vectors from zero.
    pub fn from_points(iteration: usize, param_names: Vec<String>, points: Vec<Vec<f64>>) -> Self {
        Self {
            iteration,
            param_names,
            samples: points.into_iter().enumerate().collect(),
        }
    }

    /// Number of samples in the set.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true when the set contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Parameter vectors in sample-index order.
    pub fn points(&self) -> Vec<Vec<f64>> {
        self.samples.values().cloned().collect()
    }

    /// Verifies every vector matches the parameter-name dimension.
    pub fn validate(&self) -> Result<(), CalibError> {
        let dim = self.param_names.len();
        for (index, point) in &self.samples {
            if point.len() != dim {
                return Err(CalibError::Configuration(
                    ErrorInfo::new("sample-dimension", "sample vector does not match parameter names")
                        .with_context("iteration", self.iteration)
                        .with_context("sample", index)
                        .with_context("expected", dim)
                        .with_context("found", point.len()),
                ));
            }
        }
        Ok(())
    }
}

/// Outcome of one sample after every analyzer ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    /// Iteration the sample was drawn in.
    pub iteration: usize,
    /// Sample index within the iteration.
    pub sample: usize,
    /// Parameter vector evaluated by the simulator.
    pub params: Vec<f64>,
    /// Per-analyzer log-likelihoods keyed `site/analyzer`.
    pub analyzers: BTreeMap<String, f64>,
    /// Weighted total log-likelihood.
    pub total: f64,
}

/// Results of one or more iterations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultTable {
    /// Ordered parameter names.
    pub param_names: Vec<String>,
    /// Rows ordered by iteration then sample index.
    pub rows: Vec<ResultRow>,
}

impl ResultTable {
    /// Creates an empty table for the given parameters.
    pub fn new(param_names: Vec<String>) -> Self {
        Self {
            param_names,
            rows: Vec::new(),
        }
    }

    /// Rows belonging to a single iteration.
    pub fn iteration_rows(&self, iteration: usize) -> impl Iterator<Item = &ResultRow> {
        self.rows.iter().filter(move |row| row.iteration == iteration)
    }

    /// Total log-likelihood per sample index for one iteration.
    pub fn totals_for(&self, iteration: usize) -> BTreeMap<usize, f64> {
        self.iteration_rows(iteration)
            .map(|row| (row.sample, row.total))
            .collect()
    }

    /// Replaces every row of the rows' iteration(s) with the provided rows.
    pub fn merge(&mut self, rows: &[ResultRow]) {
        let iterations: std::collections::BTreeSet<usize> =
            rows.iter().map(|row| row.iteration).collect();
        self.rows.retain(|row| !iterations.contains(&row.iteration));
        self.rows.extend(rows.iter().cloned());
        self.rows
            .sort_by(|a, b| a.iteration.cmp(&b.iteration).then(a.sample.cmp(&b.sample)));
    }

    /// Drops rows of every iteration after `last` (all rows when `None`).
    pub fn truncate_after(&mut self, last: Option<usize>) {
        match last {
            Some(last) => self.rows.retain(|row| row.iteration <= last),
            None => self.rows.clear(),
        }
    }

    /// Highest iteration present in the table.
    pub fn last_iteration(&self) -> Option<usize> {
        self.rows.iter().map(|row| row.iteration).max()
    }

    /// Rows ranked by total log-likelihood, best first.
    pub fn leaderboard(&self) -> Vec<&ResultRow> {
        let mut ranked: Vec<&ResultRow> = self.rows.iter().collect();
        ranked.sort_by(|a, b| b.total.total_cmp(&a.total));
        ranked
    }
}

/// Points produced once an algorithm has stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalSamples {
    /// Ordered parameter names.
    pub param_names: Vec<String>,
    /// Resampled parameter vectors.
    pub points: Vec<Vec<f64>>,
    /// Diagnostic weight of each point.
    pub weights: Vec<f64>,
}

impl FinalSamples {
    /// Weighted mean of the points, one entry per parameter.
    pub fn weighted_mean(&self) -> Vec<f64> {
        let dim = self.param_names.len();
        let total: f64 = self.weights.iter().sum();
        let mut mean = vec![0.0; dim];
        if total <= 0.0 {
            return mean;
        }
        for (point, weight) in self.points.iter().zip(&self.weights) {
            for (acc, value) in mean.iter_mut().zip(point) {
                *acc += weight * value / total;
            }
        }
        mean
    }
}
