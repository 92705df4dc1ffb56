//! YAML-facing algorithm settings.

use serde::{Deserialize, Serialize};

/// Selects and parameterizes the next-point algorithm of a calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AlgorithmConfig {
    /// Incremental mixture importance sampling.
    Imis(ImisConfig),
    /// Stochastic-perturbation gradient ascent.
    OptimTool(OptimToolConfig),
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        AlgorithmConfig::Imis(ImisConfig::default())
    }
}

/// IMIS tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImisConfig {
    /// Number of prior draws in the initial stage (`N0`).
    #[serde(default = "default_initial_samples")]
    pub initial_samples: usize,
    /// Draws per importance stage (`B`).
    #[serde(default = "default_samples_per_iteration")]
    pub samples_per_iteration: usize,
    /// Target resample count (`R`) used by the stopping rule and final extraction.
    #[serde(default = "default_resamples")]
    pub n_resamples: usize,
    /// Explicit initial design replacing prior draws; overrides `initial_samples`.
    #[serde(default)]
    pub initial_points: Option<Vec<Vec<f64>>>,
}

fn default_initial_samples() -> usize {
    2000
}

fn default_samples_per_iteration() -> usize {
    200
}

fn default_resamples() -> usize {
    3000
}

impl Default for ImisConfig {
    fn default() -> Self {
        Self {
            initial_samples: default_initial_samples(),
            samples_per_iteration: default_samples_per_iteration(),
            n_resamples: default_resamples(),
            initial_points: None,
        }
    }
}

impl ImisConfig {
    /// Effective size of the initial stage.
    pub fn n_initial_samples(&self) -> usize {
        self.initial_points
            .as_ref()
            .map_or(self.initial_samples, |points| points.len())
    }
}

/// OptimTool tuning knobs. Radii and steps are fractions of each parameter range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimToolConfig {
    /// Perturbed points drawn around the center each iteration.
    #[serde(default = "default_optim_samples")]
    pub samples_per_iteration: usize,
    /// Radius of the perturbation hypersphere.
    #[serde(default = "default_perturbation_radius")]
    pub perturbation_radius: f64,
    /// Length of the move along the normalized gradient.
    #[serde(default = "default_step_size")]
    pub step_size: f64,
    /// Iterations without improvement before stopping.
    #[serde(default = "default_stagnant")]
    pub n_stagnant: usize,
    /// Minimum improvement of the best total counted as progress.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Starting point; defaults to the middle of the prior support.
    #[serde(default)]
    pub initial_center: Option<Vec<f64>>,
}

fn default_optim_samples() -> usize {
    16
}

fn default_perturbation_radius() -> f64 {
    0.1
}

fn default_step_size() -> f64 {
    0.05
}

fn default_stagnant() -> usize {
    3
}

fn default_tolerance() -> f64 {
    1e-3
}

impl Default for OptimToolConfig {
    fn default() -> Self {
        Self {
            samples_per_iteration: default_optim_samples(),
            perturbation_radius: default_perturbation_radius(),
            step_size: default_step_size(),
            n_stagnant: default_stagnant(),
            tolerance: default_tolerance(),
            initial_center: None,
        }
    }
}
