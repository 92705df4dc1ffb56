//! Independent per-parameter prior distributions.

use std::f64::consts::PI;

use calib_core::errors::{CalibError, ErrorInfo};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Marginal distribution of one calibrated parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Distribution {
    /// Flat density on `[min, max]`.
    Uniform {
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },
    /// Gaussian density with the given mean and standard deviation.
    Normal {
        /// Mean of the distribution.
        mean: f64,
        /// Standard deviation (not variance).
        sd: f64,
    },
    /// Density proportional to `1/x` on `[min, max]`.
    LogUniform {
        /// Lower bound, strictly positive.
        min: f64,
        /// Upper bound.
        max: f64,
    },
}

impl Distribution {
    fn validate(&self, name: &str) -> Result<(), CalibError> {
        let ok = match *self {
            Distribution::Uniform { min, max } => min.is_finite() && max.is_finite() && min < max,
            Distribution::Normal { mean, sd } => mean.is_finite() && sd.is_finite() && sd > 0.0,
            Distribution::LogUniform { min, max } => {
                min.is_finite() && max.is_finite() && min > 0.0 && min < max
            }
        };
        if ok {
            Ok(())
        } else {
            Err(CalibError::Configuration(
                ErrorInfo::new("prior-invalid", "prior distribution has invalid parameters")
                    .with_context("param", name)
                    .with_context("distribution", format!("{self:?}")),
            ))
        }
    }

    /// Probability density at `x`.
    pub fn density(&self, x: f64) -> f64 {
        match *self {
            Distribution::Uniform { min, max } => {
                if (min..=max).contains(&x) {
                    1.0 / (max - min)
                } else {
                    0.0
                }
            }
            Distribution::Normal { mean, sd } => {
                let z = (x - mean) / sd;
                (-0.5 * z * z).exp() / (sd * (2.0 * PI).sqrt())
            }
            Distribution::LogUniform { min, max } => {
                if (min..=max).contains(&x) {
                    1.0 / (x * (max / min).ln())
                } else {
                    0.0
                }
            }
        }
    }

    /// Natural log of the density; `-inf` outside the support.
    pub fn log_density(&self, x: f64) -> f64 {
        match *self {
            Distribution::Normal { mean, sd } => {
                let z = (x - mean) / sd;
                -0.5 * z * z - (sd * (2.0 * PI).sqrt()).ln()
            }
            _ => self.density(x).ln(),
        }
    }

    /// Draws one value.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            Distribution::Uniform { min, max } => rng.gen_range(min..max),
            Distribution::Normal { mean, sd } => {
                let z: f64 = rng.sample(StandardNormal);
                mean + sd * z
            }
            Distribution::LogUniform { min, max } => rng.gen_range(min.ln()..max.ln()).exp(),
        }
    }

    /// Support of the distribution.
    pub fn bounds(&self) -> (f64, f64) {
        match *self {
            Distribution::Uniform { min, max } | Distribution::LogUniform { min, max } => {
                (min, max)
            }
            Distribution::Normal { .. } => (f64::NEG_INFINITY, f64::INFINITY),
        }
    }

    /// Variance of the distribution.
    pub fn variance(&self) -> f64 {
        match *self {
            Distribution::Uniform { min, max } => (max - min).powi(2) / 12.0,
            Distribution::Normal { sd, .. } => sd * sd,
            Distribution::LogUniform { min, max } => {
                let log_ratio = (max / min).ln();
                let mean = (max - min) / log_ratio;
                let second = (max * max - min * min) / (2.0 * log_ratio);
                second - mean * mean
            }
        }
    }
}

/// Named parameter and its prior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name used to label sample tables.
    pub name: String,
    /// Marginal prior distribution.
    #[serde(flatten)]
    pub distribution: Distribution,
}

/// Joint prior built from independent marginals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prior {
    params: Vec<ParamSpec>,
}

impl Prior {
    /// Builds a prior, rejecting empty, duplicated or malformed parameters.
    pub fn new(params: Vec<ParamSpec>) -> Result<Self, CalibError> {
        if params.is_empty() {
            return Err(CalibError::configuration(
                "prior-empty",
                "at least one calibrated parameter is required",
            ));
        }
        for (index, param) in params.iter().enumerate() {
            param.distribution.validate(&param.name)?;
            if params[..index].iter().any(|other| other.name == param.name) {
                return Err(CalibError::Configuration(
                    ErrorInfo::new("prior-duplicate", "parameter names must be unique")
                        .with_context("param", &param.name),
                ));
            }
        }
        Ok(Self { params })
    }

    /// Number of calibrated parameters.
    pub fn dim(&self) -> usize {
        self.params.len()
    }

    /// Ordered parameter names.
    pub fn names(&self) -> Vec<String> {
        self.params.iter().map(|param| param.name.clone()).collect()
    }

    /// Parameter specifications in order.
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Joint density at `point`; zero outside the support.
    pub fn density(&self, point: &[f64]) -> f64 {
        if point.len() != self.params.len() {
            return 0.0;
        }
        self.params
            .iter()
            .zip(point)
            .map(|(param, &value)| param.distribution.density(value))
            .product()
    }

    /// Joint log density at `point`.
    pub fn log_density(&self, point: &[f64]) -> f64 {
        if point.len() != self.params.len() {
            return f64::NEG_INFINITY;
        }
        self.params
            .iter()
            .zip(point)
            .map(|(param, &value)| param.distribution.log_density(value))
            .sum()
    }

    /// Draws one joint sample.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        self.params
            .iter()
            .map(|param| param.distribution.sample(rng))
            .collect()
    }

    /// Per-parameter support.
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.params
            .iter()
            .map(|param| param.distribution.bounds())
            .collect()
    }

    /// Diagonal of the prior covariance.
    pub fn variances(&self) -> Vec<f64> {
        self.params
            .iter()
            .map(|param| param.distribution.variance())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calib_core::RngHandle;

    fn spec(name: &str, distribution: Distribution) -> ParamSpec {
        ParamSpec {
            name: name.into(),
            distribution,
        }
    }

    #[test]
    fn normal_density_matches_closed_form() {
        let dist = Distribution::Normal { mean: 0.0, sd: 5.0 };
        let expected = 1.0 / (5.0 * (2.0 * PI).sqrt());
        assert!((dist.density(0.0) - expected).abs() < 1e-12);
        assert!((dist.variance() - 25.0).abs() < 1e-12);
        assert!((dist.log_density(3.0) - dist.density(3.0).ln()).abs() < 1e-12);
    }

    #[test]
    fn uniform_density_vanishes_outside_support() {
        let prior = Prior::new(vec![
            spec("a", Distribution::Uniform { min: 0.0, max: 2.0 }),
            spec("b", Distribution::LogUniform { min: 1.0, max: 10.0 }),
        ])
        .unwrap();
        assert_eq!(prior.density(&[3.0, 2.0]), 0.0);
        assert!(prior.density(&[1.0, 2.0]) > 0.0);
    }

    #[test]
    fn samples_stay_in_bounds() {
        let prior = Prior::new(vec![spec(
            "c",
            Distribution::LogUniform {
                min: 0.01,
                max: 100.0,
            },
        )])
        .unwrap();
        let mut rng = RngHandle::from_seed(3);
        for _ in 0..1000 {
            let x = prior.sample(&mut rng)[0];
            assert!((0.01..=100.0).contains(&x));
        }
    }

    #[test]
    fn rejects_duplicates_and_bad_parameters() {
        let dup = Prior::new(vec![
            spec("a", Distribution::Normal { mean: 0.0, sd: 1.0 }),
            spec("a", Distribution::Normal { mean: 0.0, sd: 1.0 }),
        ]);
        assert!(matches!(dup, Err(CalibError::Configuration(_))));
        let bad = Prior::new(vec![spec("a", Distribution::Uniform { min: 1.0, max: 1.0 })]);
        assert!(bad.is_err());
    }

    #[test]
    fn parses_flattened_yaml() {
        let yaml = "- name: beta\n  type: uniform\n  min: 0.0\n  max: 1.0\n- name: sigma\n  type: normal\n  mean: 0.0\n  sd: 5.0\n";
        let params: Vec<ParamSpec> = serde_yaml::from_str(yaml).unwrap();
        let prior = Prior::new(params).unwrap();
        assert_eq!(prior.names(), vec!["beta".to_string(), "sigma".to_string()]);
    }
}
