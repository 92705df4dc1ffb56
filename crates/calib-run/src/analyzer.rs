use std::collections::BTreeMap;

use calib_core::errors::{CalibError, ErrorInfo};
use calib_core::serde::{from_json_value, to_json_value};
use calib_core::{ResultRow, SampleSet};
use serde_json::{json, Value};

use crate::config::{AnalyzerSpec, SiteConfig};
use crate::executor::SimulationOutput;

/// What one analyzer produced for an iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerOutput {
    /// Log-likelihood per sample index.
    pub per_sample: BTreeMap<usize, f64>,
    /// Algorithm-agnostic blob from which `per_sample` can be rebuilt.
    pub cache: Value,
}

/// Turns simulation outputs into per-sample log-likelihoods.
pub trait Analyzer: Send + Sync {
    /// Name used in result columns.
    fn name(&self) -> &str;

    /// Scores every sample present in `outputs`.
    fn analyze(&self, outputs: &[SimulationOutput]) -> Result<AnalyzerOutput, CalibError>;

    /// Rebuilds the per-sample values from a cache written by `analyze`.
    fn from_cache(&self, cache: &Value) -> Result<BTreeMap<usize, f64>, CalibError>;
}

/// Averages a numeric output field over replicates.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarOutputAnalyzer {
    field: String,
}

impl ScalarOutputAnalyzer {
    /// Analyzer reading `field` from each output document.
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Analyzer for ScalarOutputAnalyzer {
    fn name(&self) -> &str {
        &self.field
    }

    fn analyze(&self, outputs: &[SimulationOutput]) -> Result<AnalyzerOutput, CalibError> {
        let mut sums: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
        for output in outputs {
            let value = output
                .values
                .get(&self.field)
                .and_then(Value::as_f64)
                .ok_or_else(|| {
                    CalibError::Analyzer(
                        ErrorInfo::new("scalar-field-missing", "output lacks a numeric field")
                            .with_context("field", &self.field)
                            .with_context("sample", output.sample)
                            .with_context("replicate", output.replicate),
                    )
                })?;
            let entry = sums.entry(output.sample).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
        let per_sample: BTreeMap<usize, f64> = sums
            .into_iter()
            .map(|(sample, (sum, count))| (sample, sum / count as f64))
            .collect();
        Ok(AnalyzerOutput {
            cache: json!({ "field": self.field, "per_sample": to_json_value(&per_sample)? }),
            per_sample,
        })
    }

    fn from_cache(&self, cache: &Value) -> Result<BTreeMap<usize, f64>, CalibError> {
        let per_sample = cache.get("per_sample").cloned().ok_or_else(|| {
            CalibError::Analyzer(
                ErrorInfo::new("scalar-cache", "analyzer cache has no per-sample table")
                    .with_context("field", &self.field),
            )
        })?;
        from_json_value(per_sample)
    }
}

/// Analyzer plus its weight in the total.
pub struct WeightedAnalyzer {
    /// The analyzer.
    pub analyzer: Box<dyn Analyzer>,
    /// Multiplier applied to its values.
    pub weight: f64,
}

/// Reference site and its analyzers.
pub struct Site {
    /// Site name.
    pub name: String,
    /// Analyzers scoring the site.
    pub analyzers: Vec<WeightedAnalyzer>,
}

impl Site {
    /// Builds the sites described by a configuration.
    pub fn from_config(configs: &[SiteConfig]) -> Vec<Site> {
        configs
            .iter()
            .map(|site| Site {
                name: site.name.clone(),
                analyzers: site
                    .analyzers
                    .iter()
                    .map(|spec| match spec {
                        AnalyzerSpec::ScalarOutput { field, weight } => WeightedAnalyzer {
                            analyzer: Box::new(ScalarOutputAnalyzer::new(field.clone())),
                            weight: *weight,
                        },
                    })
                    .collect(),
            })
            .collect()
    }

    /// Column key of one of the site's analyzers.
    pub fn key(&self, analyzer: &dyn Analyzer) -> String {
        format!("{}/{}", self.name, analyzer.name())
    }

    /// Analyzer names, for the calibration checkpoint.
    pub fn analyzer_names(&self) -> Vec<String> {
        self.analyzers
            .iter()
            .map(|entry| entry.analyzer.name().to_string())
            .collect()
    }
}

/// Combines per-analyzer values into one result row per sample.
///
/// `-inf` values are clamped to `f64::MIN` so rows stay JSON-serializable;
/// `NaN` and `+inf` are rejected.
pub fn combine(
    samples: &SampleSet,
    sites: &[Site],
    per_analyzer: &BTreeMap<String, BTreeMap<usize, f64>>,
) -> Result<Vec<ResultRow>, CalibError> {
    let mut rows = Vec::with_capacity(samples.len());
    for (&sample, params) in &samples.samples {
        let mut analyzers = BTreeMap::new();
        let mut total = 0.0;
        for site in sites {
            for entry in &site.analyzers {
                let key = site.key(entry.analyzer.as_ref());
                let value = per_analyzer
                    .get(&key)
                    .and_then(|values| values.get(&sample))
                    .copied()
                    .ok_or_else(|| {
                        CalibError::Analyzer(
                            ErrorInfo::new("analyzer-missing-sample", "analyzer skipped a sample")
                                .with_context("analyzer", &key)
                                .with_context("iteration", samples.iteration)
                                .with_context("sample", sample),
                        )
                    })?;
                if value.is_nan() || value == f64::INFINITY {
                    return Err(CalibError::Analyzer(
                        ErrorInfo::new("analyzer-invalid-value", "log-likelihood is not a number")
                            .with_context("analyzer", &key)
                            .with_context("sample", sample),
                    ));
                }
                let value = value.max(f64::MIN);
                total += entry.weight * value;
                analyzers.insert(key, value);
            }
        }
        rows.push(ResultRow {
            iteration: samples.iteration,
            sample,
            params: params.clone(),
            analyzers,
            total: total.max(f64::MIN),
        });
    }
    Ok(rows)
}
