use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use calib_algo::{AlgorithmConfig, ParamSpec, Prior};
use calib_core::errors::{CalibError, ErrorInfo};
use calib_core::serde::from_yaml_slice;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// YAML-configurable description of one calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibConfig {
    /// Calibration name; also the name of its directory.
    pub name: String,
    /// Root directory holding calibration directories.
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Upper bound on the number of iterations.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Simulations per sample, each with its own seed.
    #[serde(default = "default_replicates")]
    pub replicates: usize,
    /// Job polling cadence.
    #[serde(default)]
    pub poll: PollConfig,
    /// Next-point algorithm and its settings.
    #[serde(default)]
    pub algorithm: AlgorithmConfig,
    /// Calibrated parameters and their priors.
    pub params: Vec<ParamSpec>,
    /// Reference sites and the analyzers scoring them.
    pub sites: Vec<SiteConfig>,
    /// Master seed and substream policy.
    #[serde(default)]
    pub seed_policy: SeedPolicy,
    /// Hard-delete jobs no checkpoint references once the run finalizes.
    #[serde(default)]
    pub purge_orphans: bool,
    /// Opaque block handed to the executor with every batch.
    #[serde(default)]
    pub simulation: Value,
    /// Settings of the in-process executor.
    #[serde(default)]
    pub local: LocalConfig,
}

fn default_directory() -> PathBuf {
    PathBuf::from("calibrations")
}

fn default_max_iterations() -> usize {
    10
}

fn default_replicates() -> usize {
    1
}

/// Polling cadence in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Interval between status polls while a batch runs.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    /// Interval between status polls while waiting for a cancellation.
    #[serde(default = "default_kill_interval")]
    pub kill_interval: f64,
}

fn default_poll_interval() -> f64 {
    10.0
}

fn default_kill_interval() -> f64 {
    1.0
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            kill_interval: default_kill_interval(),
        }
    }
}

impl PollConfig {
    /// Poll interval as a duration.
    pub fn poll_duration(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval)
    }

    /// Kill interval as a duration.
    pub fn kill_duration(&self) -> Duration {
        Duration::from_secs_f64(self.kill_interval)
    }
}

/// Deterministic seeding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedPolicy {
    /// Master seed feeding every sampling and simulation substream.
    #[serde(default = "default_master_seed")]
    pub master_seed: u64,
    /// Optional label recorded next to the seed.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_master_seed() -> u64 {
    0x05EE_D5EE_DD15_5EED_u64
}

impl Default for SeedPolicy {
    fn default() -> Self {
        Self {
            master_seed: default_master_seed(),
            label: None,
        }
    }
}

/// In-process executor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Size of the simulation thread pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Built-in model run by the CLI.
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_workers() -> usize {
    1
}

fn default_model() -> String {
    "gaussian-peak".to_string()
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            model: default_model(),
        }
    }
}

/// One reference site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Site name, prefixed to every analyzer column.
    pub name: String,
    /// Analyzers scoring the site.
    pub analyzers: Vec<AnalyzerSpec>,
}

/// Built-in analyzer selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AnalyzerSpec {
    /// Reads a numeric field of each simulation output.
    ScalarOutput {
        /// Field holding the log-likelihood.
        field: String,
        /// Weight of the analyzer in the total.
        #[serde(default = "default_weight")]
        weight: f64,
    },
}

fn default_weight() -> f64 {
    1.0
}

impl CalibConfig {
    /// Reads and validates a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self, CalibError> {
        let bytes = fs::read(path).map_err(|err| CalibError::io("config-read", path, err))?;
        let config: CalibConfig = from_yaml_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Directory holding this calibration's checkpoints.
    pub fn calibration_dir(&self) -> PathBuf {
        self.directory.join(&self.name)
    }

    /// Joint prior over the calibrated parameters.
    pub fn prior(&self) -> Result<Prior, CalibError> {
        Prior::new(self.params.clone())
    }

    /// Rejects settings that would fail later in the run.
    pub fn validate(&self) -> Result<(), CalibError> {
        validate_name(&self.name)?;
        if self.max_iterations == 0 || self.replicates == 0 {
            return Err(CalibError::configuration(
                "config-counts",
                "max_iterations and replicates must be positive",
            ));
        }
        for (field, value) in [
            ("poll_interval", self.poll.poll_interval),
            ("kill_interval", self.poll.kill_interval),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(CalibError::Configuration(
                    ErrorInfo::new("config-poll", "poll intervals must be positive seconds")
                        .with_context("field", field)
                        .with_context("value", value),
                ));
            }
        }
        if self.local.workers == 0 {
            return Err(CalibError::configuration(
                "config-workers",
                "local.workers must be positive",
            ));
        }
        if self.sites.is_empty() {
            return Err(CalibError::configuration(
                "config-sites",
                "at least one site is required",
            ));
        }
        for site in &self.sites {
            if site.analyzers.is_empty() {
                return Err(CalibError::Configuration(
                    ErrorInfo::new("config-analyzers", "site has no analyzers")
                        .with_context("site", &site.name),
                ));
            }
        }
        self.prior()?;
        Ok(())
    }
}

/// Calibration names become directory names.
pub fn validate_name(name: &str) -> Result<(), CalibError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CalibError::Configuration(
            ErrorInfo::new("config-name", "invalid calibration name")
                .with_context("name", name)
                .with_hint("use ASCII letters, digits, '-', '_' or '.'"),
        ))
    }
}
