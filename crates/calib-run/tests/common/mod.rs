#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use calib_run::{CalibConfig, IterationRecord, LocalExecutor, ModelFn, ModelInput};
use serde_json::json;

const CONFIG: &str = r#"
name: peak
max_iterations: 3
poll:
  poll_interval: 0.01
  kill_interval: 0.01
algorithm:
  type: imis
  initial_samples: 60
  samples_per_iteration: 15
  n_resamples: 1000
params:
  - name: x
    type: normal
    mean: 0.0
    sd: 5.0
sites:
  - name: peak
    analyzers:
      - type: scalar-output
        field: log_likelihood
"#;

/// Three-iteration IMIS calibration rooted at `root`.
pub fn config(root: &Path) -> CalibConfig {
    let mut config: CalibConfig = serde_yaml::from_str(CONFIG).unwrap();
    config.directory = root.join("calibrations");
    config
}

fn log_likelihood(input: &ModelInput<'_>) -> f64 {
    -0.5 * (input.params[0] - 2.0).powi(2)
}

/// Deterministic peak at `x = 2`.
pub fn gaussian_model() -> ModelFn {
    Arc::new(|input: &ModelInput<'_>| Ok(json!({ "log_likelihood": log_likelihood(input) })))
}

/// Same peak, sleeping before each evaluation.
pub fn slow_model(delay: Duration) -> ModelFn {
    Arc::new(move |input: &ModelInput<'_>| {
        thread::sleep(delay);
        Ok(json!({ "log_likelihood": log_likelihood(input) }))
    })
}

/// Same peak, failing every simulation while `broken` is set.
pub fn switchable_model(broken: Arc<AtomicBool>) -> ModelFn {
    Arc::new(move |input: &ModelInput<'_>| {
        if broken.load(Ordering::SeqCst) {
            Err("model crashed".to_string())
        } else {
            Ok(json!({ "log_likelihood": log_likelihood(input) }))
        }
    })
}

pub fn executor(root: &Path, model: ModelFn, location: &str) -> Arc<LocalExecutor> {
    Arc::new(
        LocalExecutor::new(root.join("suites"), model)
            .with_workers(2)
            .with_location(location),
    )
}

pub fn record(config: &CalibConfig, iteration: usize) -> IterationRecord {
    IterationRecord::load(&config.calibration_dir(), iteration).unwrap()
}
