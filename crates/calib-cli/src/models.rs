//! Built-in toy simulators selectable through `local.model`.

use std::sync::Arc;

use calib_core::{CalibError, ErrorInfo, RngHandle};
use calib_run::{ModelFn, ModelInput};
use rand_distr::{Distribution, Normal};
use serde_json::{json, Value};

/// Names accepted by [`lookup`].
pub const MODELS: [&str; 2] = ["gaussian-peak", "rosenbrock"];

/// Resolves a model name from the configuration.
pub fn lookup(name: &str) -> Result<ModelFn, CalibError> {
    match name {
        "gaussian-peak" => Ok(Arc::new(gaussian_peak)),
        "rosenbrock" => Ok(Arc::new(rosenbrock)),
        other => Err(CalibError::Configuration(
            ErrorInfo::new("model-unknown", "unknown built-in model")
                .with_context("model", other)
                .with_hint(format!("choose one of {}", MODELS.join(", "))),
        )),
    }
}

fn number(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Isotropic Gaussian log-likelihood around `simulation.peak` (default the
/// origin) with `simulation.width`, plus optional seeded observation noise.
fn gaussian_peak(input: &ModelInput<'_>) -> Result<Value, String> {
    let width = number(input.config, "width", 1.0);
    if !(width.is_finite() && width > 0.0) {
        return Err(format!("width must be positive, got {width}"));
    }
    let peak: Vec<f64> = match input.config.get("peak") {
        Some(Value::Array(values)) => values.iter().filter_map(Value::as_f64).collect(),
        _ => Vec::new(),
    };
    let distance: f64 = input
        .params
        .iter()
        .enumerate()
        .map(|(index, x)| {
            let center = peak.get(index).copied().unwrap_or(0.0);
            ((x - center) / width).powi(2)
        })
        .sum();

    let noise_sd = number(input.config, "noise_sd", 0.0);
    let noise = if noise_sd > 0.0 {
        let normal = Normal::new(0.0, noise_sd).map_err(|err| err.to_string())?;
        normal.sample(&mut RngHandle::from_seed(input.seed))
    } else {
        0.0
    };
    Ok(json!({ "log_likelihood": -0.5 * distance + noise }))
}

/// Negated Rosenbrock valley over consecutive parameter pairs.
fn rosenbrock(input: &ModelInput<'_>) -> Result<Value, String> {
    let scale = number(input.config, "scale", 100.0);
    let value: f64 = input
        .params
        .windows(2)
        .map(|pair| scale * (pair[1] - pair[0] * pair[0]).powi(2) + (1.0 - pair[0]).powi(2))
        .sum();
    Ok(json!({ "log_likelihood": -value }))
}
