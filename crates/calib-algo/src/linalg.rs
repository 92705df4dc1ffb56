//! Gaussian kernels and weighted moment estimates backed by `nalgebra`.

use std::f64::consts::PI;

use calib_core::errors::{CalibError, ErrorInfo};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

const MAX_JITTER_ATTEMPTS: usize = 12;

/// Multivariate normal component stored in plain vectors so it serializes
/// verbatim into algorithm snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianKernel {
    /// Mean vector.
    pub center: Vec<f64>,
    /// Row-major covariance matrix.
    pub covariance: Vec<Vec<f64>>,
}

/// Cholesky factor of a kernel, reused across many density evaluations.
#[derive(Debug, Clone)]
pub struct FactoredKernel {
    center: DVector<f64>,
    lower: DMatrix<f64>,
    log_norm: f64,
}

impl GaussianKernel {
    /// Dimension of the kernel.
    pub fn dim(&self) -> usize {
        self.center.len()
    }

    fn matrix(&self) -> DMatrix<f64> {
        let dim = self.dim();
        DMatrix::from_fn(dim, dim, |row, col| self.covariance[row][col])
    }

    /// Factorizes the covariance; fails when it is not positive definite.
    pub fn factor(&self) -> Result<FactoredKernel, CalibError> {
        let dim = self.dim();
        let lower = self
            .matrix()
            .cholesky()
            .ok_or_else(|| {
                CalibError::Numeric(
                    ErrorInfo::new("covariance-not-pd", "kernel covariance is not positive definite")
                        .with_context("dim", dim),
                )
            })?
            .unpack();
        let log_det: f64 = 2.0 * lower.diagonal().iter().map(|value| value.ln()).sum::<f64>();
        if !log_det.is_finite() {
            return Err(CalibError::Numeric(
                ErrorInfo::new("covariance-degenerate", "kernel covariance has a vanishing determinant")
                    .with_context("dim", dim),
            ));
        }
        Ok(FactoredKernel {
            center: DVector::from_column_slice(&self.center),
            lower,
            log_norm: -0.5 * (dim as f64 * (2.0 * PI).ln() + log_det),
        })
    }

    /// Density of the kernel at every point.
    pub fn densities(&self, points: &[Vec<f64>]) -> Result<Vec<f64>, CalibError> {
        let factored = self.factor()?;
        points
            .iter()
            .map(|point| factored.log_density(point).map(f64::exp))
            .collect()
    }
}

impl FactoredKernel {
    /// Log density at `point`.
    pub fn log_density(&self, point: &[f64]) -> Result<f64, CalibError> {
        let diff = DVector::from_column_slice(point) - &self.center;
        let z = self.lower.solve_lower_triangular(&diff).ok_or_else(|| {
            CalibError::Numeric(ErrorInfo::new(
                "triangular-solve",
                "singular Cholesky factor during density evaluation",
            ))
        })?;
        Ok(self.log_norm - 0.5 * z.norm_squared())
    }

    /// Draws one point from the kernel.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let z = DVector::from_iterator(
            self.center.len(),
            (0..self.center.len()).map(|_| rng.sample::<f64, _>(StandardNormal)),
        );
        let draw = &self.center + &self.lower * z;
        draw.iter().copied().collect()
    }
}

/// Weighted covariance of `points` around a fixed `center`.
///
/// `weights` must already sum to one.
pub fn weighted_covariance(points: &[&[f64]], weights: &[f64], center: &[f64]) -> Vec<Vec<f64>> {
    let dim = center.len();
    let mut cov = vec![vec![0.0; dim]; dim];
    for (point, &weight) in points.iter().zip(weights) {
        for row in 0..dim {
            let dr = point[row] - center[row];
            for col in row..dim {
                cov[row][col] += weight * dr * (point[col] - center[col]);
            }
        }
    }
    for row in 0..dim {
        for col in 0..row {
            cov[row][col] = cov[col][row];
        }
    }
    cov
}

/// Builds a kernel, inflating the diagonal until the covariance factorizes.
pub fn fit_kernel(center: Vec<f64>, covariance: Vec<Vec<f64>>) -> Result<GaussianKernel, CalibError> {
    let dim = center.len();
    let mut kernel = GaussianKernel { center, covariance };
    if kernel.factor().is_ok() {
        return Ok(kernel);
    }
    let scale = (0..dim)
        .map(|index| kernel.covariance[index][index].abs())
        .sum::<f64>()
        / dim.max(1) as f64;
    let base = if scale > 0.0 { scale * 1e-10 } else { 1e-10 };
    let original = kernel.covariance.clone();
    for attempt in 0..MAX_JITTER_ATTEMPTS {
        let jitter = base * 10f64.powi(attempt as i32);
        kernel.covariance = original.clone();
        for index in 0..dim {
            kernel.covariance[index][index] += jitter;
        }
        if kernel.factor().is_ok() {
            return Ok(kernel);
        }
    }
    Err(CalibError::Numeric(
        ErrorInfo::new("kernel-fit", "could not regularize kernel covariance")
            .with_context("dim", dim)
            .with_hint("increase samples_per_iteration or widen the prior"),
    ))
}

/// Stable `ln(sum(exp(values)))`; `-inf` when every value is `-inf`.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|value| (value - max).exp()).sum::<f64>().ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use calib_core::RngHandle;

    #[test]
    fn standard_normal_density_at_origin() {
        let kernel = GaussianKernel {
            center: vec![0.0, 0.0],
            covariance: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
        };
        let density = kernel.densities(&[vec![0.0, 0.0]]).unwrap()[0];
        assert!((density - 1.0 / (2.0 * PI)).abs() < 1e-12);
    }

    #[test]
    fn weighted_covariance_of_symmetric_pair() {
        let a = [1.0, 0.0];
        let b = [-1.0, 0.0];
        let cov = weighted_covariance(&[&a, &b], &[0.5, 0.5], &[0.0, 0.0]);
        assert!((cov[0][0] - 1.0).abs() < 1e-12);
        assert_eq!(cov[1][1], 0.0);
    }

    #[test]
    fn singular_covariance_gets_jitter() {
        let kernel = fit_kernel(vec![0.0, 0.0], vec![vec![1.0, 1.0], vec![1.0, 1.0]]).unwrap();
        assert!(kernel.factor().is_ok());
        assert!(kernel.covariance[0][0] > 1.0);
    }

    #[test]
    fn kernel_samples_follow_covariance() {
        let kernel = GaussianKernel {
            center: vec![3.0],
            covariance: vec![vec![4.0]],
        };
        let factored = kernel.factor().unwrap();
        let mut rng = RngHandle::from_seed(17);
        let draws: Vec<f64> = (0..20_000).map(|_| factored.sample(&mut rng)[0]).collect();
        let mean = draws.iter().sum::<f64>() / draws.len() as f64;
        let var = draws.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / draws.len() as f64;
        assert!((mean - 3.0).abs() < 0.1);
        assert!((var - 4.0).abs() < 0.2);
    }

    #[test]
    fn log_sum_exp_handles_empty_mass() {
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY, f64::NEG_INFINITY]), f64::NEG_INFINITY);
        assert!((log_sum_exp(&[0.0, 0.0]) - 2f64.ln()).abs() < 1e-12);
    }
}
