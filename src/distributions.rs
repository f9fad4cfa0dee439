/*!
Traits describing the two black boxes every sampler consumes, a target log-density and a
proposal kernel, together with a closure adapter for user-supplied densities and a handful
of reference targets.

# Examples

```rust
use uq_mcmc::distributions::{LogDensity, Target};

// Unnormalized standard normal in two dimensions, with per-dimension marginals.
let target = LogDensity::new(|x: &[f64]| -0.5 * x.iter().map(|v| v * v).sum::<f64>())
    .add_marginal(|v: f64, _: &()| -0.5 * v * v)
    .add_marginal(|v: f64, _: &()| -0.5 * v * v);
assert_eq!(target.unnorm_log_prob(&[1.0, 0.0]), -0.5);
assert_eq!(target.marginal_log_prob(1, 2.0), Some(-2.0));
```

A density that is only available on the natural scale can be wrapped with
[`LogDensity::from_pdf`]; the value is clamped at `1e-320` before the logarithm so that
zero-density regions map to a very negative, finite log-density.

```rust
use uq_mcmc::distributions::{LogDensity, Target};

let uniform = LogDensity::from_pdf(|x: &[f64]| if (0.0..1.0).contains(&x[0]) { 1.0 } else { 0.0 });
assert_eq!(uniform.unnorm_log_prob(&[0.5]), 0.0);
assert!(uniform.unnorm_log_prob(&[2.0]).is_finite());
```
*/

use nalgebra as na;
use ndarray::{Array1, Array2, ArrayView2};
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

use crate::errors::{McmcError, Result};

/// Smallest density value used before taking a logarithm.
pub const MIN_DENSITY: f64 = 1e-320;

/// A continuous target distribution from which we want to sample.
pub trait Target: Send + Sync {
    /// Returns the log of the unnormalized density at `theta`.
    fn unnorm_log_prob(&self, theta: &[f64]) -> f64;

    /// Evaluates one state per row.
    fn unnorm_log_prob_batch(&self, thetas: ArrayView2<f64>) -> Vec<f64> {
        thetas
            .rows()
            .into_iter()
            .map(|row| match row.as_slice() {
                Some(theta) => self.unnorm_log_prob(theta),
                None => self.unnorm_log_prob(&row.to_vec()),
            })
            .collect()
    }

    /// The dimension the target is defined on, if it is fixed.
    fn dim(&self) -> Option<usize> {
        None
    }

    /// Whether one marginal log-density per dimension is available.
    fn has_marginals(&self) -> bool {
        false
    }

    /// Log of the unnormalized marginal density of component `index` at `value`.
    fn marginal_log_prob(&self, _index: usize, _value: f64) -> Option<f64> {
        None
    }
}

/// Distributions that also know their normalizing constant.
pub trait Normalized {
    /// Returns the normalized log-density at `theta`.
    fn log_prob(&self, theta: &[f64]) -> f64;
}

/// A transition kernel `q(x' | x)`.
///
/// Kernels draw from the chain's own random number generator so that every chain consumes
/// an independent, reproducible stream.
pub trait Proposal: Send + Sync {
    /// Samples a candidate from `q(. | current)`.
    fn sample(&self, current: &[f64], rng: &mut SmallRng) -> Vec<f64>;

    /// Evaluates `log q(to | from)`; `None` when the kernel cannot provide it.
    fn log_prob(&self, _from: &[f64], _to: &[f64]) -> Option<f64> {
        None
    }

    /// Symmetric kernels satisfy `q(x' | x) = q(x | x')` and never need `log_prob`.
    fn is_symmetric(&self) -> bool;

    /// The dimension the kernel is tied to, if any.
    fn dim(&self) -> Option<usize> {
        None
    }
}

pub type DensityFn<A> = Box<dyn Fn(&[f64], &A) -> f64 + Send + Sync>;
pub type MarginalFn<A> = Box<dyn Fn(f64, &A) -> f64 + Send + Sync>;

/**
A target built from a user-supplied log-density closure.

The closure receives the state and a reference to the fixed extra arguments `A`, which are
stored once and passed unchanged on every call. Marginal log-densities are appended in
dimension order with [`LogDensity::add_marginal`].
*/
pub struct LogDensity<A = ()> {
    log_pdf: DensityFn<A>,
    args: A,
    marginals: Vec<MarginalFn<A>>,
    dim: Option<usize>,
}

impl LogDensity<()> {
    pub fn new<F>(log_pdf: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        Self::with_args((), move |x: &[f64], _: &()| log_pdf(x))
    }

    /// Wraps a density (not log-density) closure.
    pub fn from_pdf<F>(pdf: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        Self::new(move |x: &[f64]| pdf(x).max(MIN_DENSITY).ln())
    }
}

impl<A: Send + Sync + 'static> LogDensity<A> {
    pub fn with_args<F>(args: A, log_pdf: F) -> Self
    where
        F: Fn(&[f64], &A) -> f64 + Send + Sync + 'static,
    {
        Self {
            log_pdf: Box::new(log_pdf),
            args,
            marginals: Vec::new(),
            dim: None,
        }
    }

    /// Wraps a density closure taking extra arguments.
    pub fn from_pdf_with_args<F>(args: A, pdf: F) -> Self
    where
        F: Fn(&[f64], &A) -> f64 + Send + Sync + 'static,
    {
        Self::with_args(args, move |x: &[f64], a: &A| pdf(x, a).max(MIN_DENSITY).ln())
    }

    /// Declares the dimension so that mismatches are caught when a sampler is built.
    pub fn dim(mut self, dim: usize) -> Self {
        self.dim = Some(dim);
        self
    }

    /// Appends the marginal log-density of the next dimension.
    pub fn add_marginal<F>(mut self, marginal: F) -> Self
    where
        F: Fn(f64, &A) -> f64 + Send + Sync + 'static,
    {
        self.marginals.push(Box::new(marginal));
        self
    }

    /// Appends the marginal density (not log-density) of the next dimension.
    pub fn add_marginal_pdf<F>(self, marginal: F) -> Self
    where
        F: Fn(f64, &A) -> f64 + Send + Sync + 'static,
    {
        self.add_marginal(move |v: f64, a: &A| marginal(v, a).max(MIN_DENSITY).ln())
    }

    pub fn args(&self) -> &A {
        &self.args
    }

    pub fn n_marginals(&self) -> usize {
        self.marginals.len()
    }
}

impl<A: Send + Sync> Target for LogDensity<A> {
    fn unnorm_log_prob(&self, theta: &[f64]) -> f64 {
        (self.log_pdf)(theta, &self.args)
    }

    fn dim(&self) -> Option<usize> {
        self.dim.or(if self.marginals.is_empty() {
            None
        } else {
            Some(self.marginals.len())
        })
    }

    fn has_marginals(&self) -> bool {
        !self.marginals.is_empty()
    }

    fn marginal_log_prob(&self, index: usize, value: f64) -> Option<f64> {
        self.marginals.get(index).map(|f| f(value, &self.args))
    }
}

impl<A> std::fmt::Debug for LogDensity<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogDensity")
            .field("dim", &self.dim)
            .field("n_marginals", &self.marginals.len())
            .finish()
    }
}

/**
A 2D Gaussian distribution parameterized by a mean vector and a 2×2 covariance matrix.

# Examples

```rust
use uq_mcmc::distributions::{Gaussian2D, Normalized};
use ndarray::{arr1, arr2};

let gauss = Gaussian2D {
    mean: arr1(&[0.0, 0.0]),
    cov: arr2(&[[1.0, 0.0], [0.0, 1.0]]),
};
let lp = gauss.log_prob(&[0.5, -0.5]);
assert!((lp - (-(2.0 * std::f64::consts::PI).ln() - 0.25)).abs() < 1e-12);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct Gaussian2D {
    pub mean: Array1<f64>,
    pub cov: Array2<f64>,
}

impl Gaussian2D {
    fn quadratic_form(&self, theta: &[f64]) -> f64 {
        let (a, b, c, d) = (
            self.cov[(0, 0)],
            self.cov[(0, 1)],
            self.cov[(1, 0)],
            self.cov[(1, 1)],
        );
        let det = a * d - b * c;
        let x0 = theta[0] - self.mean[0];
        let x1 = theta[1] - self.mean[1];
        (d * x0 * x0 - (b + c) * x0 * x1 + a * x1 * x1) / det
    }
}

impl Normalized for Gaussian2D {
    fn log_prob(&self, theta: &[f64]) -> f64 {
        let det = self.cov[(0, 0)] * self.cov[(1, 1)] - self.cov[(0, 1)] * self.cov[(1, 0)];
        -(2.0 * PI).ln() - 0.5 * det.abs().ln() - 0.5 * self.quadratic_form(theta)
    }
}

impl Target for Gaussian2D {
    fn unnorm_log_prob(&self, theta: &[f64]) -> f64 {
        -0.5 * self.quadratic_form(theta)
    }

    fn dim(&self) -> Option<usize> {
        Some(2)
    }
}

/**
A Gaussian with independent components. Its marginals are available, which makes it a
suitable target for component-wise samplers.

# Examples

```rust
use uq_mcmc::distributions::{DiagonalGaussian, Target};

let target = DiagonalGaussian::isotropic(3, 1.0);
assert_eq!(target.unnorm_log_prob(&[1.0, 1.0, 0.0]), -1.0);
assert_eq!(target.marginal_log_prob(0, 1.0), Some(-0.5));
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct DiagonalGaussian {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl DiagonalGaussian {
    pub fn new(mean: Vec<f64>, std: Vec<f64>) -> Result<Self> {
        if mean.len() != std.len() {
            return Err(McmcError::Configuration(format!(
                "mean has {} components but std has {}",
                mean.len(),
                std.len()
            )));
        }
        if std.iter().any(|s| s.is_nan() || *s <= 0.0) {
            return Err(McmcError::Configuration(
                "standard deviations must be positive".to_string(),
            ));
        }
        Ok(Self { mean, std })
    }

    /// Zero-mean Gaussian with the same standard deviation in every dimension.
    pub fn isotropic(dim: usize, std: f64) -> Self {
        Self {
            mean: vec![0.0; dim],
            std: vec![std; dim],
        }
    }

    fn component(&self, index: usize, value: f64) -> f64 {
        let z = (value - self.mean[index]) / self.std[index];
        -0.5 * z * z
    }
}

impl Normalized for DiagonalGaussian {
    fn log_prob(&self, theta: &[f64]) -> f64 {
        let log_norm: f64 = self
            .std
            .iter()
            .map(|s| -0.5 * (2.0 * PI).ln() - s.ln())
            .sum();
        log_norm + self.unnorm_log_prob(theta)
    }
}

impl Target for DiagonalGaussian {
    fn unnorm_log_prob(&self, theta: &[f64]) -> f64 {
        theta
            .iter()
            .enumerate()
            .map(|(i, &x)| self.component(i, x))
            .sum()
    }

    fn dim(&self) -> Option<usize> {
        Some(self.mean.len())
    }

    fn has_marginals(&self) -> bool {
        true
    }

    fn marginal_log_prob(&self, index: usize, value: f64) -> Option<f64> {
        (index < self.mean.len()).then(|| self.component(index, value))
    }
}

/// A Gaussian with full covariance in any dimension, factorized once at construction.
#[derive(Debug, Clone)]
pub struct MultivariateGaussian {
    mean: na::DVector<f64>,
    chol: na::Cholesky<f64, na::Dyn>,
    log_det: f64,
}

impl MultivariateGaussian {
    pub fn new(mean: Vec<f64>, cov: &Array2<f64>) -> Result<Self> {
        let d = mean.len();
        if cov.shape() != [d, d] {
            return Err(McmcError::Configuration(format!(
                "covariance must be {d}x{d}, got {:?}",
                cov.shape()
            )));
        }
        let cov = na::DMatrix::from_fn(d, d, |i, j| cov[(i, j)]);
        let chol = na::Cholesky::new(cov).ok_or_else(|| {
            McmcError::Configuration("covariance is not positive definite".to_string())
        })?;
        let log_det = 2.0 * chol.l().diagonal().iter().map(|v| v.ln()).sum::<f64>();
        Ok(Self {
            mean: na::DVector::from_vec(mean),
            chol,
            log_det,
        })
    }

    pub fn mean(&self) -> &[f64] {
        self.mean.as_slice()
    }

    /// Draws an exact sample, used as a reference for sampler output.
    pub fn sample(&self, rng: &mut SmallRng) -> Vec<f64> {
        let z = na::DVector::from_fn(self.mean.len(), |_, _| rng.sample::<f64, _>(StandardNormal));
        (&self.mean + self.chol.l() * z).as_slice().to_vec()
    }
}

impl Normalized for MultivariateGaussian {
    fn log_prob(&self, theta: &[f64]) -> f64 {
        let d = self.mean.len() as f64;
        -0.5 * d * (2.0 * PI).ln() - 0.5 * self.log_det + self.unnorm_log_prob(theta)
    }
}

impl Target for MultivariateGaussian {
    fn unnorm_log_prob(&self, theta: &[f64]) -> f64 {
        let diff = na::DVector::from_column_slice(theta) - &self.mean;
        let y = self
            .chol
            .l_dirty()
            .solve_lower_triangular(&diff)
            .unwrap_or(diff);
        -0.5 * y.norm_squared()
    }

    fn dim(&self) -> Option<usize> {
        Some(self.mean.len())
    }
}

/// The banana-shaped 2D Rosenbrock density `-((a - x)² + b (y - x²)²)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rosenbrock2D {
    pub a: f64,
    pub b: f64,
}

impl Target for Rosenbrock2D {
    fn unnorm_log_prob(&self, theta: &[f64]) -> f64 {
        let (x, y) = (theta[0], theta[1]);
        -((self.a - x).powi(2) + self.b * (y - x * x).powi(2))
    }

    fn dim(&self) -> Option<usize> {
        Some(2)
    }
}

#[cfg(test)]
mod distributions_tests {
    use super::*;
    use ndarray::{arr1, arr2, array};
    use rand::SeedableRng;

    /**
    Turns the unnormalized log-density of an isotropic Gaussian into a probability by
    applying the normalizing constant.
    */
    fn normalize_isogauss(x: f64, d: usize, std: f64) -> f64 {
        let log_normalizer = -((d as f64) / 2.0) * ((2.0_f64).ln() + PI.ln() + 2.0 * std.ln());
        (x + log_normalizer).exp()
    }

    #[test]
    fn iso_gauss_unnorm_log_prob_test_1() {
        let distr = DiagonalGaussian::isotropic(1, 1.0);
        let p = normalize_isogauss(distr.unnorm_log_prob(&[1.0]), 1, 1.0);
        let true_p = 0.24197072451914337;
        let diff = (p - true_p).abs();
        assert!(
            diff < 1e-7,
            "Expected diff < 1e-7, got {diff} with p={p} (expected ~{true_p})."
        );
    }

    #[test]
    fn iso_gauss_unnorm_log_prob_test_2() {
        let distr = DiagonalGaussian::isotropic(2, 2.0);
        let p = normalize_isogauss(distr.unnorm_log_prob(&[0.42, 9.6]), 2, 2.0);
        let true_p = 3.864661987252467e-7;
        let diff = (p - true_p).abs();
        assert!(
            diff < 1e-15,
            "Expected diff < 1e-15, got {diff} with p={p} (expected ~{true_p})"
        );
    }

    #[test]
    fn iso_gauss_unnorm_log_prob_test_3() {
        let distr = DiagonalGaussian::isotropic(3, 3.0);
        let p = normalize_isogauss(distr.unnorm_log_prob(&[1.0, 2.0, 3.0]), 3, 3.0);
        let true_p = 0.001080393185560214;
        let diff = (p - true_p).abs();
        assert!(
            diff < 1e-8,
            "Expected diff < 1e-8, got {diff} with p={p} (expected ~{true_p})"
        );
    }

    #[test]
    fn diagonal_marginals_sum_to_joint() {
        let distr = DiagonalGaussian::new(vec![1.0, -2.0], vec![0.5, 3.0]).unwrap();
        let x = [0.3, 1.7];
        let marginal_sum: f64 = (0..2)
            .map(|i| distr.marginal_log_prob(i, x[i]).unwrap())
            .sum();
        assert!((marginal_sum - distr.unnorm_log_prob(&x)).abs() < 1e-12);
        assert_eq!(distr.marginal_log_prob(2, 0.0), None);
    }

    #[test]
    fn diagonal_rejects_bad_std() {
        assert!(DiagonalGaussian::new(vec![0.0], vec![0.0]).is_err());
        assert!(DiagonalGaussian::new(vec![0.0, 1.0], vec![1.0]).is_err());
    }

    #[test]
    fn gaussian_2d_matches_multivariate() {
        let cov = arr2(&[[4.0, 2.0], [2.0, 3.0]]);
        let g2 = Gaussian2D {
            mean: arr1(&[0.0, 1.0]),
            cov: cov.clone(),
        };
        let mv = MultivariateGaussian::new(vec![0.0, 1.0], &cov).unwrap();
        for x in [[0.0, 0.0], [1.5, -2.0], [-3.0, 4.0]] {
            assert!((g2.log_prob(&x) - mv.log_prob(&x)).abs() < 1e-10);
            assert!((g2.unnorm_log_prob(&x) - mv.unnorm_log_prob(&x)).abs() < 1e-10);
        }
    }

    #[test]
    fn multivariate_rejects_indefinite_covariance() {
        let cov = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(matches!(
            MultivariateGaussian::new(vec![0.0, 0.0], &cov),
            Err(McmcError::Configuration(_))
        ));
    }

    #[test]
    fn multivariate_samples_have_right_dimension() {
        let mv = MultivariateGaussian::new(vec![1.0, 2.0, 3.0], &Array2::eye(3)).unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        assert_eq!(mv.sample(&mut rng).len(), 3);
    }

    #[test]
    fn log_density_passes_extra_args() {
        let target = LogDensity::with_args(2.0_f64, |x: &[f64], scale: &f64| -x[0].abs() / scale);
        assert_eq!(target.unnorm_log_prob(&[4.0]), -2.0);
        assert_eq!(*target.args(), 2.0);
        assert!(!target.has_marginals());
        assert_eq!(Target::dim(&target), None);
    }

    #[test]
    fn log_density_from_pdf_clamps_zero() {
        let target = LogDensity::from_pdf(|_: &[f64]| 0.0);
        assert_eq!(target.unnorm_log_prob(&[0.0]), MIN_DENSITY.ln());
        let target = LogDensity::new(|_: &[f64]| 0.0)
            .add_marginal_pdf(|v: f64, _: &()| if v > 0.0 { 1.0 } else { 0.0 });
        assert_eq!(target.marginal_log_prob(0, 1.0), Some(0.0));
        assert_eq!(target.marginal_log_prob(0, -1.0), Some(MIN_DENSITY.ln()));
        assert_eq!(target.n_marginals(), 1);
        assert_eq!(Target::dim(&target), Some(1));
    }

    #[test]
    fn batch_evaluation_matches_single() {
        let target = Rosenbrock2D { a: 1.0, b: 100.0 };
        let thetas = arr2(&[[1.0, 1.0], [0.0, 0.0], [2.0, 3.0]]);
        let batch = target.unnorm_log_prob_batch(thetas.view());
        assert_eq!(batch, vec![0.0, -1.0, -101.0]);
        // Column-major rows go through the copying path.
        let transposed = thetas.t().to_owned();
        let batch_t = target.unnorm_log_prob_batch(transposed.t());
        assert_eq!(batch_t, batch);
    }
}
