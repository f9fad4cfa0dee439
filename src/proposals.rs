/*!
Built-in proposal kernels and the capability checks the samplers run on them.

Every kernel draws its randomness from the chain's own [`SmallRng`], so a chain seeded with
`seed + i` replays the same stream no matter how chains are scheduled on threads.

# Examples

```rust
use rand::{rngs::SmallRng, SeedableRng};
use uq_mcmc::distributions::Proposal;
use uq_mcmc::proposals::{GaussianRandomWalk, UniformRandomWalk};

let mut rng = SmallRng::seed_from_u64(42);
let walk = GaussianRandomWalk::from_scales(&[1.0, 0.1]).unwrap();
let candidate = walk.sample(&[0.0, 0.0], &mut rng);
assert_eq!(candidate.len(), 2);
assert!(walk.is_symmetric());

let box_walk = UniformRandomWalk::new(2.0);
let candidate = box_walk.sample(&[5.0], &mut rng);
assert!((candidate[0] - 5.0).abs() <= 1.0);
```
*/

use nalgebra as na;
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

use crate::distributions::Proposal;
use crate::errors::{McmcError, Result};

impl<P: Proposal + ?Sized> Proposal for Box<P> {
    fn sample(&self, current: &[f64], rng: &mut SmallRng) -> Vec<f64> {
        (**self).sample(current, rng)
    }

    fn log_prob(&self, from: &[f64], to: &[f64]) -> Option<f64> {
        (**self).log_prob(from, to)
    }

    fn is_symmetric(&self) -> bool {
        (**self).is_symmetric()
    }

    fn dim(&self) -> Option<usize> {
        (**self).dim()
    }
}

/// Verifies once, before any iteration, that a kernel can be used on `dim`-dimensional
/// states: its declared dimension must match, and an asymmetric kernel must provide a
/// transition log-density.
pub fn check_capabilities<P: Proposal + ?Sized>(
    proposal: &P,
    dim: usize,
    probe: &[f64],
) -> Result<()> {
    if let Some(d) = proposal.dim() {
        if d != dim {
            return Err(McmcError::Configuration(format!(
                "proposal is defined on {d} dimensions but the sampler uses {dim}"
            )));
        }
    }
    if !proposal.is_symmetric() && proposal.log_prob(probe, probe).is_none() {
        return Err(McmcError::Configuration(
            "asymmetric proposal must provide a transition log-density".to_string(),
        ));
    }
    Ok(())
}

/// `log q(current | candidate) - log q(candidate | current)`, zero for symmetric kernels.
pub fn hastings_correction<P: Proposal + ?Sized>(
    proposal: &P,
    current: &[f64],
    candidate: &[f64],
) -> f64 {
    if proposal.is_symmetric() {
        return 0.0;
    }
    match (
        proposal.log_prob(candidate, current),
        proposal.log_prob(current, candidate),
    ) {
        (Some(backward), Some(forward)) => backward - forward,
        _ => f64::NAN,
    }
}

/// Adds independent `N(0, std²)` noise to every coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IsotropicGaussian {
    pub std: f64,
}

impl IsotropicGaussian {
    pub fn new(std: f64) -> Self {
        Self { std }
    }
}

impl Proposal for IsotropicGaussian {
    fn sample(&self, current: &[f64], rng: &mut SmallRng) -> Vec<f64> {
        current
            .iter()
            .map(|x| x + self.std * rng.sample::<f64, _>(StandardNormal))
            .collect()
    }

    fn log_prob(&self, from: &[f64], to: &[f64]) -> Option<f64> {
        let var = self.std * self.std;
        let d = from.len() as f64;
        let sq: f64 = from
            .iter()
            .zip(to)
            .map(|(f, t)| (t - f) * (t - f))
            .sum();
        Some(-sq / (2.0 * var) - 0.5 * d * (2.0 * PI * var).ln())
    }

    fn is_symmetric(&self) -> bool {
        true
    }
}

/**
Gaussian random walk `N(x, L Lᵀ)` with a lower-triangular scale factor `L`.

Built either from per-dimension scales (diagonal `L`) or from a full covariance, which is
factorized with a Cholesky decomposition.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianRandomWalk {
    scale: na::DMatrix<f64>,
    log_det_scale: f64,
}

impl GaussianRandomWalk {
    pub fn from_scales(scales: &[f64]) -> Result<Self> {
        if scales.is_empty() || scales.iter().any(|s| s.is_nan() || *s <= 0.0) {
            return Err(McmcError::Configuration(
                "proposal scales must be positive".to_string(),
            ));
        }
        let scale = na::DMatrix::from_diagonal(&na::DVector::from_column_slice(scales));
        Ok(Self::from_factor(scale))
    }

    pub fn from_covariance(cov: &Array2<f64>) -> Result<Self> {
        let d = cov.nrows();
        if d == 0 || cov.ncols() != d {
            return Err(McmcError::Configuration(format!(
                "proposal covariance must be square, got {:?}",
                cov.shape()
            )));
        }
        let cov = na::DMatrix::from_fn(d, d, |i, j| cov[(i, j)]);
        let chol = na::Cholesky::new(cov).ok_or_else(|| {
            McmcError::Numerical("proposal covariance is not positive definite".to_string())
        })?;
        Ok(Self::from_factor(chol.l()))
    }

    fn from_factor(scale: na::DMatrix<f64>) -> Self {
        let log_det_scale = scale.diagonal().iter().map(|v| v.ln()).sum();
        Self {
            scale,
            log_det_scale,
        }
    }

    /// The same walk with every step multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self::from_factor(&self.scale * factor)
    }

    /// `L Lᵀ` as an ndarray matrix.
    pub fn covariance(&self) -> Array2<f64> {
        let cov = &self.scale * self.scale.transpose();
        Array2::from_shape_fn((cov.nrows(), cov.ncols()), |(i, j)| cov[(i, j)])
    }
}

impl Proposal for GaussianRandomWalk {
    fn sample(&self, current: &[f64], rng: &mut SmallRng) -> Vec<f64> {
        let z = na::DVector::from_fn(current.len(), |_, _| {
            rng.sample::<f64, _>(StandardNormal)
        });
        let step = &self.scale * z;
        current.iter().zip(step.iter()).map(|(x, s)| x + s).collect()
    }

    fn log_prob(&self, from: &[f64], to: &[f64]) -> Option<f64> {
        let diff = na::DVector::from_iterator(from.len(), from.iter().zip(to).map(|(f, t)| t - f));
        let y = self.scale.solve_lower_triangular(&diff)?;
        let d = from.len() as f64;
        Some(-0.5 * y.norm_squared() - self.log_det_scale - 0.5 * d * (2.0 * PI).ln())
    }

    fn is_symmetric(&self) -> bool {
        true
    }

    fn dim(&self) -> Option<usize> {
        Some(self.scale.nrows())
    }
}

/// Moves every coordinate uniformly within a box of the given width centred on the state.
#[derive(Debug, Clone, PartialEq)]
pub struct UniformRandomWalk {
    widths: Vec<f64>,
    per_dimension: bool,
}

impl UniformRandomWalk {
    pub fn new(width: f64) -> Self {
        Self {
            widths: vec![width],
            per_dimension: false,
        }
    }

    pub fn per_dimension(widths: Vec<f64>) -> Self {
        Self {
            widths,
            per_dimension: true,
        }
    }

    fn width(&self, i: usize) -> f64 {
        if self.per_dimension {
            self.widths[i]
        } else {
            self.widths[0]
        }
    }
}

impl Proposal for UniformRandomWalk {
    fn sample(&self, current: &[f64], rng: &mut SmallRng) -> Vec<f64> {
        current
            .iter()
            .enumerate()
            .map(|(i, x)| {
                let w = self.width(i);
                x - 0.5 * w + w * rng.gen::<f64>()
            })
            .collect()
    }

    fn log_prob(&self, from: &[f64], to: &[f64]) -> Option<f64> {
        let mut lp = 0.0;
        for (i, (f, t)) in from.iter().zip(to).enumerate() {
            let w = self.width(i);
            if (t - f).abs() > 0.5 * w {
                return Some(f64::NEG_INFINITY);
            }
            lp -= w.ln();
        }
        Some(lp)
    }

    fn is_symmetric(&self) -> bool {
        true
    }

    fn dim(&self) -> Option<usize> {
        self.per_dimension.then_some(self.widths.len())
    }
}

/// Draws candidates from `N(mean, std² I)` regardless of the current state.
#[derive(Debug, Clone, PartialEq)]
pub struct IndependentGaussian {
    pub mean: Vec<f64>,
    pub std: f64,
}

impl IndependentGaussian {
    pub fn new(mean: Vec<f64>, std: f64) -> Self {
        Self { mean, std }
    }
}

impl Proposal for IndependentGaussian {
    fn sample(&self, _current: &[f64], rng: &mut SmallRng) -> Vec<f64> {
        self.mean
            .iter()
            .map(|m| m + self.std * rng.sample::<f64, _>(StandardNormal))
            .collect()
    }

    fn log_prob(&self, _from: &[f64], to: &[f64]) -> Option<f64> {
        let var = self.std * self.std;
        let d = to.len() as f64;
        let sq: f64 = to
            .iter()
            .zip(&self.mean)
            .map(|(t, m)| (t - m) * (t - m))
            .sum();
        Some(-sq / (2.0 * var) - 0.5 * d * (2.0 * PI * var).ln())
    }

    fn is_symmetric(&self) -> bool {
        false
    }

    fn dim(&self) -> Option<usize> {
        Some(self.mean.len())
    }
}

pub type SampleFn = Box<dyn Fn(&[f64], &mut SmallRng) -> Vec<f64> + Send + Sync>;
pub type TransitionLogDensityFn = Box<dyn Fn(&[f64], &[f64]) -> f64 + Send + Sync>;

/**
A kernel assembled from closures.

```rust
use rand::Rng;
use uq_mcmc::proposals::CustomProposal;

// Multiplicative log-normal step: asymmetric, so a log-density is required.
let proposal = CustomProposal::asymmetric(|x: &[f64], rng: &mut rand::rngs::SmallRng| {
    x.iter().map(|v| v * (0.5 * rng.gen::<f64>() - 0.25).exp()).collect()
})
.with_log_density(|from: &[f64], to: &[f64]| {
    from.iter()
        .zip(to)
        .map(|(f, t)| {
            if (t / f).ln().abs() <= 0.25 {
                -(0.5f64).ln() - t.ln()
            } else {
                f64::NEG_INFINITY
            }
        })
        .sum()
});
```
*/
pub struct CustomProposal {
    sampler: SampleFn,
    log_density: Option<TransitionLogDensityFn>,
    symmetric: bool,
    dim: Option<usize>,
}

impl CustomProposal {
    pub fn symmetric<F>(sampler: F) -> Self
    where
        F: Fn(&[f64], &mut SmallRng) -> Vec<f64> + Send + Sync + 'static,
    {
        Self {
            sampler: Box::new(sampler),
            log_density: None,
            symmetric: true,
            dim: None,
        }
    }

    pub fn asymmetric<F>(sampler: F) -> Self
    where
        F: Fn(&[f64], &mut SmallRng) -> Vec<f64> + Send + Sync + 'static,
    {
        Self {
            symmetric: false,
            ..Self::symmetric(sampler)
        }
    }

    /// Attaches `log q(to | from)`.
    pub fn with_log_density<F>(mut self, log_density: F) -> Self
    where
        F: Fn(&[f64], &[f64]) -> f64 + Send + Sync + 'static,
    {
        self.log_density = Some(Box::new(log_density));
        self
    }

    pub fn dim(mut self, dim: usize) -> Self {
        self.dim = Some(dim);
        self
    }
}

impl Proposal for CustomProposal {
    fn sample(&self, current: &[f64], rng: &mut SmallRng) -> Vec<f64> {
        (self.sampler)(current, rng)
    }

    fn log_prob(&self, from: &[f64], to: &[f64]) -> Option<f64> {
        self.log_density.as_ref().map(|f| f(from, to))
    }

    fn is_symmetric(&self) -> bool {
        self.symmetric
    }

    fn dim(&self) -> Option<usize> {
        self.dim
    }
}

impl std::fmt::Debug for CustomProposal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomProposal")
            .field("symmetric", &self.symmetric)
            .field("has_log_density", &self.log_density.is_some())
            .field("dim", &self.dim)
            .finish()
    }
}
