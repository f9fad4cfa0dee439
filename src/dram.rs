/*!
# Delayed Rejection Adaptive Metropolis (DRAM)

A Gaussian random walk whose covariance is learned from the chains, combined with one
delayed-rejection stage.

- **Adaptive Metropolis**: the mean and covariance of all chains' states are accumulated
  every iteration. Every `adaptation_interval` iterations the proposal covariance becomes
  `s_p Σ + ε I` with `s_p = 2.38² / d` by default.
- **Delayed rejection**: when the first candidate `y₁ ~ N(x, C)` is rejected, a second one
  `y₂ ~ N(x, γ² C)` is tried and accepted with the Tierney–Mira probability, which keeps
  the chain reversible with respect to the target.

Each iteration is a single decision per chain and costs one or two target evaluations.

```rust
use ndarray::arr2;
use uq_mcmc::config::RunConfig;
use uq_mcmc::core::{init_det, Sampler};
use uq_mcmc::distributions::MultivariateGaussian;
use uq_mcmc::dram::Dram;

let target = MultivariateGaussian::new(vec![0.0, 0.0], &arr2(&[[1.0, 0.9], [0.9, 1.0]])).unwrap();
let dram = Dram::new(0.1).adaptation_interval(50);
let mut sampler = Sampler::new(target, dram, init_det(2, 2, 0), RunConfig::new(2).seed(3)).unwrap();
sampler.run(500).unwrap();
assert_eq!(sampler.algorithm().adaptations(), 10);
```
*/

use log::{debug, trace, warn};
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::Rng;
use rayon::prelude::*;

use crate::core::{Algorithm, ChainState, RunContext};
use crate::distributions::{Proposal, Target, MIN_DENSITY};
use crate::errors::{McmcError, Result};
use crate::evaluator::Evaluator;
use crate::proposals::GaussianRandomWalk;
use crate::stats::RunningMoments;

#[derive(Debug, Clone, PartialEq)]
enum InitialCovariance {
    Isotropic(f64),
    Scales(Vec<f64>),
    Full(Array2<f64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dram {
    initial: InitialCovariance,
    adaptation_interval: usize,
    scale_factor: Option<f64>,
    dr_scale: f64,
    regularization: f64,
    // First- and second-stage kernels, built once the dimension is known.
    stages: Option<(GaussianRandomWalk, GaussianRandomWalk)>,
    moments: Option<RunningMoments>,
    adaptations: usize,
}

impl Dram {
    /// Starts from an isotropic proposal with standard deviation `std`.
    pub fn new(std: f64) -> Self {
        Self::from_initial(InitialCovariance::Isotropic(std))
    }

    /// Starts from a diagonal proposal with one standard deviation per dimension.
    pub fn with_scales(scales: Vec<f64>) -> Self {
        Self::from_initial(InitialCovariance::Scales(scales))
    }

    /// Starts from a full proposal covariance.
    pub fn with_covariance(cov: Array2<f64>) -> Self {
        Self::from_initial(InitialCovariance::Full(cov))
    }

    fn from_initial(initial: InitialCovariance) -> Self {
        Self {
            initial,
            adaptation_interval: 100,
            scale_factor: None,
            dr_scale: 0.2,
            regularization: 1e-6,
            stages: None,
            moments: None,
            adaptations: 0,
        }
    }

    pub fn adaptation_interval(mut self, iterations: usize) -> Self {
        self.adaptation_interval = iterations;
        self
    }

    /// Overrides `s_p`, which defaults to `2.38² / d`.
    pub fn scale_factor(mut self, scale_factor: f64) -> Self {
        self.scale_factor = Some(scale_factor);
        self
    }

    /// Standard-deviation multiplier `γ` of the delayed-rejection stage.
    pub fn dr_scale(mut self, dr_scale: f64) -> Self {
        self.dr_scale = dr_scale;
        self
    }

    pub fn regularization(mut self, epsilon: f64) -> Self {
        self.regularization = epsilon;
        self
    }

    /// Number of covariance updates applied so far.
    pub fn adaptations(&self) -> usize {
        self.adaptations
    }

    /// Current first-stage proposal covariance.
    pub fn proposal_covariance(&self) -> Option<Array2<f64>> {
        self.stages.as_ref().map(|(first, _)| first.covariance())
    }

    fn initial_walk(&self, dim: usize) -> Result<GaussianRandomWalk> {
        let walk = match &self.initial {
            InitialCovariance::Isotropic(std) => GaussianRandomWalk::from_scales(&vec![*std; dim]),
            InitialCovariance::Scales(scales) => GaussianRandomWalk::from_scales(scales),
            InitialCovariance::Full(cov) => GaussianRandomWalk::from_covariance(cov),
        }
        .map_err(|err| McmcError::Configuration(format!("initial DRAM proposal: {err}")))?;
        match walk.dim() {
            Some(d) if d != dim => Err(McmcError::Configuration(format!(
                "initial DRAM proposal has {d} dimensions but the sampler uses {dim}"
            ))),
            _ => Ok(walk),
        }
    }

    fn adapt(&mut self, dim: usize) {
        let Some(cov) = self.moments.as_ref().and_then(RunningMoments::covariance) else {
            return;
        };
        let sp = self.scale_factor.unwrap_or(2.38 * 2.38 / dim as f64);
        let proposal_cov = cov * sp + Array2::<f64>::eye(dim) * self.regularization;
        match GaussianRandomWalk::from_covariance(&proposal_cov) {
            Ok(first) => {
                let second = first.scaled(self.dr_scale);
                self.stages = Some((first, second));
                self.adaptations += 1;
                debug!("DRAM adaptation {}: proposal covariance updated", self.adaptations);
            }
            Err(err) => warn!("DRAM adaptation skipped, keeping previous covariance: {err}"),
        }
    }
}

fn first_stage_probability(log_ratio: f64) -> f64 {
    if log_ratio.is_nan() {
        0.0
    } else {
        log_ratio.min(0.0).exp()
    }
}

fn delayed_rejection_step<T: Target + ?Sized + 'static>(
    chain: &mut ChainState,
    rng: &mut SmallRng,
    first: &GaussianRandomWalk,
    second: &GaussianRandomWalk,
    evaluator: &Evaluator<T>,
) {
    let current = chain.position().to_vec();
    let l0 = chain.log_target();

    let y1 = first.sample(&current, rng);
    let e1 = evaluator.evaluate(&y1);
    chain.record_evaluation(e1.is_ok());
    let u1: f64 = rng.gen();
    let l1 = e1.unwrap_or_else(|err| {
        trace!("first-stage candidate failed: {err}");
        f64::NEG_INFINITY
    });
    if l1 - l0 > u1.ln() {
        chain.accept(y1, l1);
        return;
    }

    let y2 = second.sample(&current, rng);
    let e2 = evaluator.evaluate(&y2);
    chain.record_evaluation(e2.is_ok());
    let u2: f64 = rng.gen();
    let l2 = match e2 {
        Ok(l2) => l2,
        Err(err) => {
            trace!("second-stage candidate failed: {err}");
            chain.reject();
            return;
        }
    };
    let log_q = match (first.log_prob(&y2, &y1), first.log_prob(&current, &y1)) {
        (Some(back), Some(fwd)) => back - fwd,
        _ => f64::NAN,
    };
    let back = first_stage_probability(l1 - l2);
    let fwd = first_stage_probability(l1 - l0);
    let log_alpha2 = l2 - l0 + log_q + (1.0 - back).max(MIN_DENSITY).ln()
        - (1.0 - fwd).max(MIN_DENSITY).ln();
    if log_alpha2 > u2.ln() {
        chain.accept(y2, l2);
    } else {
        chain.reject();
    }
}

impl Algorithm for Dram {
    fn name(&self) -> &'static str {
        "DRAM"
    }

    fn validate<T: Target + ?Sized + 'static>(
        &self,
        evaluator: &Evaluator<T>,
        _initial_positions: &[Vec<f64>],
    ) -> Result<()> {
        if self.adaptation_interval == 0 {
            return Err(McmcError::Configuration(
                "DRAM adaptation interval must be at least 1".to_string(),
            ));
        }
        if self.dr_scale.is_nan() || self.dr_scale <= 0.0 {
            return Err(McmcError::Configuration(format!(
                "delayed-rejection scale must be positive, got {}",
                self.dr_scale
            )));
        }
        if self.regularization.is_nan() || self.regularization < 0.0 {
            return Err(McmcError::Configuration(format!(
                "covariance regularization must be non-negative, got {}",
                self.regularization
            )));
        }
        if let Some(sp) = self.scale_factor {
            if sp.is_nan() || sp <= 0.0 {
                return Err(McmcError::Configuration(format!(
                    "DRAM scale factor must be positive, got {sp}"
                )));
            }
        }
        self.initial_walk(evaluator.dim()).map(|_| ())
    }

    fn initialize<T: Target + ?Sized + 'static>(
        &mut self,
        evaluator: &Evaluator<T>,
        _ctx: &mut RunContext,
    ) -> Result<()> {
        let first = self.initial_walk(evaluator.dim())?;
        let second = first.scaled(self.dr_scale);
        self.stages = Some((first, second));
        self.moments = Some(RunningMoments::new(evaluator.dim()));
        self.adaptations = 0;
        Ok(())
    }

    fn advance<T: Target + ?Sized + 'static>(
        &mut self,
        ctx: &mut RunContext,
        evaluator: &Evaluator<T>,
    ) {
        let Some((first, second)) = self.stages.as_ref() else {
            return;
        };
        let (chains, rngs) = ctx.split_mut();
        chains
            .par_iter_mut()
            .zip(rngs.par_iter_mut())
            .for_each(|(chain, rng)| delayed_rejection_step(chain, rng, first, second, evaluator));

        if let Some(moments) = self.moments.as_mut() {
            for chain in ctx.chains() {
                moments.update(chain.position());
            }
        }
        if (ctx.iteration() + 1) % self.adaptation_interval == 0 {
            self.adapt(ctx.dim());
        }
    }
}
