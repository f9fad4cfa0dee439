/*!
# Metropolis–Hastings

Every chain draws one full-vector candidate per iteration from a proposal kernel and accepts
it with probability

\[
\min\left(1, \frac{p(x') \, q(x \mid x')}{p(x) \, q(x' \mid x)}\right),
\]

computed in log-space. For symmetric kernels the proposal term is omitted. Chains do not
interact, so each generation runs fully in parallel over chains.

## Example Usage

```rust
use ndarray::{arr1, arr2};
use uq_mcmc::config::RunConfig;
use uq_mcmc::core::Sampler;
use uq_mcmc::distributions::Gaussian2D;
use uq_mcmc::metropolis_hastings::MetropolisHastings;
use uq_mcmc::proposals::IsotropicGaussian;

let target = Gaussian2D {
    mean: arr1(&[0.0, 0.0]),
    cov: arr2(&[[1.0, 0.0], [0.0, 1.0]]),
};
let mh = MetropolisHastings::new(IsotropicGaussian::new(1.0));
let mut sampler = Sampler::new(target, mh, vec![vec![0.0, 0.0]; 4], RunConfig::new(2).n_burn(100))
    .unwrap();
sampler.run(1000).unwrap();
assert_eq!(sampler.samples().unwrap().shape(), &[1000, 4, 2]);
```
*/

use rayon::prelude::*;

use crate::core::{metropolis_update, Algorithm, RunContext};
use crate::distributions::{Proposal, Target};
use crate::errors::Result;
use crate::evaluator::Evaluator;
use crate::proposals::{check_capabilities, hastings_correction};

#[derive(Debug, Clone, PartialEq)]
pub struct MetropolisHastings<P> {
    /// The proposal distribution used to generate candidate states.
    pub proposal: P,
}

impl<P: Proposal> MetropolisHastings<P> {
    pub fn new(proposal: P) -> Self {
        Self { proposal }
    }
}

impl<P: Proposal> Algorithm for MetropolisHastings<P> {
    fn name(&self) -> &'static str {
        "MH"
    }

    fn validate<T: Target + ?Sized + 'static>(
        &self,
        evaluator: &Evaluator<T>,
        initial_positions: &[Vec<f64>],
    ) -> Result<()> {
        check_capabilities(&self.proposal, evaluator.dim(), &initial_positions[0])
    }

    fn advance<T: Target + ?Sized + 'static>(
        &mut self,
        ctx: &mut RunContext,
        evaluator: &Evaluator<T>,
    ) {
        let proposal = &self.proposal;
        let (chains, rngs) = ctx.split_mut();
        chains
            .par_iter_mut()
            .zip(rngs.par_iter_mut())
            .for_each(|(chain, rng)| {
                let candidate = proposal.sample(chain.position(), rng);
                let evaluated = evaluator.evaluate(&candidate);
                let correction = hastings_correction(proposal, chain.position(), &candidate);
                metropolis_update(chain, rng, candidate, evaluated, correction);
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::core::{init_det, RunStatus, Sampler};
    use crate::distributions::{DiagonalGaussian, Gaussian2D, LogDensity};
    use crate::errors::McmcError;
    use crate::proposals::{CustomProposal, GaussianRandomWalk, IndependentGaussian, IsotropicGaussian};
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, Axis};
    use ndarray_stats::CorrelationExt;
    use rand::rngs::SmallRng;

    /// Common test harness for checking that samples from a 2D Gaussian match
    /// the true mean and covariance within tolerance.
    fn run_gaussian_2d_test(sample_size: usize, n_chains: usize, use_progress: bool) {
        const BURNIN: usize = 2_000;
        const SEED: u64 = 42;

        let target = Gaussian2D {
            mean: arr1(&[0.0, 1.0]),
            cov: arr2(&[[4.0, 2.0], [2.0, 3.0]]),
        };
        let mh = MetropolisHastings::new(IsotropicGaussian::new(1.0));
        let config = RunConfig::new(2).n_burn(BURNIN).seed(SEED);
        let mut sampler =
            Sampler::new(target.clone(), mh, vec![vec![0.0, 0.0]; n_chains], config).unwrap();

        let outcome = if use_progress {
            sampler.run_progress(sample_size / n_chains).unwrap()
        } else {
            sampler.run(sample_size / n_chains).unwrap()
        };
        assert_eq!(outcome.status, RunStatus::Complete);

        let stacked = sampler.flat_samples().unwrap();
        assert_eq!(stacked.shape(), &[sample_size, 2]);
        let mean = stacked.mean_axis(Axis(0)).unwrap();
        let cov = stacked.t().cov(1.0).unwrap();
        assert_abs_diff_eq!(mean, target.mean, epsilon = 0.3);
        assert_abs_diff_eq!(cov, target.cov, epsilon = 0.5);
    }

    #[test]
    fn test_single_1_chain() {
        run_gaussian_2d_test(20_000, 1, false);
    }

    #[test]
    fn test_4_chains() {
        run_gaussian_2d_test(40_000, 4, false);
    }

    #[test]
    fn test_progress_4_chains() {
        run_gaussian_2d_test(40_000, 4, true);
    }

    #[test]
    #[ignore = "Slow test: run only when explicitly requested"]
    fn test_16_chains_long() {
        run_gaussian_2d_test(1_600_000, 16, false);
    }

    #[test]
    fn standard_normal_scenario() {
        let config = RunConfig::new(1).n_burn(100).jump(1).seed(42);
        let mh = MetropolisHastings::new(GaussianRandomWalk::from_scales(&[1.0]).unwrap());
        let mut sampler =
            Sampler::new(DiagonalGaussian::isotropic(1, 1.0), mh, vec![vec![0.0]], config).unwrap();
        sampler.run(1000).unwrap();

        let samples = sampler.flat_samples().unwrap();
        let x = samples.column(0);
        let mean = x.mean().unwrap();
        let var = x.var(1.0);
        // A unit-scale random walk on N(0, 1) accepts with probability (2/π)·atan(2) ≈ 0.705.
        let rate = sampler.acceptance_rate();
        assert!((0.6..=0.8).contains(&rate), "acceptance rate {rate}");
        assert!(mean.abs() < 0.1, "mean {mean}");
        assert!((var - 1.0).abs() < 0.2, "variance {var}");
        assert_eq!(sampler.chains()[0].evaluations(), 1100);
    }

    #[test]
    fn asymmetric_proposal_gets_hastings_correction() {
        // An independence sampler with a shifted, wide kernel is only correct with the
        // proposal term included.
        let target = DiagonalGaussian::new(vec![1.0], vec![1.0]).unwrap();
        let mh = MetropolisHastings::new(IndependentGaussian::new(vec![-1.0], 3.0));
        let config = RunConfig::new(1).n_burn(500).seed(11);
        let mut sampler = Sampler::new(target, mh, init_det(4, 1, 3), config).unwrap();
        sampler.run(10_000).unwrap();
        let samples = sampler.flat_samples().unwrap();
        let mean = samples.column(0).mean().unwrap();
        let var = samples.column(0).var(1.0);
        assert_abs_diff_eq!(mean, 1.0, epsilon = 0.1);
        assert_abs_diff_eq!(var, 1.0, epsilon = 0.15);
    }

    #[test]
    fn asymmetric_proposal_without_density_is_rejected() {
        let proposal = CustomProposal::asymmetric(|x: &[f64], _: &mut SmallRng| x.to_vec());
        let res = Sampler::new(
            LogDensity::new(|_: &[f64]| 0.0),
            MetropolisHastings::new(proposal),
            vec![vec![0.0]],
            RunConfig::new(1),
        );
        assert!(matches!(res, Err(McmcError::Configuration(_))));
    }

    #[test]
    fn proposal_dimension_must_match() {
        let res = Sampler::new(
            DiagonalGaussian::isotropic(3, 1.0),
            MetropolisHastings::new(GaussianRandomWalk::from_scales(&[1.0, 1.0]).unwrap()),
            vec![vec![0.0; 3]],
            RunConfig::new(3),
        );
        assert!(matches!(res, Err(McmcError::Configuration(_))));
    }
}
