//! Samples a correlated 2D Gaussian with Metropolis–Hastings and prints summary statistics.

use std::error::Error;

use ndarray::{arr2, Axis};
use ndarray_stats::CorrelationExt;
use rand::{thread_rng, Rng};
use uq_mcmc::config::RunConfig;
use uq_mcmc::core::{init_det, Sampler};
use uq_mcmc::distributions::MultivariateGaussian;
use uq_mcmc::metropolis_hastings::MetropolisHastings;
use uq_mcmc::proposals::GaussianRandomWalk;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    const SAMPLE_SIZE: usize = 100_000;
    const BURNIN: usize = 10_000;
    const N_CHAINS: usize = 8;
    let seed: u64 = thread_rng().gen();

    let cov = arr2(&[[2.0, 1.0], [1.0, 2.0]]);
    let target = MultivariateGaussian::new(vec![0.0, 0.0], &cov)?;
    // Proposal shaped like the target, scaled by the usual 2.38 / sqrt(d).
    let proposal = GaussianRandomWalk::from_covariance(&cov)?.scaled(2.38 / 2f64.sqrt());
    let config = RunConfig::new(2).n_burn(BURNIN).seed(seed);
    let mut sampler = Sampler::new(
        target,
        MetropolisHastings::new(proposal),
        init_det(N_CHAINS, 2, seed),
        config,
    )?;

    let outcome = sampler.run_progress(SAMPLE_SIZE / N_CHAINS)?;
    let pooled = sampler.flat_samples()?;
    println!("Generated {} samples in {} iterations", pooled.nrows(), outcome.iterations);

    let mean = pooled.mean_axis(Axis(0)).ok_or("no samples")?;
    let sample_cov = pooled.t().cov(1.0)?;
    println!("Mean after burn-in: ({:.2}, {:.2})", mean[0], mean[1]);
    println!("Covariance:\n{:.2}", sample_cov);
    println!("Acceptance rate: {:.3}", outcome.diagnostics.acceptance_rate);
    if let Some(rhat) = &outcome.diagnostics.rhat {
        println!("R-hat: {:?}", rhat);
    }
    Ok(())
}
