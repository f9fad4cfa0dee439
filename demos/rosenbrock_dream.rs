//! Explores the banana-shaped Rosenbrock density with DREAM and reports convergence.
//!
//! Run with `RUST_LOG=debug` to see adaptation and outlier handling.

use std::error::Error;

use ndarray::Axis;
use uq_mcmc::config::RunConfig;
use uq_mcmc::core::{init_det, RunStatus, Sampler};
use uq_mcmc::distributions::Rosenbrock2D;
use uq_mcmc::dream::Dream;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let target = Rosenbrock2D { a: 1.0, b: 20.0 };
    let config = RunConfig::new(2)
        .n_burn(5_000)
        .jump(5)
        .seed(42)
        .max_iterations(200_000);
    let mut sampler = Sampler::new(target, Dream::new(), init_det(10, 2, 42), config)?;

    let outcome = sampler.run_progress(5_000)?;
    if let RunStatus::Incomplete { collected, reason, .. } = outcome.status {
        println!("Stopped early ({reason:?}) with {collected} samples per chain");
    }

    let samples = sampler.flat_samples()?;
    let mean = samples.mean_axis(Axis(0)).ok_or("no samples")?;
    println!("Pooled mean: ({:.3}, {:.3})", mean[0], mean[1]);
    println!(
        "Crossover probabilities: {:?}",
        sampler.algorithm().crossover_probabilities()
    );
    println!("Relocated chains: {}", sampler.algorithm().relocations());

    let diagnostics = outcome.diagnostics;
    println!("Per-chain acceptance: {:.3?}", diagnostics.acceptance_rates);
    match &diagnostics.rhat {
        Some(rhat) => println!("R-hat: {:.4?}", rhat),
        None => println!("R-hat unavailable"),
    }
    for warning in &diagnostics.warnings {
        println!("warning: {warning}");
    }
    Ok(())
}
