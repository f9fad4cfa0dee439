//! Multi-chain Markov Chain Monte Carlo for uncertainty quantification.
//!
//! A [`core::Sampler`] drives several chains of one [`core::Algorithm`] against a
//! [`distributions::Target`] log-density, handling burn-in, thinning, continuation,
//! cancellation and convergence bookkeeping. Five variants are provided:
//!
//! - [`metropolis_hastings::MetropolisHastings`]
//! - [`modified_metropolis_hastings::ModifiedMetropolisHastings`] (component-wise)
//! - [`stretch::Stretch`] (affine-invariant ensemble)
//! - [`dram::Dram`] (delayed rejection, adaptive covariance)
//! - [`dream::Dream`] (differential evolution, adaptive crossover)
//!
//! ```rust
//! use uq_mcmc::config::RunConfig;
//! use uq_mcmc::core::{init_det, Sampler};
//! use uq_mcmc::distributions::Rosenbrock2D;
//! use uq_mcmc::dream::Dream;
//!
//! let target = Rosenbrock2D { a: 1.0, b: 100.0 };
//! let config = RunConfig::new(2).n_burn(500).jump(2).seed(42);
//! let mut sampler = Sampler::new(target, Dream::new(), init_det(8, 2, 42), config).unwrap();
//! let outcome = sampler.run(250).unwrap();
//! assert_eq!(outcome.iterations, 1_000);
//! assert_eq!(sampler.samples().unwrap().shape(), &[250, 8, 2]);
//! ```

pub mod config;
pub mod core;
pub mod distributions;
pub mod dram;
pub mod dream;
pub mod errors;
pub mod evaluator;
pub mod metropolis_hastings;
pub mod modified_metropolis_hastings;
pub mod proposals;
pub mod stats;
pub mod store;
pub mod stretch;
