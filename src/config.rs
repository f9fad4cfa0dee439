//! Run configuration shared by every sampler variant.
//!
//! ```rust
//! use std::time::Duration;
//! use uq_mcmc::config::RunConfig;
//!
//! let config = RunConfig::new(2)
//!     .n_burn(500)
//!     .jump(5)
//!     .seed(42)
//!     .timeout(Duration::from_secs(1));
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::errors::{McmcError, Result};

/// Parameters that control burn-in, thinning, termination and resources of a run.
///
/// The number of chains is not part of the configuration: it is the number of initial
/// positions handed to [`Sampler::new`](crate::core::Sampler::new).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RunConfig {
    /// Dimension of the state space.
    pub dim: usize,
    /// Number of leading iterations whose states are never recorded.
    pub n_burn: usize,
    /// Record one sample every `jump` iterations after burn-in.
    pub jump: usize,
    /// Global seed; chain `i` is seeded with `seed + i`.
    pub seed: Option<u64>,
    /// Upper bound on the iterations performed by a single call to `run`.
    pub max_iterations: Option<usize>,
    /// Wall-clock limit for a single target evaluation.
    ///
    /// Each timed evaluation runs on a freshly spawned thread. A thread whose evaluation
    /// times out cannot be stopped and keeps running until the target returns, so a target
    /// that hangs leaks up to one thread per chain and iteration. The number of abandoned
    /// evaluations is reported in [`Diagnostics::abandoned_evaluations`].
    ///
    /// [`Diagnostics::abandoned_evaluations`]: crate::stats::Diagnostics::abandoned_evaluations
    pub timeout: Option<Duration>,
    /// Size of a dedicated worker pool; the global rayon pool is used otherwise.
    pub threads: Option<usize>,
    /// Per-chain acceptance rates outside this band produce a convergence warning.
    pub acceptance_band: (f64, f64),
    /// R-hat values above this threshold produce a convergence warning.
    pub rhat_threshold: f64,
}

impl RunConfig {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            n_burn: 0,
            jump: 1,
            seed: None,
            max_iterations: None,
            timeout: None,
            threads: None,
            acceptance_band: (0.05, 0.8),
            rhat_threshold: 1.1,
        }
    }

    pub fn n_burn(mut self, n_burn: usize) -> Self {
        self.n_burn = n_burn;
        self
    }

    pub fn jump(mut self, jump: usize) -> Self {
        self.jump = jump;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn acceptance_band(mut self, low: f64, high: f64) -> Self {
        self.acceptance_band = (low, high);
        self
    }

    pub fn rhat_threshold(mut self, threshold: f64) -> Self {
        self.rhat_threshold = threshold;
        self
    }

    /// Checks the configuration for values no run could honour.
    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(McmcError::Configuration(
                "dimension must be at least 1".to_string(),
            ));
        }
        if self.jump == 0 {
            return Err(McmcError::Configuration(
                "jump (thinning interval) must be at least 1".to_string(),
            ));
        }
        if self.threads == Some(0) {
            return Err(McmcError::Configuration(
                "thread count must be at least 1".to_string(),
            ));
        }
        if self.max_iterations == Some(0) {
            return Err(McmcError::Configuration(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        let (low, high) = self.acceptance_band;
        if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low >= high {
            return Err(McmcError::Configuration(format!(
                "acceptance band must satisfy 0 <= low < high <= 1, got ({low}, {high})"
            )));
        }
        if self.rhat_threshold.is_nan() || self.rhat_threshold < 1.0 {
            return Err(McmcError::Configuration(format!(
                "R-hat threshold must be at least 1, got {}",
                self.rhat_threshold
            )));
        }
        Ok(())
    }
}
