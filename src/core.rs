/*!
# Sampling engine

The [`Sampler`] drives a fixed number of chains in lock-step generations. Each generation is
delegated to an [`Algorithm`] (Metropolis–Hastings, component-wise MH, the stretch move,
DRAM or DREAM), which updates the chains through [`RunContext`] and [`ChainState`]. The engine
owns everything around the generation: seeding one [`SmallRng`] per chain, the burn-in and
thinning policy, termination, the worker pool and the [`SampleStore`].

## Recording policy

Iterations are counted from 1. After iteration `t` every chain's state is recorded when
`t > n_burn` and `(t - n_burn) % jump == 0`. A fresh run that collects `N` samples therefore
performs exactly `n_burn + jump * N` iterations. Continuing a run appends to the store and
does not repeat burn-in.

## Example

```rust
use uq_mcmc::config::RunConfig;
use uq_mcmc::core::{init_det, RunStatus, Sampler};
use uq_mcmc::distributions::DiagonalGaussian;
use uq_mcmc::metropolis_hastings::MetropolisHastings;
use uq_mcmc::proposals::IsotropicGaussian;

let target = DiagonalGaussian::isotropic(2, 1.0);
let algorithm = MetropolisHastings::new(IsotropicGaussian::new(1.0));
let config = RunConfig::new(2).n_burn(100).jump(2).seed(42);
let mut sampler = Sampler::new(target, algorithm, init_det(4, 2, 7), config).unwrap();

let outcome = sampler.run(500).unwrap();
assert_eq!(outcome.status, RunStatus::Complete);
assert_eq!(sampler.samples().unwrap().shape(), &[500, 4, 2]);
assert_eq!(sampler.chains()[0].evaluations(), 100 + 2 * 500);
```
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, trace, warn};
use ndarray::{Array2, Array3};
use rand::prelude::*;
use rand_distr::StandardNormal;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::distributions::Target;
use crate::errors::{McmcError, Result};
use crate::evaluator::Evaluator;
use crate::stats::Diagnostics;
use crate::store::SampleStore;

/// Position, log-target and bookkeeping counters of one chain.
///
/// Counters only change through the methods below, all of which keep
/// `accepted <= proposed`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainState {
    position: Vec<f64>,
    log_target: f64,
    accepted: u64,
    proposed: u64,
    evaluations: u64,
    numerical_failures: u64,
}

impl ChainState {
    pub fn new(position: Vec<f64>, log_target: f64) -> Self {
        Self {
            position,
            log_target,
            accepted: 0,
            proposed: 0,
            evaluations: 0,
            numerical_failures: 0,
        }
    }

    pub fn position(&self) -> &[f64] {
        &self.position
    }

    pub fn log_target(&self) -> f64 {
        self.log_target
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Number of accept/reject decisions taken so far.
    pub fn proposed(&self) -> u64 {
        self.proposed
    }

    /// Number of candidate evaluations of the target (the initial state is not counted).
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    pub fn numerical_failures(&self) -> u64 {
        self.numerical_failures
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }

    /// Moves to `position` as the outcome of one accepted decision.
    pub fn accept(&mut self, position: Vec<f64>, log_target: f64) {
        self.position = position;
        self.log_target = log_target;
        self.proposed += 1;
        self.accepted += 1;
    }

    /// Changes a single coordinate as the outcome of one accepted decision.
    pub fn accept_component(&mut self, index: usize, value: f64, log_target: f64) {
        self.position[index] = value;
        self.log_target = log_target;
        self.proposed += 1;
        self.accepted += 1;
    }

    /// Records one rejected decision; position and log-target are left untouched.
    pub fn reject(&mut self) {
        self.proposed += 1;
    }

    pub fn record_evaluation(&mut self, succeeded: bool) {
        self.evaluations += 1;
        if !succeeded {
            self.numerical_failures += 1;
        }
    }

    /// Counts a failure that did not come from a candidate evaluation.
    pub fn record_failure(&mut self) {
        self.numerical_failures += 1;
    }

    /// Overwrites the log-target without touching any counter.
    pub fn set_log_target(&mut self, log_target: f64) {
        self.log_target = log_target;
    }

    /// Replaces position and log-target without touching any counter.
    pub fn relocate(&mut self, position: Vec<f64>, log_target: f64) {
        self.position = position;
        self.log_target = log_target;
    }
}

/// What an [`Algorithm`] sees of the run: the chains, their random number generators and
/// the iteration counter.
#[derive(Debug, Clone)]
pub struct RunContext {
    chains: Vec<ChainState>,
    rngs: Vec<SmallRng>,
    dim: usize,
    n_burn: usize,
    iteration: usize,
}

impl RunContext {
    pub fn new(chains: Vec<ChainState>, rngs: Vec<SmallRng>, dim: usize, n_burn: usize) -> Self {
        Self {
            chains,
            rngs,
            dim,
            n_burn,
            iteration: 0,
        }
    }

    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Iterations completed so far.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Whether the iteration about to be performed falls inside burn-in.
    pub fn in_burn_in(&self) -> bool {
        self.iteration < self.n_burn
    }

    pub fn chains(&self) -> &[ChainState] {
        &self.chains
    }

    pub fn chains_mut(&mut self) -> &mut [ChainState] {
        &mut self.chains
    }

    /// Chains together with their generators, for parallel per-chain work.
    pub fn split_mut(&mut self) -> (&mut [ChainState], &mut [SmallRng]) {
        (&mut self.chains, &mut self.rngs)
    }

    /// A frozen copy of every chain's position.
    pub fn positions(&self) -> Vec<Vec<f64>> {
        self.chains.iter().map(|c| c.position.clone()).collect()
    }

    /// Index of the chain with the highest log-target.
    pub fn best_chain(&self) -> usize {
        self.chains
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |(best, best_lp), (i, c)| {
                if c.log_target > best_lp {
                    (i, c.log_target)
                } else {
                    (best, best_lp)
                }
            })
            .0
    }

    fn reseed(&mut self, seed: u64) {
        for (i, rng) in self.rngs.iter_mut().enumerate() {
            *rng = SmallRng::seed_from_u64(seed.wrapping_add(i as u64));
        }
    }
}

/**
One generation of an MCMC variant.

The engine calls [`Algorithm::validate`] and [`Algorithm::initialize`] once while building a
[`Sampler`], then [`Algorithm::advance`] once per iteration. `advance` must take exactly the
decisions of one generation for every chain; the engine does the recording afterwards.
*/
pub trait Algorithm: Send {
    fn name(&self) -> &'static str;

    /// Rejects setups the variant cannot run, before anything is evaluated.
    fn validate<T: Target + ?Sized + 'static>(
        &self,
        evaluator: &Evaluator<T>,
        initial_positions: &[Vec<f64>],
    ) -> Result<()>;

    /// Prepares per-chain state once the initial log-targets are known.
    fn initialize<T: Target + ?Sized + 'static>(
        &mut self,
        _evaluator: &Evaluator<T>,
        _ctx: &mut RunContext,
    ) -> Result<()> {
        Ok(())
    }

    fn advance<T: Target + ?Sized + 'static>(
        &mut self,
        ctx: &mut RunContext,
        evaluator: &Evaluator<T>,
    );
}

/// Applies the Metropolis rule to an evaluated candidate.
///
/// One uniform is drawn whatever the outcome so that every chain consumes its stream at the
/// same pace. A failed evaluation is rejected; a NaN log-ratio is rejected.
pub fn metropolis_update(
    chain: &mut ChainState,
    rng: &mut SmallRng,
    candidate: Vec<f64>,
    evaluated: Result<f64>,
    log_correction: f64,
) -> bool {
    chain.record_evaluation(evaluated.is_ok());
    let u: f64 = rng.gen();
    match evaluated {
        Ok(log_target) => {
            let log_accept_ratio = log_target - chain.log_target + log_correction;
            if log_accept_ratio > u.ln() {
                chain.accept(candidate, log_target);
                true
            } else {
                chain.reject();
                false
            }
        }
        Err(err) => {
            trace!("rejecting candidate: {err}");
            chain.reject();
            false
        }
    }
}

/// Where a sampler is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Phase {
    Init,
    Warmup,
    Sampling,
    Done,
    DoneIncomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StopReason {
    IterationCap,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RunStatus {
    Complete,
    Incomplete {
        requested: usize,
        collected: usize,
        reason: StopReason,
    },
}

/// Result of one call to [`Sampler::run`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Iterations performed during this call.
    pub iterations: usize,
    pub diagnostics: Diagnostics,
}

/// Cooperative cancellation flag, checked by the engine between iterations.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/**
A multi-chain sampler combining a target, an [`Algorithm`] and a [`RunConfig`].

The number of chains is the number of initial positions. Initial positions are evaluated
once, as a batch, when the sampler is built; a position whose log-target cannot be computed
starts at `-inf` and counts one numerical failure.
*/
pub struct Sampler<T: Target + ?Sized, A: Algorithm> {
    evaluator: Evaluator<T>,
    algorithm: A,
    config: RunConfig,
    ctx: RunContext,
    store: SampleStore,
    pool: Option<rayon::ThreadPool>,
    stop: StopHandle,
    phase: Phase,
    seed: u64,
}

impl<T: Target + 'static, A: Algorithm> Sampler<T, A> {
    pub fn new(
        target: T,
        algorithm: A,
        initial_positions: Vec<Vec<f64>>,
        config: RunConfig,
    ) -> Result<Self> {
        Self::with_shared_target(Arc::new(target), algorithm, initial_positions, config)
    }
}

impl<T: Target + ?Sized + 'static, A: Algorithm> Sampler<T, A> {
    const UPDATE_INTERVAL: Duration = Duration::from_millis(500);

    pub fn with_shared_target(
        target: Arc<T>,
        mut algorithm: A,
        initial_positions: Vec<Vec<f64>>,
        config: RunConfig,
    ) -> Result<Self> {
        config.validate()?;
        let dim = config.dim;
        if initial_positions.is_empty() {
            return Err(McmcError::Configuration(
                "at least one initial position is required".to_string(),
            ));
        }
        if let Some(bad) = initial_positions.iter().find(|p| p.len() != dim) {
            return Err(McmcError::InvalidState {
                expected: dim,
                found: bad.len(),
            });
        }

        let evaluator = Evaluator::new(target, dim, config.timeout)?;
        algorithm.validate(&evaluator, &initial_positions)?;

        let n_chains = initial_positions.len();
        let seeds = Array2::from_shape_vec((n_chains, dim), initial_positions.concat())?;
        let seed_values = evaluator.evaluate_batch(seeds.view());
        let chains: Vec<ChainState> = initial_positions
            .into_iter()
            .zip(seed_values)
            .enumerate()
            .map(|(i, (position, value))| match value {
                Ok(log_target) => ChainState::new(position, log_target),
                Err(err) => {
                    warn!("chain {i}: initial state failed to evaluate ({err}), starting at -inf");
                    let mut chain = ChainState::new(position, f64::NEG_INFINITY);
                    chain.record_failure();
                    chain
                }
            })
            .collect();

        let seed = config.seed.unwrap_or_else(|| thread_rng().gen::<u64>());
        let rngs = (0..n_chains)
            .map(|i| SmallRng::seed_from_u64(seed.wrapping_add(i as u64)))
            .collect();
        let mut ctx = RunContext::new(chains, rngs, dim, config.n_burn);
        algorithm.initialize(&evaluator, &mut ctx)?;

        let pool = match config.threads {
            Some(n) => Some(rayon::ThreadPoolBuilder::new().num_threads(n).build()?),
            None => None,
        };

        debug!(
            "built {} sampler: {} chains, dim {}, n_burn {}, jump {}",
            algorithm.name(),
            n_chains,
            dim,
            config.n_burn,
            config.jump
        );

        Ok(Self {
            evaluator,
            algorithm,
            store: SampleStore::new(n_chains, dim),
            config,
            ctx,
            pool,
            stop: StopHandle::default(),
            phase: Phase::Init,
            seed,
        })
    }

    /**
    Sets a new global seed and reseeds every chain with `seed + i`.

    ```rust
    use uq_mcmc::config::RunConfig;
    use uq_mcmc::core::{init_det, Sampler};
    use uq_mcmc::distributions::DiagonalGaussian;
    use uq_mcmc::metropolis_hastings::MetropolisHastings;
    use uq_mcmc::proposals::IsotropicGaussian;

    let sampler = Sampler::new(
        DiagonalGaussian::isotropic(1, 1.0),
        MetropolisHastings::new(IsotropicGaussian::new(1.0)),
        init_det(2, 1, 0),
        RunConfig::new(1),
    )
    .unwrap()
    .set_seed(42);
    assert_eq!(sampler.seed(), 42);
    ```
    */
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.ctx.reseed(seed);
        self
    }

    /// The global seed; chain `i` draws from `seed + i`. Change it with [`Sampler::set_seed`].
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Performs one iteration and applies the recording policy. Returns whether a sample
    /// row was recorded.
    pub fn step(&mut self) -> bool {
        let Self {
            evaluator,
            algorithm,
            ctx,
            pool,
            ..
        } = self;
        match pool {
            Some(pool) => pool.install(|| algorithm.advance(ctx, evaluator)),
            None => algorithm.advance(ctx, evaluator),
        }
        self.ctx.iteration += 1;

        let t = self.ctx.iteration;
        let n_burn = self.config.n_burn;
        let recorded = t > n_burn && (t - n_burn) % self.config.jump == 0;
        if recorded {
            self.store.push(&self.ctx.chains);
        }
        self.phase = if t <= n_burn {
            Phase::Warmup
        } else {
            Phase::Sampling
        };
        recorded
    }

    /// Runs until `nsamples` more samples per chain are recorded, the iteration cap is hit
    /// or a stop is requested.
    pub fn run(&mut self, nsamples: usize) -> Result<RunOutcome> {
        self.run_inner(nsamples, None)
    }

    /// Like [`Sampler::run`], with a progress bar showing the running acceptance rate.
    pub fn run_progress(&mut self, nsamples: usize) -> Result<RunOutcome> {
        let pb = ProgressBar::new(nsamples as u64);
        let style = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        pb.set_style(style);
        pb.set_prefix(self.algorithm.name());
        let outcome = self.run_inner(nsamples, Some(&pb));
        pb.finish_with_message(format!("AcceptRate={:.3}", self.acceptance_rate()));
        outcome
    }

    fn run_inner(&mut self, nsamples: usize, pb: Option<&ProgressBar>) -> Result<RunOutcome> {
        if nsamples == 0 {
            return Err(McmcError::Configuration(
                "nsamples must be at least 1".to_string(),
            ));
        }
        self.store.reserve(nsamples);

        let mut collected = 0;
        let mut iterations = 0;
        let mut last_update = Instant::now();
        let status = loop {
            if collected == nsamples {
                break RunStatus::Complete;
            }
            if self.stop.take() {
                break RunStatus::Incomplete {
                    requested: nsamples,
                    collected,
                    reason: StopReason::Cancelled,
                };
            }
            if self.config.max_iterations.is_some_and(|cap| iterations >= cap) {
                break RunStatus::Incomplete {
                    requested: nsamples,
                    collected,
                    reason: StopReason::IterationCap,
                };
            }
            if self.step() {
                collected += 1;
            }
            iterations += 1;

            if let Some(pb) = pb {
                if last_update.elapsed() >= Self::UPDATE_INTERVAL || collected == nsamples {
                    pb.set_position(collected as u64);
                    pb.set_message(format!("AcceptRate={:.3}", self.acceptance_rate()));
                    last_update = Instant::now();
                }
            }
        };

        self.phase = match status {
            RunStatus::Complete => Phase::Done,
            RunStatus::Incomplete { .. } => Phase::DoneIncomplete,
        };
        let diagnostics = self.diagnostics()?;
        diagnostics.log_warnings();
        match status {
            RunStatus::Complete => info!(
                "{} run complete: {} samples per chain after {} iterations, acceptance {:.3}",
                self.algorithm.name(),
                collected,
                iterations,
                diagnostics.acceptance_rate
            ),
            RunStatus::Incomplete { reason, .. } => warn!(
                "{} run stopped ({:?}): {} of {} samples collected after {} iterations",
                self.algorithm.name(),
                reason,
                collected,
                nsamples,
                iterations
            ),
        }

        Ok(RunOutcome {
            status,
            iterations,
            diagnostics,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Iterations performed since the sampler was built.
    pub fn iteration(&self) -> usize {
        self.ctx.iteration
    }

    pub fn n_chains(&self) -> usize {
        self.ctx.n_chains()
    }

    pub fn dim(&self) -> usize {
        self.config.dim
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn algorithm(&self) -> &A {
        &self.algorithm
    }

    pub fn chains(&self) -> &[ChainState] {
        self.ctx.chains()
    }

    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    /// Samples shaped `[nsamples_per_chain, n_chains, dim]`.
    pub fn samples(&self) -> Result<Array3<f64>> {
        self.store.samples()
    }

    /// Log-target values shaped `[nsamples_per_chain, n_chains]`.
    pub fn log_targets(&self) -> Result<Array2<f64>> {
        self.store.log_targets()
    }

    /// Samples of all chains concatenated, shaped `[nsamples_per_chain * n_chains, dim]`.
    pub fn flat_samples(&self) -> Result<Array2<f64>> {
        self.store.flat_samples()
    }

    pub fn acceptance_rates(&self) -> Vec<f64> {
        self.ctx.chains.iter().map(ChainState::acceptance_rate).collect()
    }

    /// Accepted over proposed moves, pooled across chains.
    pub fn acceptance_rate(&self) -> f64 {
        let accepted: u64 = self.ctx.chains.iter().map(ChainState::accepted).sum();
        let proposed: u64 = self.ctx.chains.iter().map(ChainState::proposed).sum();
        if proposed == 0 {
            0.0
        } else {
            accepted as f64 / proposed as f64
        }
    }

    pub fn diagnostics(&self) -> Result<Diagnostics> {
        let mut diagnostics = Diagnostics::collect(
            &self.ctx.chains,
            &self.store,
            self.config.acceptance_band,
            self.config.rhat_threshold,
        )?;
        diagnostics.abandoned_evaluations = self.evaluator.abandoned();
        Ok(diagnostics)
    }
}

/// Initial positions drawn from a standard normal with the thread-local generator.
pub fn init(n_chains: usize, dim: usize) -> Vec<Vec<f64>> {
    let mut rng = thread_rng();
    (0..n_chains)
        .map(|_| (0..dim).map(|_| rng.sample(StandardNormal)).collect())
        .collect()
}

/// Reproducible initial positions drawn from a standard normal.
pub fn init_det(n_chains: usize, dim: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..n_chains)
        .map(|_| (0..dim).map(|_| rng.sample(StandardNormal)).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{DiagonalGaussian, LogDensity};
    use crate::metropolis_hastings::MetropolisHastings;
    use crate::proposals::IsotropicGaussian;
    use std::sync::atomic::AtomicUsize;

    fn mh_sampler(
        n_chains: usize,
        config: RunConfig,
    ) -> Sampler<DiagonalGaussian, MetropolisHastings<IsotropicGaussian>> {
        let dim = config.dim;
        Sampler::new(
            DiagonalGaussian::isotropic(dim, 1.0),
            MetropolisHastings::new(IsotropicGaussian::new(1.0)),
            init_det(n_chains, dim, 1),
            config,
        )
        .unwrap()
    }

    #[test]
    fn chain_state_counters_stay_consistent() {
        let mut chain = ChainState::new(vec![0.0, 0.0], -1.0);
        chain.reject();
        chain.accept(vec![1.0, 1.0], -2.0);
        chain.accept_component(0, 3.0, -4.0);
        chain.relocate(vec![5.0, 5.0], -5.0);
        assert_eq!(chain.proposed(), 3);
        assert_eq!(chain.accepted(), 2);
        assert_eq!(chain.position(), &[5.0, 5.0]);
        assert_eq!(chain.log_target(), -5.0);
        assert!((chain.acceptance_rate() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn init_det_is_reproducible() {
        assert_eq!(init_det(3, 2, 5), init_det(3, 2, 5));
        assert_ne!(init_det(3, 2, 5), init_det(3, 2, 6));
        let random = init(4, 3);
        assert_eq!(random.len(), 4);
        assert!(random.iter().all(|p| p.len() == 3));
    }

    #[test]
    fn construction_rejects_bad_inputs() {
        let target = DiagonalGaussian::isotropic(2, 1.0);
        let algorithm = MetropolisHastings::new(IsotropicGaussian::new(1.0));
        let empty = Sampler::new(target.clone(), algorithm.clone(), vec![], RunConfig::new(2));
        assert!(matches!(empty, Err(McmcError::Configuration(_))));

        let wrong_dim = Sampler::new(
            target.clone(),
            algorithm.clone(),
            vec![vec![0.0, 0.0], vec![0.0]],
            RunConfig::new(2),
        );
        assert!(matches!(
            wrong_dim,
            Err(McmcError::InvalidState {
                expected: 2,
                found: 1
            })
        ));

        let bad_config = Sampler::new(
            target,
            algorithm,
            vec![vec![0.0, 0.0]],
            RunConfig::new(2).jump(0),
        );
        assert!(matches!(bad_config, Err(McmcError::Configuration(_))));
    }

    #[test]
    fn failing_initial_state_starts_at_negative_infinity() {
        let target = LogDensity::new(|x: &[f64]| if x[0] > 10.0 { f64::NAN } else { -x[0] * x[0] });
        let sampler = Sampler::new(
            target,
            MetropolisHastings::new(IsotropicGaussian::new(1.0)),
            vec![vec![20.0], vec![0.0]],
            RunConfig::new(1).seed(1),
        )
        .unwrap();
        assert_eq!(sampler.chains()[0].log_target(), f64::NEG_INFINITY);
        assert_eq!(sampler.chains()[0].numerical_failures(), 1);
        assert_eq!(sampler.chains()[0].evaluations(), 0);
        assert_eq!(sampler.chains()[1].log_target(), 0.0);
    }

    #[test]
    fn cost_model_matches_burn_in_and_thinning() {
        let mut sampler = mh_sampler(3, RunConfig::new(2).n_burn(7).jump(3).seed(9));
        let outcome = sampler.run(20).unwrap();
        assert_eq!(outcome.status, RunStatus::Complete);
        assert_eq!(outcome.iterations, 7 + 3 * 20);
        assert_eq!(sampler.iteration(), 67);
        assert_eq!(sampler.store().nsamples_per_chain(), 20);
        for chain in sampler.chains() {
            assert_eq!(chain.evaluations(), 67);
            assert_eq!(chain.proposed(), 67);
            assert!(chain.accepted() <= chain.proposed());
        }
        assert_eq!(sampler.phase(), Phase::Done);
    }

    #[test]
    fn continuation_appends_without_repeating_burn_in() {
        let mut sampler = mh_sampler(2, RunConfig::new(1).n_burn(50).seed(3));
        sampler.run(10).unwrap();
        let first = sampler.samples().unwrap();
        sampler.run(15).unwrap();
        let all = sampler.samples().unwrap();
        assert_eq!(all.shape(), &[25, 2, 1]);
        assert_eq!(all.slice(ndarray::s![..10, .., ..]), first);
        assert_eq!(sampler.chains()[0].evaluations(), 50 + 25);
    }

    #[test]
    fn rejected_moves_keep_state_bit_for_bit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let start = 0.123_456_789_f64;
        let target = LogDensity::new(move |x: &[f64]| {
            counter.fetch_add(1, Ordering::SeqCst);
            if x[0] == start {
                0.25
            } else {
                f64::NEG_INFINITY
            }
        });
        let mut sampler = Sampler::new(
            target,
            MetropolisHastings::new(IsotropicGaussian::new(1.0)),
            vec![vec![start]; 2],
            RunConfig::new(1).n_burn(5).seed(4),
        )
        .unwrap();
        sampler.run(30).unwrap();

        let samples = sampler.samples().unwrap();
        assert!(samples.iter().all(|&x| x.to_bits() == start.to_bits()));
        assert!(sampler.log_targets().unwrap().iter().all(|&lp| lp == 0.25));
        assert_eq!(sampler.acceptance_rate(), 0.0);
        // Two seed evaluations, then one candidate per chain per iteration.
        assert_eq!(calls.load(Ordering::SeqCst), 2 + 2 * 35);
    }

    #[test]
    fn always_nan_target_completes_with_zero_acceptance() {
        let mut sampler = Sampler::new(
            LogDensity::new(|_: &[f64]| f64::NAN),
            MetropolisHastings::new(IsotropicGaussian::new(1.0)),
            vec![vec![0.0]],
            RunConfig::new(1).n_burn(10).seed(5),
        )
        .unwrap();
        let outcome = sampler.run(50).unwrap();
        assert_eq!(outcome.status, RunStatus::Complete);
        assert_eq!(sampler.acceptance_rates(), vec![0.0]);
        assert_eq!(sampler.chains()[0].numerical_failures(), 1 + 60);
        assert!(!outcome.diagnostics.is_healthy());
    }

    #[test]
    fn iteration_cap_returns_partial_results() {
        let mut sampler = mh_sampler(2, RunConfig::new(1).n_burn(10).max_iterations(15).seed(2));
        let outcome = sampler.run(100).unwrap();
        assert_eq!(
            outcome.status,
            RunStatus::Incomplete {
                requested: 100,
                collected: 5,
                reason: StopReason::IterationCap
            }
        );
        assert_eq!(sampler.phase(), Phase::DoneIncomplete);
        assert_eq!(sampler.samples().unwrap().shape(), &[5, 2, 1]);

        let outcome = sampler.run(5).unwrap();
        assert_eq!(outcome.status, RunStatus::Complete);
        assert_eq!(outcome.iterations, 5);
        assert_eq!(sampler.store().nsamples_per_chain(), 10);
    }

    #[test]
    fn stop_request_cancels_before_next_iteration() {
        let mut sampler = mh_sampler(1, RunConfig::new(1).seed(8));
        let handle = sampler.stop_handle();
        handle.request_stop();
        let outcome = sampler.run(10).unwrap();
        assert_eq!(
            outcome.status,
            RunStatus::Incomplete {
                requested: 10,
                collected: 0,
                reason: StopReason::Cancelled
            }
        );
        assert!(!handle.is_requested());
        assert_eq!(sampler.run(10).unwrap().status, RunStatus::Complete);
    }

    #[test]
    fn stop_request_from_another_thread() {
        let target = LogDensity::new(|x: &[f64]| {
            std::thread::sleep(Duration::from_micros(200));
            -0.5 * x[0] * x[0]
        });
        let mut sampler = Sampler::new(
            target,
            MetropolisHastings::new(IsotropicGaussian::new(1.0)),
            vec![vec![0.0]],
            RunConfig::new(1).max_iterations(1_000_000).seed(8),
        )
        .unwrap();
        let handle = sampler.stop_handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.request_stop();
        });
        let outcome = sampler.run(1_000_000).unwrap();
        stopper.join().unwrap();
        match outcome.status {
            RunStatus::Incomplete {
                collected, reason, ..
            } => {
                assert_eq!(reason, StopReason::Cancelled);
                assert_eq!(sampler.store().nsamples_per_chain(), collected);
            }
            RunStatus::Complete => panic!("run should have been cancelled"),
        }
    }

    #[test]
    fn phases_follow_burn_in() {
        let mut sampler = mh_sampler(1, RunConfig::new(1).n_burn(2).seed(1));
        assert_eq!(sampler.phase(), Phase::Init);
        assert!(!sampler.step());
        assert_eq!(sampler.phase(), Phase::Warmup);
        assert!(!sampler.step());
        assert_eq!(sampler.phase(), Phase::Warmup);
        assert!(sampler.step());
        assert_eq!(sampler.phase(), Phase::Sampling);
    }

    #[test]
    fn zero_samples_is_rejected() {
        let mut sampler = mh_sampler(1, RunConfig::new(1));
        assert!(matches!(sampler.run(0), Err(McmcError::Configuration(_))));
    }

    #[test]
    fn progress_run_matches_plain_run() {
        let mut plain = mh_sampler(2, RunConfig::new(2).n_burn(20).seed(13));
        let mut progress = mh_sampler(2, RunConfig::new(2).n_burn(20).seed(13));
        plain.run(200).unwrap();
        progress.run_progress(200).unwrap();
        assert_eq!(plain.samples().unwrap(), progress.samples().unwrap());
    }

    #[test]
    fn set_seed_reseeds_chains() {
        let mut a = mh_sampler(2, RunConfig::new(1).seed(1)).set_seed(77);
        let mut b = mh_sampler(2, RunConfig::new(1).seed(2)).set_seed(77);
        a.run(50).unwrap();
        b.run(50).unwrap();
        assert_eq!(a.samples().unwrap(), b.samples().unwrap());
        assert_eq!(a.seed(), 77);
    }

    #[test]
    fn diagnostics_count_abandoned_evaluations() {
        let target = LogDensity::new(|x: &[f64]| {
            std::thread::sleep(Duration::from_millis(200));
            -0.5 * x[0] * x[0]
        })
        .dim(1);
        let config = RunConfig::new(1).seed(3).timeout(Duration::from_millis(10));
        let mut sampler = Sampler::new(
            target,
            MetropolisHastings::new(IsotropicGaussian::new(1.0)),
            vec![vec![0.0]],
            config,
        )
        .unwrap();
        let outcome = sampler.run(2).unwrap();
        // The seed evaluation and both iterations time out.
        assert_eq!(outcome.diagnostics.abandoned_evaluations, 3);
        assert_eq!(sampler.chains()[0].numerical_failures(), 3);
        assert_eq!(sampler.chains()[0].accepted(), 0);
    }

    #[test]
    fn seed_comes_from_config_or_entropy() {
        assert_eq!(mh_sampler(2, RunConfig::new(1).seed(9)).seed(), 9);
        let drawn = mh_sampler(2, RunConfig::new(1));
        let mut a = mh_sampler(2, RunConfig::new(1).seed(drawn.seed()));
        let mut b = drawn;
        a.run(20).unwrap();
        b.run(20).unwrap();
        assert_eq!(a.samples().unwrap(), b.samples().unwrap());
    }
}
