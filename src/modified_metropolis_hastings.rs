/*!
# Modified Metropolis–Hastings

Component-wise Metropolis–Hastings for high-dimensional targets. Within one iteration every
chain sweeps its dimensions in order; each coordinate gets its own one-dimensional candidate
and its own accept/reject decision, so an iteration takes `dim` decisions per chain and the
acceptance rate is the fraction of accepted component updates.

Two ways of scoring a coordinate are supported:

- [`TargetMode::Marginal`] (default) uses the per-dimension marginal log-densities of the
  target, which must therefore be available. The chain's log-target is the sum of the
  current marginals.
- [`TargetMode::Joint`] re-evaluates the joint log-density with one coordinate replaced.

```rust
use uq_mcmc::config::RunConfig;
use uq_mcmc::core::Sampler;
use uq_mcmc::distributions::DiagonalGaussian;
use uq_mcmc::modified_metropolis_hastings::ModifiedMetropolisHastings;
use uq_mcmc::proposals::UniformRandomWalk;

let mmh = ModifiedMetropolisHastings::new(UniformRandomWalk::new(2.0));
let mut sampler = Sampler::new(
    DiagonalGaussian::isotropic(10, 1.0),
    mmh,
    vec![vec![0.0; 10]; 2],
    RunConfig::new(10).n_burn(50).seed(1),
)
.unwrap();
sampler.run(100).unwrap();
assert_eq!(sampler.chains()[0].proposed(), 150 * 10);
```
*/

use rand::rngs::SmallRng;
use rand::Rng;
use rayon::prelude::*;

use crate::core::{Algorithm, ChainState, RunContext};
use crate::distributions::{Proposal, Target};
use crate::errors::{McmcError, Result};
use crate::evaluator::Evaluator;
use crate::proposals::{check_capabilities, hastings_correction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetMode {
    #[default]
    Marginal,
    Joint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModifiedMetropolisHastings<P> {
    proposals: Vec<P>,
    mode: TargetMode,
    // Current marginal log-densities, one vector per chain.
    marginals: Vec<Vec<f64>>,
}

impl<P: Proposal> ModifiedMetropolisHastings<P> {
    /// Uses the same one-dimensional kernel for every coordinate.
    pub fn new(proposal: P) -> Self {
        Self::per_dimension(vec![proposal])
    }

    /// One one-dimensional kernel per coordinate, in dimension order.
    pub fn per_dimension(proposals: Vec<P>) -> Self {
        Self {
            proposals,
            mode: TargetMode::default(),
            marginals: Vec::new(),
        }
    }

    pub fn mode(mut self, mode: TargetMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn target_mode(&self) -> TargetMode {
        self.mode
    }
}

fn proposal_for<P>(proposals: &[P], index: usize) -> &P {
    if proposals.len() == 1 {
        &proposals[0]
    } else {
        &proposals[index]
    }
}

/// Draws the uniform and applies the decision for coordinate `index`. `reference` is the
/// log-density the candidate competes against; returns the candidate's log-density when
/// the move is accepted.
fn component_decision(
    chain: &mut ChainState,
    rng: &mut SmallRng,
    evaluated: Result<f64>,
    reference: f64,
    correction: f64,
) -> Option<f64> {
    chain.record_evaluation(evaluated.is_ok());
    let u: f64 = rng.gen();
    match evaluated {
        Ok(lp) if lp - reference + correction > u.ln() => Some(lp),
        _ => {
            chain.reject();
            None
        }
    }
}

impl<P: Proposal> Algorithm for ModifiedMetropolisHastings<P> {
    fn name(&self) -> &'static str {
        "MMH"
    }

    fn validate<T: Target + ?Sized + 'static>(
        &self,
        evaluator: &Evaluator<T>,
        initial_positions: &[Vec<f64>],
    ) -> Result<()> {
        let dim = evaluator.dim();
        if self.proposals.len() != 1 && self.proposals.len() != dim {
            return Err(McmcError::Configuration(format!(
                "expected 1 or {dim} component proposals, got {}",
                self.proposals.len()
            )));
        }
        for j in 0..dim {
            check_capabilities(
                proposal_for(&self.proposals, j),
                1,
                &[initial_positions[0][j]],
            )?;
        }
        if self.mode == TargetMode::Marginal {
            if !evaluator.has_marginals() {
                return Err(McmcError::Configuration(
                    "component-wise updates in marginal mode need one marginal log-density per dimension"
                        .to_string(),
                ));
            }
            let target = evaluator.target();
            if let Some(j) =
                (0..dim).find(|&j| target.marginal_log_prob(j, initial_positions[0][j]).is_none())
            {
                return Err(McmcError::Configuration(format!(
                    "no marginal log-density for dimension {j} of {dim}"
                )));
            }
        }
        Ok(())
    }

    fn initialize<T: Target + ?Sized + 'static>(
        &mut self,
        evaluator: &Evaluator<T>,
        ctx: &mut RunContext,
    ) -> Result<()> {
        if self.mode != TargetMode::Marginal {
            return Ok(());
        }
        let dim = ctx.dim();
        self.marginals = ctx
            .chains_mut()
            .iter_mut()
            .map(|chain| {
                let values: Vec<f64> = (0..dim)
                    .map(|j| match evaluator.evaluate_marginal(j, chain.position()[j]) {
                        Ok(lp) => lp,
                        Err(_) => {
                            chain.record_failure();
                            f64::NEG_INFINITY
                        }
                    })
                    .collect();
                chain.set_log_target(values.iter().sum());
                values
            })
            .collect();
        Ok(())
    }

    fn advance<T: Target + ?Sized + 'static>(
        &mut self,
        ctx: &mut RunContext,
        evaluator: &Evaluator<T>,
    ) {
        let dim = ctx.dim();
        let proposals = &self.proposals;
        let (chains, rngs) = ctx.split_mut();
        match self.mode {
            TargetMode::Marginal => chains
                .par_iter_mut()
                .zip(rngs.par_iter_mut())
                .zip(self.marginals.par_iter_mut())
                .for_each(|((chain, rng), marginals)| {
                    for j in 0..dim {
                        let proposal = proposal_for(proposals, j);
                        let current = [chain.position()[j]];
                        let candidate = proposal.sample(&current, rng)[0];
                        let correction = hastings_correction(proposal, &current, &[candidate]);
                        let evaluated = evaluator.evaluate_marginal(j, candidate);
                        if let Some(lp) =
                            component_decision(chain, rng, evaluated, marginals[j], correction)
                        {
                            marginals[j] = lp;
                            chain.accept_component(j, candidate, marginals.iter().sum());
                        }
                    }
                }),
            TargetMode::Joint => chains
                .par_iter_mut()
                .zip(rngs.par_iter_mut())
                .for_each(|(chain, rng)| {
                    for j in 0..dim {
                        let proposal = proposal_for(proposals, j);
                        let current = [chain.position()[j]];
                        let value = proposal.sample(&current, rng)[0];
                        let correction = hastings_correction(proposal, &current, &[value]);
                        let mut candidate = chain.position().to_vec();
                        candidate[j] = value;
                        let evaluated = evaluator.evaluate(&candidate);
                        let reference = chain.log_target();
                        if let Some(lp) =
                            component_decision(chain, rng, evaluated, reference, correction)
                        {
                            chain.accept_component(j, value, lp);
                        }
                    }
                }),
        }
    }
}
