/*!
# Affine-invariant stretch move

The Goodman–Weare ensemble sampler. Chains are split by index parity into two halves that
are updated one after the other. A chain `x` of the active half picks a partner `c` uniformly
from the other half's current positions and proposes

\[
x' = c + z (x - c), \qquad g(z) \propto 1/\sqrt{z} \text{ on } [1/a, a],
\]

accepting with probability `min(1, z^(d-1) p(x') / p(x))`. Within a half, every chain reads
the same frozen partner positions, so the half is updated in parallel.
*/

use log::debug;
use rand::rngs::SmallRng;
use rand::Rng;
use rayon::prelude::*;

use crate::core::{metropolis_update, Algorithm, RunContext};
use crate::distributions::Target;
use crate::errors::{McmcError, Result};
use crate::evaluator::Evaluator;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stretch {
    scale: f64,
}

impl Default for Stretch {
    fn default() -> Self {
        Self { scale: 2.0 }
    }
}

impl Stretch {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stretch scale `a`, which must exceed 1.
    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }
}

/// Draws `z` from `g(z) ∝ 1/√z` on `[1/a, a]` by inversion.
pub fn sample_stretch_factor(scale: f64, rng: &mut SmallRng) -> f64 {
    let u: f64 = rng.gen();
    ((scale - 1.0) * u + 1.0).powi(2) / scale
}

impl Algorithm for Stretch {
    fn name(&self) -> &'static str {
        "Stretch"
    }

    fn validate<T: Target + ?Sized + 'static>(
        &self,
        evaluator: &Evaluator<T>,
        initial_positions: &[Vec<f64>],
    ) -> Result<()> {
        if self.scale.is_nan() || self.scale <= 1.0 {
            return Err(McmcError::Configuration(format!(
                "stretch scale must be greater than 1, got {}",
                self.scale
            )));
        }
        if initial_positions.len() < 2 {
            return Err(McmcError::Configuration(format!(
                "the stretch move needs at least 2 chains, got {}",
                initial_positions.len()
            )));
        }
        if initial_positions.len() <= evaluator.dim() {
            debug!("stretch ensemble is not larger than the dimension; it cannot span the space");
        }
        Ok(())
    }

    fn advance<T: Target + ?Sized + 'static>(
        &mut self,
        ctx: &mut RunContext,
        evaluator: &Evaluator<T>,
    ) {
        let scale = self.scale;
        let dim = ctx.dim();
        for half in 0..2 {
            let partners: Vec<Vec<f64>> = ctx
                .chains()
                .iter()
                .enumerate()
                .filter(|(i, _)| i % 2 != half)
                .map(|(_, chain)| chain.position().to_vec())
                .collect();
            let (chains, rngs) = ctx.split_mut();
            chains
                .par_iter_mut()
                .zip(rngs.par_iter_mut())
                .enumerate()
                .filter(|(i, _)| i % 2 == half)
                .for_each(|(_, (chain, rng))| {
                    let partner = &partners[rng.gen_range(0..partners.len())];
                    let z = sample_stretch_factor(scale, rng);
                    let candidate: Vec<f64> = chain
                        .position()
                        .iter()
                        .zip(partner)
                        .map(|(x, c)| c + z * (x - c))
                        .collect();
                    let evaluated = evaluator.evaluate(&candidate);
                    let correction = (dim as f64 - 1.0) * z.ln();
                    metropolis_update(chain, rng, candidate, evaluated, correction);
                });
        }
    }
}
