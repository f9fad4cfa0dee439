/*!
# DREAM

Differential Evolution Adaptive Metropolis. Every chain proposes a jump built from the
differences of `2δ` other chains' current positions, restricted to a random subset of
coordinates:

\[
x' = x + (1 + \lambda)\,\gamma \sum_{k=1}^{\delta} (x_{a_k} - x_{b_k}) + \varepsilon,
\qquad \lambda \sim U(-c, c),\ \varepsilon \sim N(0, c_*^2),
\]

with `γ = 2.38 / √(2 δ d*)` (or `γ = 1` with probability `p_g`, to jump between modes) and
`d*` the number of updated coordinates. The subset is chosen coordinate-wise with a
crossover probability `CR ∈ {1/n_cr, …, 1}` whose selection weights are tuned during burn-in
towards the values that produce the largest normalized jumps.

Also during burn-in, chains whose recent mean log-target falls below `Q1 - 2 IQR` across
the ensemble are moved onto the current best chain.

All chains read the positions frozen at the start of the iteration, so a generation is
updated in parallel.
*/

use log::{debug, trace, warn};
use rand::distributions::WeightedIndex;
use rand::rngs::SmallRng;
use rand::seq::index;
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use crate::core::{metropolis_update, Algorithm, ChainState, RunContext};
use crate::distributions::Target;
use crate::errors::{McmcError, Result};
use crate::evaluator::Evaluator;
use crate::stats::quantile_sorted;

#[derive(Debug, Clone, PartialEq)]
pub struct Dream {
    delta: usize,
    c: f64,
    c_star: f64,
    n_cr: usize,
    p_g: f64,
    outlier_interval: usize,
    crossover_probs: Vec<f64>,
    crossover: Option<WeightedIndex<f64>>,
    jump_distance: Vec<f64>,
    crossover_counts: Vec<u64>,
    // Log-targets of every chain since the last outlier check.
    windows: Vec<Vec<f64>>,
    relocations: usize,
}

impl Default for Dream {
    fn default() -> Self {
        Self {
            delta: 3,
            c: 0.1,
            c_star: 1e-6,
            n_cr: 3,
            p_g: 0.2,
            outlier_interval: 50,
            crossover_probs: Vec::new(),
            crossover: None,
            jump_distance: Vec::new(),
            crossover_counts: Vec::new(),
            windows: Vec::new(),
            relocations: 0,
        }
    }
}

impl Dream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest number of chain pairs used in one difference vector.
    pub fn delta(mut self, delta: usize) -> Self {
        self.delta = delta;
        self
    }

    /// Half-width of the uniform jump-rate perturbation `λ`.
    pub fn c(mut self, c: f64) -> Self {
        self.c = c;
        self
    }

    /// Standard deviation of the Gaussian noise `ε`.
    pub fn c_star(mut self, c_star: f64) -> Self {
        self.c_star = c_star;
        self
    }

    /// Number of crossover values; clamped to the dimension.
    pub fn n_cr(mut self, n_cr: usize) -> Self {
        self.n_cr = n_cr;
        self
    }

    /// Probability of a unit jump rate.
    pub fn p_g(mut self, p_g: f64) -> Self {
        self.p_g = p_g;
        self
    }

    /// Iterations between two outlier checks during burn-in.
    pub fn outlier_interval(mut self, iterations: usize) -> Self {
        self.outlier_interval = iterations;
        self
    }

    /// Current selection probabilities of the crossover values `1/n_cr, …, 1`.
    pub fn crossover_probabilities(&self) -> &[f64] {
        &self.crossover_probs
    }

    /// Number of chains moved onto the best chain so far.
    pub fn relocations(&self) -> usize {
        self.relocations
    }

    /// Normalizes `weights` into the crossover probabilities and rebuilds the index
    /// distribution drawn from. On error the previous probabilities stay in place.
    fn set_crossover(&mut self, weights: &[f64]) -> Result<()> {
        let dist = WeightedIndex::new(weights).map_err(|e| {
            McmcError::Configuration(format!("invalid crossover weights {weights:?}: {e}"))
        })?;
        let norm: f64 = weights.iter().sum();
        self.crossover_probs = weights.iter().map(|w| w / norm).collect();
        self.crossover = Some(dist);
        Ok(())
    }

    fn update_crossover(&mut self, jumps: &[(usize, f64)]) {
        for &(m, jump) in jumps {
            self.jump_distance[m] += jump;
            self.crossover_counts[m] += 1;
        }
        let total: f64 = self.jump_distance.iter().sum();
        if total <= 0.0 || self.crossover_counts.iter().any(|&n| n == 0) {
            return;
        }
        let weights: Vec<f64> = self
            .jump_distance
            .iter()
            .zip(&self.crossover_counts)
            .map(|(j, &n)| j / n as f64)
            .collect();
        if let Err(e) = self.set_crossover(&weights) {
            warn!("DREAM keeps its crossover probabilities: {e}");
        }
    }

    fn relocate_outliers(&mut self, ctx: &mut RunContext) {
        let means: Vec<f64> = self
            .windows
            .iter()
            .map(|w| w.iter().sum::<f64>() / w.len().max(1) as f64)
            .collect();
        let mut sorted = means.clone();
        sorted.sort_by(f64::total_cmp);
        let q1 = quantile_sorted(&sorted, 0.25);
        let q3 = quantile_sorted(&sorted, 0.75);
        let threshold = q1 - 2.0 * (q3 - q1);

        let best = ctx.best_chain();
        let best_position = ctx.chains()[best].position().to_vec();
        let best_log_target = ctx.chains()[best].log_target();
        let mut moved = 0;
        for (chain, mean) in ctx.chains_mut().iter_mut().zip(&means) {
            // A -inf threshold means the quartiles themselves are degenerate.
            if threshold.is_finite() && *mean < threshold {
                chain.relocate(best_position.clone(), best_log_target);
                moved += 1;
            }
        }
        if moved > 0 {
            debug!("DREAM moved {moved} outlier chain(s) onto chain {best}");
        }
        self.relocations += moved;
        for window in &mut self.windows {
            window.clear();
        }
    }
}

struct Move<'a> {
    delta: usize,
    c: f64,
    c_star: f64,
    p_g: f64,
    crossover: &'a WeightedIndex<f64>,
    n_cr: usize,
    positions: &'a [Vec<f64>],
    spread: &'a [f64],
}

impl Move<'_> {
    /// Proposes, decides and returns the crossover index used with the normalized squared
    /// jump (zero when rejected).
    fn apply<T: Target + ?Sized + 'static>(
        &self,
        index_of: usize,
        chain: &mut ChainState,
        rng: &mut SmallRng,
        evaluator: &Evaluator<T>,
    ) -> (usize, f64) {
        let n = self.positions.len();
        let dim = chain.position().len();
        let delta = rng.gen_range(1..=self.delta);
        let others: Vec<usize> = index::sample(rng, n - 1, 2 * delta)
            .iter()
            .map(|k| if k >= index_of { k + 1 } else { k })
            .collect();
        let (a, b) = others.split_at(delta);

        let m = rng.sample(self.crossover);
        let cr = (m + 1) as f64 / self.n_cr as f64;
        let mut selected: Vec<usize> = (0..dim).filter(|_| rng.gen::<f64>() < cr).collect();
        if selected.is_empty() {
            selected.push(rng.gen_range(0..dim));
        }
        let gamma = if rng.gen::<f64>() < self.p_g {
            1.0
        } else {
            2.38 / ((2 * delta * selected.len()) as f64).sqrt()
        };
        let lambda = if self.c > 0.0 {
            rng.gen_range(-self.c..=self.c)
        } else {
            0.0
        };

        let mut candidate = chain.position().to_vec();
        for &j in &selected {
            let diff: f64 = a
                .iter()
                .zip(b)
                .map(|(&p, &q)| self.positions[p][j] - self.positions[q][j])
                .sum();
            let noise: f64 = rng.sample::<f64, _>(StandardNormal) * self.c_star;
            candidate[j] += (1.0 + lambda) * gamma * diff + noise;
        }

        let before = chain.position().to_vec();
        let evaluated = evaluator.evaluate(&candidate);
        let jump = if metropolis_update(chain, rng, candidate, evaluated, 0.0) {
            chain
                .position()
                .iter()
                .zip(&before)
                .zip(self.spread)
                .filter(|(_, s)| **s > 0.0)
                .map(|((x, y), s)| ((x - y) / s).powi(2))
                .sum()
        } else {
            0.0
        };
        (m, jump)
    }
}

/// Per-coordinate standard deviation across chains.
fn ensemble_spread(positions: &[Vec<f64>], dim: usize) -> Vec<f64> {
    let n = positions.len() as f64;
    (0..dim)
        .map(|j| {
            let mean = positions.iter().map(|p| p[j]).sum::<f64>() / n;
            let var = positions.iter().map(|p| (p[j] - mean).powi(2)).sum::<f64>() / n;
            var.sqrt()
        })
        .collect()
}

impl Algorithm for Dream {
    fn name(&self) -> &'static str {
        "DREAM"
    }

    fn validate<T: Target + ?Sized + 'static>(
        &self,
        _evaluator: &Evaluator<T>,
        initial_positions: &[Vec<f64>],
    ) -> Result<()> {
        let n = initial_positions.len();
        if n < 3 {
            return Err(McmcError::Configuration(format!(
                "DREAM needs at least 3 chains, got {n}"
            )));
        }
        if self.delta == 0 || self.n_cr == 0 || self.outlier_interval == 0 {
            return Err(McmcError::Configuration(
                "DREAM delta, n_cr and outlier interval must be at least 1".to_string(),
            ));
        }
        if self.c.is_nan() || self.c < 0.0 || self.c_star.is_nan() || self.c_star < 0.0 {
            return Err(McmcError::Configuration(format!(
                "DREAM perturbations must be non-negative, got c = {}, c_star = {}",
                self.c, self.c_star
            )));
        }
        if !(0.0..=1.0).contains(&self.p_g) {
            return Err(McmcError::Configuration(format!(
                "p_g must lie in [0, 1], got {}",
                self.p_g
            )));
        }
        Ok(())
    }

    fn initialize<T: Target + ?Sized + 'static>(
        &mut self,
        evaluator: &Evaluator<T>,
        ctx: &mut RunContext,
    ) -> Result<()> {
        let n_cr = self.n_cr.min(evaluator.dim());
        if n_cr < self.n_cr {
            debug!("DREAM n_cr clamped from {} to {n_cr}", self.n_cr);
        }
        self.set_crossover(&vec![1.0; n_cr])?;
        self.jump_distance = vec![0.0; n_cr];
        self.crossover_counts = vec![0; n_cr];
        self.windows = vec![Vec::new(); ctx.n_chains()];
        self.relocations = 0;
        Ok(())
    }

    fn advance<T: Target + ?Sized + 'static>(
        &mut self,
        ctx: &mut RunContext,
        evaluator: &Evaluator<T>,
    ) {
        let Some(crossover) = self.crossover.as_ref() else {
            return;
        };
        let burn_in = ctx.in_burn_in();
        let positions = ctx.positions();
        let spread = ensemble_spread(&positions, ctx.dim());
        let step = Move {
            delta: self.delta.min((positions.len() - 1) / 2).max(1),
            c: self.c,
            c_star: self.c_star,
            p_g: self.p_g,
            crossover,
            n_cr: self.crossover_probs.len(),
            positions: &positions,
            spread: &spread,
        };
        let (chains, rngs) = ctx.split_mut();
        let jumps: Vec<(usize, f64)> = chains
            .par_iter_mut()
            .zip(rngs.par_iter_mut())
            .enumerate()
            .map(|(i, (chain, rng))| step.apply(i, chain, rng, evaluator))
            .collect();

        if !burn_in {
            return;
        }
        self.update_crossover(&jumps);
        trace!("DREAM crossover probabilities {:?}", self.crossover_probs);
        for (window, chain) in self.windows.iter_mut().zip(ctx.chains()) {
            window.push(chain.log_target());
        }
        if (ctx.iteration() + 1) % self.outlier_interval == 0 {
            self.relocate_outliers(ctx);
        }
    }
}
