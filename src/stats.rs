//! Provides functions for computing MCMC statistics: streaming moments, the potential scale
//! reduction factor and the post-run diagnostics report.

use log::warn;
use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use num_traits::ToPrimitive;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::core::ChainState;
use crate::errors::{McmcError, Result};
use crate::store::SampleStore;

/// Streaming per-chain means and mean squares, from which the Gelman–Rubin R-hat of every
/// parameter can be read at any time.
#[derive(Debug, Clone, PartialEq)]
pub struct RhatMulti {
    n: usize,
    mean: Array2<f64>,    // n_chains x n_params
    mean_sq: Array2<f64>, // n_chains x n_params
    n_chains: usize,
    n_params: usize,
}

impl RhatMulti {
    pub fn new(n_chains: usize, n_params: usize) -> Self {
        let mean_sq = Array2::<f64>::zeros((n_chains, n_params));
        Self {
            n: 0,
            mean: Array2::<f64>::zeros((n_chains, n_params)),
            mean_sq,
            n_chains,
            n_params,
        }
    }

    /// Adds one draw of every chain, laid out chain-major (`n_chains * n_params` values).
    pub fn step<T>(&mut self, x: &[T]) -> Result<()>
    where
        T: ToPrimitive + Copy,
    {
        let x_arr = ArrayView2::<T>::from_shape((self.n_chains, self.n_params), x)?
            .mapv(|x| x.to_f64().unwrap_or(f64::NAN));
        self.n += 1;
        let n = self.n as f64;

        self.mean = (&self.mean * (n - 1.0) + &x_arr) / n;
        if self.n == 1 {
            self.mean_sq = x_arr.pow2();
        } else {
            self.mean_sq = (&self.mean_sq * (n - 1.0) + x_arr.pow2()) / n;
        };
        Ok(())
    }

    pub fn all(&self) -> Result<Array1<f64>> {
        if self.n < 2 || self.n_chains < 2 {
            return Err(McmcError::Configuration(
                "R-hat needs at least two chains with two draws each".to_string(),
            ));
        }
        let mean_chain = self.mean.mean_axis(Axis(0)).ok_or_else(|| {
            McmcError::Configuration("Mean reduction across chains for mean failed.".to_string())
        })?;
        let n_chains = self.n_chains as f64;
        let n = self.n as f64;
        let fac = n / (n_chains - 1.0);
        let between = (&self.mean - &mean_chain.insert_axis(Axis(0)))
            .pow2()
            .sum_axis(Axis(0))
            * fac;
        let sm2 = (&self.mean_sq - &self.mean.pow2()) * n / (n - 1.0);
        let within = sm2.mean_axis(Axis(0)).ok_or_else(|| {
            McmcError::Configuration(
                "Mean reduction across chains for mean of squares failed.".to_string(),
            )
        })?;
        let var = &within * ((n - 1.0) / n) + between * (1.0 / n);
        Ok((var / within).sqrt())
    }

    pub fn max(&self) -> Result<f64> {
        let all = self.all()?;
        let max = *all
            .max()
            .map_err(|e| McmcError::Numerical(format!("R-hat maximum undefined: {e}")))?;
        Ok(max)
    }
}

/// Welford accumulator for the mean and covariance of a stream of states.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningMoments {
    n: u64,
    mean: Array1<f64>,
    m2: Array2<f64>,
}

impl RunningMoments {
    pub fn new(dim: usize) -> Self {
        Self {
            n: 0,
            mean: Array1::zeros(dim),
            m2: Array2::zeros((dim, dim)),
        }
    }

    pub fn update(&mut self, x: &[f64]) {
        self.n += 1;
        let x = ArrayView1::from(x);
        let delta = &x - &self.mean;
        self.mean.scaled_add(1.0 / self.n as f64, &delta);
        let delta_new = &x - &self.mean;
        let outer = delta
            .view()
            .insert_axis(Axis(1))
            .dot(&delta_new.view().insert_axis(Axis(0)));
        self.m2 += &outer;
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    /// Unbiased sample covariance, available after two updates.
    pub fn covariance(&self) -> Option<Array2<f64>> {
        (self.n >= 2).then(|| &self.m2 / (self.n - 1) as f64)
    }
}

/// Linear-interpolation quantile of already sorted values, `q` in `[0, 1]`.
pub(crate) fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Non-fatal findings about a finished run.
#[derive(Debug, Clone, PartialEq, Error)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConvergenceWarning {
    #[error("chain {chain}: acceptance rate {rate:.3} is below {threshold}")]
    LowAcceptance {
        chain: usize,
        rate: f64,
        threshold: f64,
    },
    #[error("chain {chain}: acceptance rate {rate:.3} is above {threshold}")]
    HighAcceptance {
        chain: usize,
        rate: f64,
        threshold: f64,
    },
    #[error("chain {chain}: {count} candidate evaluations failed")]
    NumericalFailures { chain: usize, count: u64 },
    #[error("dimension {dim}: R-hat {rhat:.3} exceeds {threshold}")]
    PotentialScaleReduction { dim: usize, rhat: f64, threshold: f64 },
}

/// Acceptance, failure and convergence summary of a sampler.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Diagnostics {
    pub acceptance_rates: Vec<f64>,
    /// Accepted over proposed moves, pooled across chains.
    pub acceptance_rate: f64,
    pub evaluations: Vec<u64>,
    pub numerical_failures: Vec<u64>,
    /// One value per dimension when at least two chains recorded two samples.
    pub rhat: Option<Vec<f64>>,
    pub warnings: Vec<ConvergenceWarning>,
    /// Timed evaluations given up on; each one may still hold a running thread.
    pub abandoned_evaluations: u64,
}

impl Diagnostics {
    pub fn collect(
        chains: &[ChainState],
        store: &SampleStore,
        acceptance_band: (f64, f64),
        rhat_threshold: f64,
    ) -> Result<Self> {
        let acceptance_rates: Vec<f64> = chains.iter().map(ChainState::acceptance_rate).collect();
        let accepted: u64 = chains.iter().map(ChainState::accepted).sum();
        let proposed: u64 = chains.iter().map(ChainState::proposed).sum();
        let acceptance_rate = if proposed == 0 {
            0.0
        } else {
            accepted as f64 / proposed as f64
        };

        let mut warnings = Vec::new();
        let (low, high) = acceptance_band;
        for (i, chain) in chains.iter().enumerate() {
            if chain.proposed() > 0 {
                let rate = acceptance_rates[i];
                if rate < low {
                    warnings.push(ConvergenceWarning::LowAcceptance {
                        chain: i,
                        rate,
                        threshold: low,
                    });
                } else if rate > high {
                    warnings.push(ConvergenceWarning::HighAcceptance {
                        chain: i,
                        rate,
                        threshold: high,
                    });
                }
            }
            if chain.numerical_failures() > 0 {
                warnings.push(ConvergenceWarning::NumericalFailures {
                    chain: i,
                    count: chain.numerical_failures(),
                });
            }
        }

        let rhat = if store.n_chains() >= 2 && store.nsamples_per_chain() >= 2 {
            let mut psr = RhatMulti::new(store.n_chains(), store.dim());
            for k in 0..store.nsamples_per_chain() {
                if let Some(row) = store.row(k) {
                    psr.step(row)?;
                }
            }
            let values = psr.all()?.to_vec();
            for (dim, &rhat) in values.iter().enumerate() {
                if rhat > rhat_threshold {
                    warnings.push(ConvergenceWarning::PotentialScaleReduction {
                        dim,
                        rhat,
                        threshold: rhat_threshold,
                    });
                }
            }
            Some(values)
        } else {
            None
        };

        Ok(Self {
            acceptance_rates,
            acceptance_rate,
            evaluations: chains.iter().map(ChainState::evaluations).collect(),
            numerical_failures: chains.iter().map(ChainState::numerical_failures).collect(),
            rhat,
            warnings,
            abandoned_evaluations: 0,
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn log_warnings(&self) {
        for warning in &self.warnings {
            warn!("{warning}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::f64;

    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray_stats::CorrelationExt;

    // Generic helper function to run the Rhat test.
    fn run_rhat_test_generic<T>(data0: Array2<T>, data1: Array2<T>, expected: Array1<f64>, tol: f64)
    where
        T: ndarray::NdFloat + num_traits::FromPrimitive,
    {
        let mut psr = RhatMulti::new(3, 4);
        psr.step(data0.as_slice().unwrap()).unwrap();
        psr.step(data1.as_slice().unwrap()).unwrap();
        let rhat = psr.all().unwrap();
        let diff = *(rhat.clone() - expected.clone()).abs().max().unwrap();
        assert!(
            diff < tol,
            "Mismatch in Rhat. Got {:?}, expected {:?}, diff = {:?}",
            rhat,
            expected,
            diff
        );
    }

    #[test]
    fn test_rhat_f64_1() {
        // Step 0 data (chains x params)
        let data_step_0 = arr2(&[
            [0.0, 1.0, 0.0, 1.0], // chain 0
            [1.0, 2.0, 0.0, 2.0], // chain 1
            [0.0, 0.0, 0.0, 2.0], // chain 2
        ]);

        // Step 1 data (chains x params)
        let data_step_1 = arr2(&[
            [1.0, 2.0, 2.0, 0.0], // chain 0
            [1.0, 1.0, 1.0, 1.0], // chain 1
            [0.0, 1.0, 0.0, 0.0], // chain 2
        ]);
        let expected = array![f64::consts::SQRT_2, 1.08012345, 0.89442719, 0.8660254];
        run_rhat_test_generic(data_step_0, data_step_1, expected, 1e-7);
    }

    #[test]
    fn test_rhat_f32_1() {
        let data_step_0 = arr2(&[
            [0.0f32, 1.0, 0.0, 1.0],
            [1.0, 2.0, 0.0, 2.0],
            [0.0, 0.0, 0.0, 2.0],
        ]);
        let data_step_1 = arr2(&[
            [1.0f32, 2.0, 2.0, 0.0],
            [1.0, 1.0, 1.0, 1.0],
            [0.0, 1.0, 0.0, 0.0],
        ]);
        let expected = array![f64::consts::SQRT_2, 1.0801234, 0.8944271, 0.8660254];
        run_rhat_test_generic(data_step_0, data_step_1, expected, 1e-6);
    }

    #[test]
    fn test_rhat_data_2() {
        let data_step_0 = arr2(&[
            [1.0, 0.0, 0.0, 1.0],
            [1.0, 0.0, 0.0, 1.0],
            [0.0, 1.0, 0.0, 2.0],
        ]);
        let data_step_1 = arr2(&[
            [1.0, 2.0, 0.0, 2.0],
            [1.0, 2.0, 0.0, 0.0],
            [2.0, 0.0, 1.0, 2.0],
        ]);
        let expected = array![f64::consts::FRAC_1_SQRT_2, 0.74535599, 1.0, 1.5];
        run_rhat_test_generic(data_step_0, data_step_1, expected, 1e-7);
    }

    #[test]
    fn rhat_needs_two_draws() {
        let mut psr = RhatMulti::new(2, 1);
        psr.step(&[0.0, 1.0]).unwrap();
        assert!(psr.all().is_err());
        assert!(psr.step(&[0.0]).is_err());
    }

    #[test]
    fn running_moments_match_batch_covariance() {
        let data = arr2(&[
            [1.0, 2.0, 0.5],
            [0.0, -1.0, 1.5],
            [3.0, 0.5, -2.0],
            [2.0, 2.0, 2.0],
            [-1.0, 0.0, 1.0],
        ]);
        let mut moments = RunningMoments::new(3);
        assert!(moments.covariance().is_none());
        for row in data.rows() {
            moments.update(row.as_slice().unwrap());
        }
        assert_eq!(moments.count(), 5);
        let expected_mean = data.mean_axis(Axis(0)).unwrap();
        let expected_cov = data.t().cov(1.0).unwrap();
        assert_abs_diff_eq!(moments.mean(), &expected_mean, epsilon = 1e-12);
        assert_abs_diff_eq!(moments.covariance().unwrap(), expected_cov, epsilon = 1e-12);
    }

    #[test]
    fn quantiles_interpolate_linearly() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile_sorted(&sorted, 0.25), 2.0);
        assert_eq!(quantile_sorted(&sorted, 0.5), 3.0);
        assert_eq!(quantile_sorted(&[1.0, 2.0], 0.25), 1.25);
        assert!(quantile_sorted(&[], 0.5).is_nan());
    }

    #[test]
    fn diagnostics_flag_acceptance_and_failures() {
        let mut stuck = ChainState::new(vec![0.0], 0.0);
        let mut lively = ChainState::new(vec![0.0], 0.0);
        for _ in 0..10 {
            stuck.reject();
            stuck.record_evaluation(false);
            lively.accept(vec![1.0], -0.5);
            lively.record_evaluation(true);
        }
        let store = SampleStore::new(2, 1);
        let diag = Diagnostics::collect(&[stuck, lively], &store, (0.05, 0.8), 1.1).unwrap();
        assert_eq!(diag.acceptance_rates, vec![0.0, 1.0]);
        assert_eq!(diag.acceptance_rate, 0.5);
        assert_eq!(diag.numerical_failures, vec![10, 0]);
        assert_eq!(diag.evaluations, vec![10, 10]);
        assert!(diag.rhat.is_none());
        assert!(diag.warnings.contains(&ConvergenceWarning::LowAcceptance {
            chain: 0,
            rate: 0.0,
            threshold: 0.05
        }));
        assert!(diag.warnings.contains(&ConvergenceWarning::HighAcceptance {
            chain: 1,
            rate: 1.0,
            threshold: 0.8
        }));
        assert!(diag
            .warnings
            .contains(&ConvergenceWarning::NumericalFailures { chain: 0, count: 10 }));
        assert!(!diag.is_healthy());
    }

    #[test]
    fn diagnostics_report_rhat_for_separated_chains() {
        let mut store = SampleStore::new(2, 1);
        for k in 0..10 {
            let noise = if k % 2 == 0 { 0.1 } else { -0.1 };
            store.push(&[
                ChainState::new(vec![noise], 0.0),
                ChainState::new(vec![5.0 + noise], 0.0),
            ]);
        }
        let chains = vec![ChainState::new(vec![0.0], 0.0), ChainState::new(vec![5.0], 0.0)];
        let diag = Diagnostics::collect(&chains, &store, (0.05, 0.8), 1.1).unwrap();
        let rhat = diag.rhat.clone().unwrap();
        assert!(rhat[0] > 1.1);
        assert!(matches!(
            diag.warnings[0],
            ConvergenceWarning::PotentialScaleReduction { dim: 0, .. }
        ));
    }
}
