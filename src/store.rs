//! Storage for recorded samples.
//!
//! Samples are kept in a flat buffer laid out as `[sample][chain][dimension]`, next to a
//! `[sample][chain]` buffer of log-target values. The buffer may hold reserved capacity, but
//! every view stops at the logical length `nsamples_per_chain`, so readers never observe
//! unfilled rows.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3};

use crate::core::ChainState;
use crate::errors::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct SampleStore {
    n_chains: usize,
    dim: usize,
    nsamples_per_chain: usize,
    samples: Vec<f64>,
    log_targets: Vec<f64>,
}

impl SampleStore {
    pub fn new(n_chains: usize, dim: usize) -> Self {
        Self {
            n_chains,
            dim,
            nsamples_per_chain: 0,
            samples: Vec::new(),
            log_targets: Vec::new(),
        }
    }

    /// Reserves room for `additional` more samples per chain.
    pub fn reserve(&mut self, additional: usize) {
        self.samples.reserve(additional * self.n_chains * self.dim);
        self.log_targets.reserve(additional * self.n_chains);
    }

    /// Appends the current state of every chain as one sample row.
    pub fn push(&mut self, chains: &[ChainState]) {
        debug_assert_eq!(chains.len(), self.n_chains);
        for chain in chains {
            self.samples.extend_from_slice(chain.position());
            self.log_targets.push(chain.log_target());
        }
        self.nsamples_per_chain += 1;
    }

    pub fn nsamples_per_chain(&self) -> usize {
        self.nsamples_per_chain
    }

    pub fn n_chains(&self) -> usize {
        self.n_chains
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.nsamples_per_chain == 0
    }

    /// One sample row (all chains, all dimensions) as a flat slice.
    pub fn row(&self, sample: usize) -> Option<&[f64]> {
        (sample < self.nsamples_per_chain).then(|| {
            let width = self.n_chains * self.dim;
            &self.samples[sample * width..(sample + 1) * width]
        })
    }

    /// Recorded samples shaped `[nsamples_per_chain, n_chains, dim]`.
    pub fn samples_view(&self) -> Result<ArrayView3<f64>> {
        let len = self.nsamples_per_chain * self.n_chains * self.dim;
        Ok(ArrayView3::from_shape(
            (self.nsamples_per_chain, self.n_chains, self.dim),
            &self.samples[..len],
        )?)
    }

    pub fn samples(&self) -> Result<Array3<f64>> {
        Ok(self.samples_view()?.to_owned())
    }

    /// Recorded log-target values shaped `[nsamples_per_chain, n_chains]`.
    pub fn log_targets_view(&self) -> Result<ArrayView2<f64>> {
        let len = self.nsamples_per_chain * self.n_chains;
        Ok(ArrayView2::from_shape(
            (self.nsamples_per_chain, self.n_chains),
            &self.log_targets[..len],
        )?)
    }

    pub fn log_targets(&self) -> Result<Array2<f64>> {
        Ok(self.log_targets_view()?.to_owned())
    }

    /// All samples of one chain, shaped `[nsamples_per_chain, dim]`.
    pub fn chain(&self, chain: usize) -> Result<Array2<f64>> {
        let view = self.samples_view()?;
        Ok(view.index_axis(ndarray::Axis(1), chain).to_owned())
    }

    /// Samples with the chain axis folded into the sample axis, shaped
    /// `[nsamples_per_chain * n_chains, dim]`, in recording order.
    pub fn flat_samples(&self) -> Result<Array2<f64>> {
        let len = self.nsamples_per_chain * self.n_chains * self.dim;
        Ok(Array2::from_shape_vec(
            (self.nsamples_per_chain * self.n_chains, self.dim),
            self.samples[..len].to_vec(),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, s};

    fn chains(values: &[[f64; 2]]) -> Vec<ChainState> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| ChainState::new(v.to_vec(), -(i as f64)))
            .collect()
    }

    #[test]
    fn empty_store_has_empty_views() {
        let mut store = SampleStore::new(3, 2);
        store.reserve(100);
        assert!(store.is_empty());
        assert_eq!(store.samples().unwrap().shape(), &[0, 3, 2]);
        assert_eq!(store.log_targets().unwrap().shape(), &[0, 3]);
        assert!(store.row(0).is_none());
    }

    #[test]
    fn views_follow_logical_length() {
        let mut store = SampleStore::new(2, 2);
        store.reserve(10);
        store.push(&chains(&[[1.0, 2.0], [3.0, 4.0]]));
        store.push(&chains(&[[5.0, 6.0], [7.0, 8.0]]));

        assert_eq!(store.nsamples_per_chain(), 2);
        let samples = store.samples().unwrap();
        assert_eq!(samples.shape(), &[2, 2, 2]);
        assert_eq!(samples.slice(s![1, 0, ..]).to_vec(), vec![5.0, 6.0]);
        assert_eq!(store.chain(1).unwrap(), arr2(&[[3.0, 4.0], [7.0, 8.0]]));
        assert_eq!(store.log_targets().unwrap(), arr2(&[[0.0, -1.0], [0.0, -1.0]]));
        assert_eq!(store.row(1).unwrap(), &[5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn flat_view_interleaves_chains() {
        let mut store = SampleStore::new(2, 2);
        store.push(&chains(&[[1.0, 2.0], [3.0, 4.0]]));
        store.push(&chains(&[[5.0, 6.0], [7.0, 8.0]]));
        let flat = store.flat_samples().unwrap();
        assert_eq!(
            flat,
            arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0], [7.0, 8.0]])
        );
    }
}
