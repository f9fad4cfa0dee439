//! Checked access to the target log-density.
//!
//! The [`Evaluator`] is the only place where the engine calls into user code. It enforces
//! the state dimension, turns NaN and `+inf` results into [`McmcError::Numerical`] and,
//! when a timeout is configured, abandons evaluations that take too long.
//! A log-density of `-inf` is a legitimate "zero density" and is passed through.
//!
//! A timed evaluation costs one thread spawn. An abandoned worker is never joined; it
//! finishes whenever the target returns and its result is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::warn;
use ndarray::ArrayView2;

use crate::distributions::Target;
use crate::errors::{McmcError, Result};

#[derive(Debug)]
pub struct Evaluator<T: ?Sized> {
    target: Arc<T>,
    dim: usize,
    timeout: Option<Duration>,
    abandoned: AtomicU64,
}

impl<T: Target + ?Sized + 'static> Evaluator<T> {
    pub fn new(target: Arc<T>, dim: usize, timeout: Option<Duration>) -> Result<Self> {
        if let Some(d) = target.dim() {
            if d != dim {
                return Err(McmcError::Configuration(format!(
                    "target is defined on {d} dimensions but the sampler uses {dim}"
                )));
            }
        }
        if timeout == Some(Duration::ZERO) {
            return Err(McmcError::Configuration(
                "evaluation timeout must be positive".to_string(),
            ));
        }
        Ok(Self {
            target,
            dim,
            timeout,
            abandoned: AtomicU64::new(0),
        })
    }

    /// Timed evaluations given up on so far. Their worker threads may still be running.
    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn target(&self) -> &Arc<T> {
        &self.target
    }

    pub fn has_marginals(&self) -> bool {
        self.target.has_marginals()
    }

    /// Evaluates the joint log-density at `state`.
    pub fn evaluate(&self, state: &[f64]) -> Result<f64> {
        self.check_dim(state.len())?;
        let value = match self.timeout {
            None => self.target.unnorm_log_prob(state),
            Some(timeout) => {
                let target = Arc::clone(&self.target);
                let state = state.to_vec();
                self.run_with_timeout(timeout, move || target.unnorm_log_prob(&state))?
            }
        };
        check_value(value)
    }

    /// Evaluates the marginal log-density of component `index` at `value`.
    pub fn evaluate_marginal(&self, index: usize, value: f64) -> Result<f64> {
        if index >= self.dim {
            return Err(McmcError::InvalidState {
                expected: self.dim,
                found: index + 1,
            });
        }
        let result = match self.timeout {
            None => self.target.marginal_log_prob(index, value),
            Some(timeout) => {
                let target = Arc::clone(&self.target);
                self.run_with_timeout(timeout, move || target.marginal_log_prob(index, value))?
            }
        };
        let value = result.ok_or_else(|| {
            McmcError::Configuration(format!("target has no marginal for dimension {index}"))
        })?;
        check_value(value)
    }

    /// Evaluates one state per row; each row gets its own result.
    pub fn evaluate_batch(&self, states: ArrayView2<f64>) -> Vec<Result<f64>> {
        if states.ncols() != self.dim {
            let found = states.ncols();
            return (0..states.nrows())
                .map(|_| {
                    Err(McmcError::InvalidState {
                        expected: self.dim,
                        found,
                    })
                })
                .collect();
        }
        match self.timeout {
            None => self
                .target
                .unnorm_log_prob_batch(states)
                .into_iter()
                .map(check_value)
                .collect(),
            Some(_) => states
                .rows()
                .into_iter()
                .map(|row| self.evaluate(&row.to_vec()))
                .collect(),
        }
    }

    /// Runs `f` on a detached worker and waits at most `timeout` for its answer. A late
    /// answer is dropped together with the channel.
    fn run_with_timeout<R, F>(&self, timeout: Duration, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(f());
        });
        rx.recv_timeout(timeout).map_err(|err| match err {
            mpsc::RecvTimeoutError::Timeout => {
                if self.abandoned.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("target evaluation exceeded {timeout:?}; its worker thread is left running");
                }
                McmcError::Numerical(format!("target evaluation exceeded {timeout:?}"))
            }
            mpsc::RecvTimeoutError::Disconnected => {
                McmcError::Numerical("target evaluation panicked".to_string())
            }
        })
    }

    fn check_dim(&self, found: usize) -> Result<()> {
        if found != self.dim {
            return Err(McmcError::InvalidState {
                expected: self.dim,
                found,
            });
        }
        Ok(())
    }
}

fn check_value(value: f64) -> Result<f64> {
    if value.is_nan() {
        Err(McmcError::Numerical("target returned NaN".to_string()))
    } else if value == f64::INFINITY {
        Err(McmcError::Numerical("target returned +inf".to_string()))
    } else {
        Ok(value)
    }
}
