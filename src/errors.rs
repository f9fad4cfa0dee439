use thiserror::Error;

/// A result type for sampler construction and runs.
pub type Result<T> = std::result::Result<T, McmcError>;

/// Errors raised by the samplers.
///
/// Configuration problems are reported when a sampler is built and abort construction.
/// `Numerical` errors are produced per candidate by the target evaluator; the engine turns
/// them into rejections and counts them instead of propagating them out of a run.
#[derive(Error, Debug)]
pub enum McmcError {
    /// Inconsistent or incomplete sampler setup
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// A state does not have the expected number of dimensions
    #[error("Invalid state: expected dimension {expected}, found {found}")]
    InvalidState { expected: usize, found: usize },
    /// The target produced NaN or +inf, or did not answer in time
    #[error("Numerical error: {0}")]
    Numerical(String),
    /// When the dedicated worker pool cannot be built
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl From<ndarray::ShapeError> for McmcError {
    fn from(err: ndarray::ShapeError) -> Self {
        McmcError::Configuration(format!("Shape mismatch: {err}"))
    }
}
