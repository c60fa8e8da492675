//! Error types for gradient distribution estimation.

use thiserror::Error;

/// Result type alias for estimator operations.
pub type Result<T> = std::result::Result<T, EstimError>;

/// Errors that can occur while sampling or aggregating gradients.
#[derive(Debug, Error)]
pub enum EstimError {
    /// Operation that a concrete estimator must provide.
    #[error("unimplemented operation: {0} must be provided by a concrete estimator")]
    Unimplemented(&'static str),

    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Aggregation was asked to run zero iterations.
    #[error("invalid iteration count: gviter must be >= 1, got {0}")]
    InvalidIterationCount(usize),

    /// A bucket had zero L2 norm under the fail-fast policy.
    #[error("degenerate bucket {bucket}: L2 norm is zero")]
    DegenerateBucket {
        /// Bucket index in the normalized sequence.
        bucket: usize,
    },

    /// A cached index no longer fits the tensors it is applied to.
    #[error("stale index cache: index {index:?} does not fit layer {layer} with shape {shape:?}")]
    StaleIndexCache {
        /// Layer index stored in the cache.
        layer: usize,
        /// Coordinates stored in the cache.
        index: Vec<usize>,
        /// Current shape of that layer (empty if the layer is gone).
        shape: Vec<usize>,
    },

    /// Shape mismatch between a gradient and its accumulator.
    #[error("shape mismatch at layer {layer}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Layer index.
        layer: usize,
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Number of tensors in a sample differs from the number of accumulators.
    #[error("dimension mismatch: expected {expected} tensors, got {actual}")]
    DimensionMismatch {
        /// Expected count.
        expected: usize,
        /// Actual count.
        actual: usize,
    },

    /// Empty input where non-empty was required.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// Candle tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration (de)serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EstimError {
    /// Create an invalid config error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an empty input error.
    pub fn empty_input(msg: impl Into<String>) -> Self {
        Self::EmptyInput(msg.into())
    }
}
