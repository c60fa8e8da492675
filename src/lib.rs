//! # grad-estim-rs
//!
//! Gradient-noise diagnostics for training runs: estimate the mean, variance
//! and signal-to-noise of stochastic minibatch gradients without disturbing
//! the training data stream.
//!
//! ## Key Properties
//!
//! - **Non-intrusive**: estimation draws from a dedicated data cursor, so the
//!   training cursor sees exactly the minibatches it would have seen anyway
//! - **Deterministic inspection**: coordinates are chosen by a locally seeded
//!   ChaCha RNG and memoized per `(count, architecture)`
//! - **Scale-free view**: gradients are also flattened into buckets and
//!   normalized to unit L2 norm before aggregation
//!
//! ## Quick Start
//!
//! Implement [`GradientEstimator::grad`] for your model, or wrap a gradient
//! function in [`SgdEstimator`]:
//!
//! ```ignore
//! use grad_estim_rs::{EstimatorConfig, GradientEstimator, SgdEstimator};
//!
//! let mut estimator = SgdEstimator::new(loader, EstimatorConfig::default(), |model, batch| {
//!     model.backward_on(&batch)
//! })?;
//!
//! let dist = estimator.gradient_distribution(&model, 50)?;
//! println!("{dist}");
//! for (snr, index) in dist.index_snr().iter().zip(&dist.indices) {
//!     println!("{:?}: snr={snr:.3}", index.as_tuple());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Estimator configuration
//! - [`data`]: Infinitely repeating minibatch cursors
//! - [`distribution`]: Two-pass mean/variance aggregation
//! - [`error`]: Error types and result alias
//! - [`estimator`]: The gradient estimator contract and estimation scope
//! - [`model`]: Read-only parameter view
//! - [`normalize`]: Flatten and bucket-normalize gradients
//! - [`sampler`]: Deterministic coordinate sampling

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod data;
pub mod distribution;
pub mod error;
pub mod estimator;
pub mod model;
pub mod normalize;
pub mod sampler;

// Re-export main types at crate root for convenience
pub use config::{EstimatorConfig, ZeroNormPolicy};
pub use data::{ActiveCursor, DataCursors, InfiniteLoader};
pub use distribution::{EgeVariance, GradientDistribution, EGE_VAR_PLACEHOLDER};
pub use error::{EstimError, Result};
pub use estimator::{
    BaseEstimator, EstimationScope, EstimatorCore, GradientEstimator, GradientSample,
    SgdEstimator, StateDict,
};
pub use model::{ParameterSet, ShapeSignature};
pub use normalize::flatten_and_normalize;
pub use sampler::{IndexSampler, RandomIndex};
