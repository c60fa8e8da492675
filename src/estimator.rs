//! Gradient estimator contract.
//!
//! A [`GradientEstimator`] produces one gradient sample per call to
//! [`GradientEstimator::grad`], reading minibatches from whichever cursor is
//! active. [`GradientEstimator::grad_estim`] runs `grad` against the
//! dedicated estimation cursor through an [`EstimationScope`], so training
//! data order is never disturbed by diagnostics.
//!
//! # Example
//!
//! ```
//! use candle_core::{Device, Tensor};
//! use grad_estim_rs::{EstimatorConfig, GradientEstimator, SgdEstimator};
//!
//! let device = Device::Cpu;
//! let model = vec![Tensor::zeros(3, candle_core::DType::F32, &device)?];
//! let batches = vec![1.0f64, 2.0, 3.0].into_iter();
//!
//! let mut estimator = SgdEstimator::new(
//!     batches,
//!     EstimatorConfig::default().with_num_random_indices(1),
//!     |params: &Vec<Tensor>, batch: f64| -> grad_estim_rs::Result<Vec<Tensor>> {
//!         Ok(vec![(params[0].ones_like()? * batch)?])
//!     },
//! )?;
//!
//! let dist = estimator.gradient_distribution(&model, 6)?;
//! assert!((dist.total_mean - 6.0).abs() < 1e-6);
//! # Ok::<(), grad_estim_rs::EstimError>(())
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use candle_core::Tensor;

use crate::config::EstimatorConfig;
use crate::data::{ActiveCursor, DataCursors, InfiniteLoader};
use crate::distribution::{self, EgeVariance, GradientDistribution};
use crate::error::{EstimError, Result};
use crate::model::ParameterSet;
use crate::normalize;
use crate::sampler::{IndexSampler, RandomIndex};

/// One gradient tensor per model parameter, in parameter order.
pub type GradientSample = Vec<Tensor>;

/// Persisted estimator state, keyed like a safetensors map.
pub type StateDict = HashMap<String, Tensor>;

/// State shared by every estimator: configuration, data cursors and the
/// index sampler cache.
#[derive(Debug, Clone)]
pub struct EstimatorCore<S> {
    config: EstimatorConfig,
    cursors: DataCursors<S>,
    sampler: IndexSampler,
}

impl<S: Iterator + Clone> EstimatorCore<S> {
    /// Create the core over a minibatch source.
    ///
    /// # Errors
    ///
    /// Returns [`EstimError::InvalidConfig`] if `config` does not validate.
    pub fn new(source: S, config: EstimatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sampler: IndexSampler::new(config.seed),
            cursors: DataCursors::new(source),
            config,
        })
    }

    /// Estimator configuration.
    #[must_use]
    pub const fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Both data cursors.
    #[must_use]
    pub const fn cursors(&self) -> &DataCursors<S> {
        &self.cursors
    }

    /// Both data cursors, mutably.
    pub fn cursors_mut(&mut self) -> &mut DataCursors<S> {
        &mut self.cursors
    }

    /// The currently active cursor; `grad` implementations read from here.
    pub fn data_iter(&mut self) -> &mut InfiniteLoader<S> {
        self.cursors.active_mut()
    }

    /// Next minibatch from the active cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is empty.
    pub fn next_batch(&mut self) -> Result<S::Item> {
        self.cursors.next_batch()
    }

    /// Rewind both cursors to the start of the source.
    pub fn init_data_iter(&mut self) {
        self.cursors.init_data_iter();
    }

    /// The index sampler.
    #[must_use]
    pub const fn sampler(&self) -> &IndexSampler {
        &self.sampler
    }

    /// The index sampler, mutably.
    pub fn sampler_mut(&mut self) -> &mut IndexSampler {
        &mut self.sampler
    }
}

/// Check that `sample` has one tensor per expected shape, shape for shape.
///
/// # Errors
///
/// Returns [`EstimError::DimensionMismatch`] on a count mismatch and
/// [`EstimError::ShapeMismatch`] on the first differing layer.
pub fn validate_sample(expected: &[Vec<usize>], sample: &[Tensor]) -> Result<()> {
    if expected.len() != sample.len() {
        return Err(EstimError::DimensionMismatch {
            expected: expected.len(),
            actual: sample.len(),
        });
    }
    for (layer, (shape, tensor)) in expected.iter().zip(sample).enumerate() {
        if shape.as_slice() != tensor.dims() {
            return Err(EstimError::ShapeMismatch {
                layer,
                expected: shape.clone(),
                actual: tensor.dims().to_vec(),
            });
        }
    }
    Ok(())
}

/// Source of stochastic gradient samples for a model `M`.
///
/// Implementors supply [`grad`](Self::grad); everything else is provided.
/// Every method takes `&mut self`, so the cursor swap performed by
/// [`grad_estim`](Self::grad_estim) cannot be observed by a second caller.
pub trait GradientEstimator<M: ParameterSet + ?Sized> {
    /// Iterator of minibatches feeding both cursors.
    type Source: Iterator + Clone;

    /// Shared estimator state.
    fn core(&self) -> &EstimatorCore<Self::Source>;

    /// Shared estimator state, mutably.
    fn core_mut(&mut self) -> &mut EstimatorCore<Self::Source>;

    /// One gradient sample computed from the active cursor.
    ///
    /// `in_place` allows the result to alias model buffers; it is a hint to
    /// implementations and is not enforced here.
    ///
    /// # Errors
    ///
    /// The default fails with [`EstimError::Unimplemented`].
    fn grad(&mut self, model: &M, in_place: bool) -> Result<GradientSample> {
        let _ = (model, in_place);
        Err(EstimError::Unimplemented("grad"))
    }

    /// One gradient sample computed from the estimation cursor.
    ///
    /// The training cursor is neither read nor advanced.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`grad`](Self::grad); the active cursor is
    /// restored either way.
    fn grad_estim(&mut self, model: &M) -> Result<GradientSample> {
        let mut scope = EstimationScope::<M, Self>::enter(self);
        GradientEstimator::<M>::grad(&mut *scope, model, false)
    }

    /// Flatten a sample and normalize it bucket by bucket.
    ///
    /// # Errors
    ///
    /// See [`normalize::flatten_and_normalize`].
    fn flatten_and_normalize(&self, gradient: &[Tensor]) -> Result<Vec<Tensor>> {
        let config = self.core().config();
        normalize::flatten_and_normalize(gradient, config.bucket_size, config.zero_norm)
    }

    /// Memoized inspection coordinates for `model`.
    ///
    /// # Errors
    ///
    /// See [`crate::sampler::sample_indices`].
    fn get_random_index(&mut self, model: &M, number: usize) -> Result<Vec<RandomIndex>> {
        let signature = model.shape_signature();
        Ok(self.core_mut().sampler_mut().get(&signature, number)?.to_vec())
    }

    /// Two-pass mean/variance estimate over `gviter` samples.
    ///
    /// # Errors
    ///
    /// See [`distribution::gradient_distribution`].
    fn gradient_distribution(&mut self, model: &M, gviter: usize) -> Result<GradientDistribution> {
        distribution::gradient_distribution(self, model, gviter)
    }

    /// Mean and variance at a single sampled coordinate.
    ///
    /// # Errors
    ///
    /// See [`distribution::ege_var`].
    fn ege_var(&mut self, model: &M, gviter: usize) -> Result<EgeVariance> {
        distribution::ege_var(self, model, gviter)
    }

    /// Estimator-specific state to persist. Empty for stateless estimators.
    fn state_dict(&self) -> StateDict {
        StateDict::new()
    }

    /// Restore state produced by [`state_dict`](Self::state_dict).
    ///
    /// # Errors
    ///
    /// Stateless estimators accept anything and never fail.
    fn load_state_dict(&mut self, state: StateDict) -> Result<()> {
        let _ = state;
        Ok(())
    }
}

/// Guard that keeps the estimation cursor active while alive.
///
/// Entering swaps the estimation cursor in; dropping restores whichever
/// cursor was active before, including on early return and unwind.
pub struct EstimationScope<'a, M: ParameterSet + ?Sized, E: GradientEstimator<M> + ?Sized> {
    estimator: &'a mut E,
    previous: ActiveCursor,
    _model: PhantomData<fn(&M)>,
}

impl<'a, M, E> EstimationScope<'a, M, E>
where
    M: ParameterSet + ?Sized,
    E: GradientEstimator<M> + ?Sized,
{
    /// Activate the estimation cursor of `estimator`.
    pub fn enter(estimator: &'a mut E) -> Self {
        let previous = estimator
            .core_mut()
            .cursors_mut()
            .activate(ActiveCursor::Estimation);
        Self {
            estimator,
            previous,
            _model: PhantomData,
        }
    }
}

impl<M, E> Deref for EstimationScope<'_, M, E>
where
    M: ParameterSet + ?Sized,
    E: GradientEstimator<M> + ?Sized,
{
    type Target = E;

    fn deref(&self) -> &E {
        self.estimator
    }
}

impl<M, E> DerefMut for EstimationScope<'_, M, E>
where
    M: ParameterSet + ?Sized,
    E: GradientEstimator<M> + ?Sized,
{
    fn deref_mut(&mut self) -> &mut E {
        self.estimator
    }
}

impl<M, E> Drop for EstimationScope<'_, M, E>
where
    M: ParameterSet + ?Sized,
    E: GradientEstimator<M> + ?Sized,
{
    fn drop(&mut self) {
        self.estimator
            .core_mut()
            .cursors_mut()
            .activate(self.previous);
    }
}

/// Estimator without a gradient rule; `grad` always fails.
///
/// Useful for inspecting configuration and cursors, and as the zero point
/// that concrete estimators build on.
#[derive(Debug, Clone)]
pub struct BaseEstimator<S> {
    core: EstimatorCore<S>,
}

impl<S: Iterator + Clone> BaseEstimator<S> {
    /// Create a base estimator.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(source: S, config: EstimatorConfig) -> Result<Self> {
        Ok(Self {
            core: EstimatorCore::new(source, config)?,
        })
    }
}

impl<M, S> GradientEstimator<M> for BaseEstimator<S>
where
    M: ParameterSet + ?Sized,
    S: Iterator + Clone,
{
    type Source = S;

    fn core(&self) -> &EstimatorCore<S> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EstimatorCore<S> {
        &mut self.core
    }
}

/// Plain minibatch gradient estimator.
///
/// Each `grad` call takes the next minibatch from the active cursor and
/// hands it, with the model, to `grad_fn`.
pub struct SgdEstimator<S, F> {
    core: EstimatorCore<S>,
    grad_fn: F,
    grad_calls: usize,
}

impl<S: Iterator + Clone, F> SgdEstimator<S, F> {
    /// Create an estimator around a gradient function.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(source: S, config: EstimatorConfig, grad_fn: F) -> Result<Self> {
        Ok(Self {
            core: EstimatorCore::new(source, config)?,
            grad_fn,
            grad_calls: 0,
        })
    }

    /// Number of `grad` calls so far, from either cursor.
    #[must_use]
    pub const fn grad_calls(&self) -> usize {
        self.grad_calls
    }
}

impl<M, S, F> GradientEstimator<M> for SgdEstimator<S, F>
where
    M: ParameterSet + ?Sized,
    S: Iterator + Clone,
    F: FnMut(&M, S::Item) -> Result<GradientSample>,
{
    type Source = S;

    fn core(&self) -> &EstimatorCore<S> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EstimatorCore<S> {
        &mut self.core
    }

    fn grad(&mut self, model: &M, _in_place: bool) -> Result<GradientSample> {
        let batch = self.core.next_batch()?;
        let gradient = (self.grad_fn)(model, batch)?;
        self.grad_calls += 1;
        Ok(gradient)
    }
}
