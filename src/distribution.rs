//! Gradient distribution aggregation.
//!
//! [`gradient_distribution`] runs two passes of `gviter` freshly sampled
//! gradients each: the first accumulates the mean (raw per layer and
//! normalized per bucket), the second accumulates squared deviations from
//! that mean. The result is reduced to scalar totals plus the mean and
//! variance at a few memoized coordinates.
//!
//! Division by `gviter` is deliberately uneven. Means are divided; the
//! variance accumulators are not, so `total_variance_normalized` (and the
//! logged raw total) are sums of squared deviations, while the per-index
//! `variances` are divided by `gviter`.
//!
//! [`ege_var`] is the single-coordinate variant that samples its own index.

use std::fmt;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, info, trace};

use crate::error::{EstimError, Result};
use crate::estimator::{validate_sample, GradientEstimator, GradientSample};
use crate::model::ParameterSet;
use crate::normalize;
use crate::sampler::{self, RandomIndex};

/// Fourth element returned by [`ege_var`]. Carried over unchanged; it has no
/// derivation.
pub const EGE_VAR_PLACEHOLDER: f64 = 0.00034;

/// Summary of a two-pass gradient distribution estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientDistribution {
    /// Variance at each inspected coordinate, divided by `gviter`.
    pub variances: Vec<f64>,
    /// Mean at each inspected coordinate.
    pub means: Vec<f64>,
    /// Sum of all elements of the per-layer mean.
    pub total_mean: f64,
    /// Sum of squared deviations of the normalized buckets (not divided).
    pub total_variance_normalized: f64,
    /// Sum of all elements of the normalized bucket mean.
    pub total_mean_normalized: f64,
    /// Inspected coordinates, aligned with `means` and `variances`.
    pub indices: Vec<RandomIndex>,
}

impl GradientDistribution {
    /// `(variances, means, total_mean, total_variance_normalized, total_mean_normalized)`.
    #[must_use]
    pub fn into_tuple(self) -> (Vec<f64>, Vec<f64>, f64, f64, f64) {
        (
            self.variances,
            self.means,
            self.total_mean,
            self.total_variance_normalized,
            self.total_mean_normalized,
        )
    }

    /// Signal-to-noise `mean^2 / variance` at each inspected coordinate.
    ///
    /// Zero variance gives `inf` for a non-zero mean and `0` for a zero mean.
    #[must_use]
    pub fn index_snr(&self) -> Vec<f64> {
        self.means
            .iter()
            .zip(&self.variances)
            .map(|(&mean, &variance)| {
                let signal = mean * mean;
                if variance > 0.0 {
                    signal / variance
                } else if signal > 0.0 {
                    f64::INFINITY
                } else {
                    0.0
                }
            })
            .collect()
    }
}

impl fmt::Display for GradientDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Indices: {} | Total mean: {:.6} | Normalized mean: {:.6} | Normalized variance: {:.6}",
            self.indices.len(),
            self.total_mean,
            self.total_mean_normalized,
            self.total_variance_normalized
        )
    }
}

/// Mean and variance at one coordinate, from [`ege_var`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EgeVariance {
    /// Mean gradient at `index`.
    pub mean: f64,
    /// Variance at `index`, divided by `gviter`.
    pub variance: f64,
    /// Log signal-to-noise over the signal/noise accumulators.
    pub snr: f64,
    /// Always [`EGE_VAR_PLACEHOLDER`].
    pub placeholder: f64,
    /// The sampled coordinate.
    pub index: RandomIndex,
}

impl EgeVariance {
    /// `(Ege_at_index, var_e_at_index, snr_e, 0.00034)`.
    #[must_use]
    pub fn into_tuple(self) -> (f64, f64, f64, f64) {
        (self.mean, self.variance, self.snr, self.placeholder)
    }
}

fn check_gviter(gviter: usize) -> Result<()> {
    if gviter == 0 {
        return Err(EstimError::InvalidIterationCount(gviter));
    }
    Ok(())
}

fn zeros_like_all(tensors: &[Tensor]) -> Result<Vec<Tensor>> {
    Ok(tensors
        .iter()
        .map(Tensor::zeros_like)
        .collect::<candle_core::Result<Vec<_>>>()?)
}

/// `acc[i] += sample[i]`.
fn accumulate(acc: &mut [Tensor], sample: &[Tensor]) -> Result<()> {
    for (e, g) in acc.iter_mut().zip(sample) {
        *e = e.add(g)?;
    }
    Ok(())
}

/// `acc[i] += (sample[i] - mean[i])^2`.
fn accumulate_squared_deviation(acc: &mut [Tensor], sample: &[Tensor], mean: &[Tensor]) -> Result<()> {
    for ((e, g), m) in acc.iter_mut().zip(sample).zip(mean) {
        *e = e.add(&g.sub(m)?.sqr()?)?;
    }
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn divide_all(acc: &mut [Tensor], gviter: usize) -> Result<()> {
    for e in acc.iter_mut() {
        *e = (&*e / gviter as f64)?;
    }
    Ok(())
}

/// Sum of every element of every tensor, in `f64`.
fn total(tensors: &[Tensor]) -> Result<f64> {
    tensors.iter().try_fold(0.0, |sum, t| -> Result<f64> {
        Ok(sum + t.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()?)
    })
}

fn shapes_of(tensors: &[Tensor]) -> Vec<Vec<usize>> {
    tensors.iter().map(|t| t.dims().to_vec()).collect()
}

/// One estimation sample, checked against the model's layer shapes.
///
/// This is the only place samples are validated, so custom `grad`
/// implementations get the same checks as [`crate::SgdEstimator`].
fn draw_sample<M, E>(estimator: &mut E, model: &M, shapes: &[Vec<usize>]) -> Result<GradientSample>
where
    M: ParameterSet + ?Sized,
    E: GradientEstimator<M> + ?Sized,
{
    let gradient = estimator.grad_estim(model)?;
    validate_sample(shapes, &gradient)?;
    Ok(gradient)
}

/// Two-pass estimate of the gradient distribution of `model`.
///
/// Pass 1 draws `gviter` samples via
/// [`grad_estim`](GradientEstimator::grad_estim) and averages them, both
/// raw and bucket-normalized. Pass 2 draws `gviter` fresh samples and
/// accumulates `(g - mean)^2` against the pass-1 means. Means and variances
/// are then read at the estimator's memoized coordinates.
///
/// # Errors
///
/// Returns [`EstimError::InvalidIterationCount`] if `gviter` is zero,
/// [`EstimError::ShapeMismatch`] / [`EstimError::DimensionMismatch`] if a
/// sample does not match the model, and propagates sampling, normalization
/// and tensor errors.
pub fn gradient_distribution<M, E>(
    estimator: &mut E,
    model: &M,
    gviter: usize,
) -> Result<GradientDistribution>
where
    M: ParameterSet + ?Sized,
    E: GradientEstimator<M> + ?Sized,
{
    check_gviter(gviter)?;
    let _span = debug_span!("gradient_distribution", gviter).entered();

    let parameters = model.parameters();
    let shapes = shapes_of(&parameters);
    let bucket_size = estimator.core().config().bucket_size;
    let num_indices = estimator.core().config().num_random_indices;

    let mut mean_estimates = zeros_like_all(&parameters)?;
    let mut mean_estimates_normalized =
        zeros_like_all(&normalize::flatten_buckets(&parameters, bucket_size)?)?;
    let bucket_shapes = shapes_of(&mean_estimates_normalized);

    for i in 0..gviter {
        let gradient = draw_sample(estimator, model, &shapes)?;
        let normalized = estimator.flatten_and_normalize(&gradient)?;
        validate_sample(&bucket_shapes, &normalized)?;

        accumulate(&mut mean_estimates, &gradient)?;
        accumulate(&mut mean_estimates_normalized, &normalized)?;
        trace!("mean pass sample {}/{}", i + 1, gviter);
    }

    divide_all(&mut mean_estimates, gviter)?;
    divide_all(&mut mean_estimates_normalized, gviter)?;

    let number_of_weights = model.num_weights();
    debug!(
        "mean pass done: {} layers, {} buckets, {} weights",
        shapes.len(),
        bucket_shapes.len(),
        number_of_weights
    );

    let mut variance_estimates = zeros_like_all(&parameters)?;
    let mut variance_estimates_normalized = zeros_like_all(&mean_estimates_normalized)?;

    for i in 0..gviter {
        let gradient = draw_sample(estimator, model, &shapes)?;
        let normalized = estimator.flatten_and_normalize(&gradient)?;
        validate_sample(&bucket_shapes, &normalized)?;

        accumulate_squared_deviation(&mut variance_estimates, &gradient, &mean_estimates)?;
        accumulate_squared_deviation(
            &mut variance_estimates_normalized,
            &normalized,
            &mean_estimates_normalized,
        )?;
        trace!("variance pass sample {}/{}", i + 1, gviter);
    }

    let indices = estimator.get_random_index(model, num_indices)?;

    #[allow(clippy::cast_precision_loss)]
    let divisor = gviter as f64;
    let mut variances = Vec::with_capacity(indices.len());
    let mut means = Vec::with_capacity(indices.len());
    for index in &indices {
        variances.push(index.value(&variance_estimates)? / divisor);
        means.push(index.value(&mean_estimates)?);
    }

    let total_mean = total(&mean_estimates)?;
    let total_variance = total(&variance_estimates)?;
    let total_variance_normalized = total(&variance_estimates_normalized)?;
    let total_mean_normalized = total(&mean_estimates_normalized)?;
    debug!("raw total variance (undivided): {total_variance}");

    let distribution = GradientDistribution {
        variances,
        means,
        total_mean,
        total_variance_normalized,
        total_mean_normalized,
        indices,
    };
    info!("gradient distribution: {distribution}");
    Ok(distribution)
}

/// Mean and variance of the gradient at one freshly sampled coordinate.
///
/// The per-layer mean `Ege` is estimated from `gviter` samples, a single
/// coordinate is drawn with the estimator's seed (bypassing the index
/// cache), and a second pass of `gviter` samples accumulates squared
/// deviations. The signal and noise accumulators behind `snr` are never
/// fed, so `snr` is computed over zeros and comes out as `0`.
///
/// # Errors
///
/// Returns [`EstimError::InvalidIterationCount`] if `gviter` is zero and
/// propagates sampling and tensor errors.
pub fn ege_var<M, E>(estimator: &mut E, model: &M, gviter: usize) -> Result<EgeVariance>
where
    M: ParameterSet + ?Sized,
    E: GradientEstimator<M> + ?Sized,
{
    check_gviter(gviter)?;
    let _span = debug_span!("ege_var", gviter).entered();

    let parameters = model.parameters();
    let shapes = shapes_of(&parameters);

    let mut ege = zeros_like_all(&parameters)?;
    for i in 0..gviter {
        let gradient = draw_sample(estimator, model, &shapes)?;
        accumulate(&mut ege, &gradient)?;
        trace!("mean pass sample {}/{}", i + 1, gviter);
    }
    divide_all(&mut ege, gviter)?;

    let index = sampler::sample_single(&shapes, estimator.core().sampler().seed())?;

    let nw = model.num_weights();
    let mut var_e = zeros_like_all(&parameters)?;
    let es = zeros_like_all(&parameters)?;
    let en = zeros_like_all(&parameters)?;

    for i in 0..gviter {
        let gradient = draw_sample(estimator, model, &shapes)?;
        accumulate_squared_deviation(&mut var_e, &gradient, &ege)?;
        trace!("variance pass sample {}/{}", i + 1, gviter);
    }

    #[allow(clippy::cast_precision_loss)]
    let (divisor, nw) = (gviter as f64, nw as f64);
    let variance = index.value(&var_e)? / divisor;
    let mean = index.value(&ege)?;
    debug!("variance at {:?}: {variance}", index.as_tuple());

    let mut log_ratio = 0.0;
    let mut noise_ratio = 0.0;
    for (ss, nn) in es.iter().zip(&en) {
        let ss = ss.to_dtype(DType::F64)?;
        let nn = nn.to_dtype(DType::F64)?;
        log_ratio += ((&ss + 1e-10)?.log()? - (&nn + 1e-10)?.log()?)?
            .sum_all()?
            .to_scalar::<f64>()?;
        noise_ratio += nn.div(&(&ss + 1e-7)?)?.sum_all()?.to_scalar::<f64>()?;
    }
    let snr = log_ratio / nw;
    let nv = noise_ratio / nw;
    debug!("snr_e={snr} nv_e={nv}");

    Ok(EgeVariance {
        mean,
        variance,
        snr,
        placeholder: EGE_VAR_PLACEHOLDER,
        index,
    })
}
