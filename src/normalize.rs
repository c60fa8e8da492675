//! Flatten and bucket-normalize gradient samples.
//!
//! Each layer gradient is flattened, consecutive layers are grouped into
//! buckets of at most `bucket_size` layers, and every bucket is scaled to
//! unit L2 norm independently.

use candle_core::{DType, Tensor};

use crate::config::ZeroNormPolicy;
use crate::error::{EstimError, Result};

/// Number of buckets needed for `num_layers` layers: `ceil(L / bucket_size)`.
#[must_use]
pub const fn bucket_count(num_layers: usize, bucket_size: usize) -> usize {
    if bucket_size == 0 {
        return 0;
    }
    num_layers.div_ceil(bucket_size)
}

/// L2 norm of a tensor, computed in `f64`.
///
/// # Errors
///
/// Returns error if tensor operations fail.
pub fn l2_norm(tensor: &Tensor) -> Result<f64> {
    let sum_sq = tensor
        .to_dtype(DType::F64)?
        .sqr()?
        .sum_all()?
        .to_scalar::<f64>()?;
    Ok(sum_sq.sqrt())
}

/// Concatenate the flattened layers of each bucket without normalizing.
///
/// # Errors
///
/// Returns error if `bucket_size` is zero, `gradient` is empty, or a
/// tensor operation fails.
pub fn flatten_buckets(gradient: &[Tensor], bucket_size: usize) -> Result<Vec<Tensor>> {
    if bucket_size == 0 {
        return Err(EstimError::invalid_config("bucket_size must be > 0"));
    }
    if gradient.is_empty() {
        return Err(EstimError::empty_input("gradient sample has no tensors"));
    }

    let mut buckets = Vec::with_capacity(bucket_count(gradient.len(), bucket_size));
    for bucket in gradient.chunks(bucket_size) {
        let flattened = bucket
            .iter()
            .map(Tensor::flatten_all)
            .collect::<candle_core::Result<Vec<_>>>()?;
        buckets.push(Tensor::cat(&flattened, 0)?);
    }
    Ok(buckets)
}

/// Flatten `gradient` into buckets and scale each bucket to unit L2 norm.
///
/// Returns `ceil(L / bucket_size)` one-dimensional tensors that together
/// cover every element of `gradient` once, in order.
///
/// # Errors
///
/// Returns [`EstimError::DegenerateBucket`] for a zero-norm bucket under
/// [`ZeroNormPolicy::Fail`], and propagates the errors of [`flatten_buckets`].
pub fn flatten_and_normalize(
    gradient: &[Tensor],
    bucket_size: usize,
    policy: ZeroNormPolicy,
) -> Result<Vec<Tensor>> {
    let buckets = flatten_buckets(gradient, bucket_size)?;

    buckets
        .into_iter()
        .enumerate()
        .map(|(index, bucket)| {
            let norm = l2_norm(&bucket)?;
            // Any positive norm is used as is, however small.
            let divisor = match policy {
                _ if norm > 0.0 => norm,
                ZeroNormPolicy::Fail => {
                    return Err(EstimError::DegenerateBucket { bucket: index });
                }
                ZeroNormPolicy::Epsilon(eps) => eps,
            };
            Ok((bucket / divisor)?)
        })
        .collect()
}
