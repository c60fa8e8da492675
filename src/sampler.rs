//! Deterministic selection of coordinates to inspect.
//!
//! The layer range `[0, L)` is split into `number` contiguous sub-ranges;
//! one layer is drawn from each, then one coordinate per dimension of that
//! layer. Draws come from a local [`ChaCha8Rng`] seeded per computation, so
//! two samplers with the same seed agree and never disturb each other.

use candle_core::Tensor;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EstimError, Result};
use crate::model::ShapeSignature;

/// A `(layer, coord_0, coord_1, ...)` position inside a parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RandomIndex {
    /// Layer index in parameter order.
    pub layer: usize,
    /// One coordinate per dimension of the layer.
    pub coords: Vec<usize>,
}

impl RandomIndex {
    /// Create an index.
    #[must_use]
    pub fn new(layer: usize, coords: Vec<usize>) -> Self {
        Self { layer, coords }
    }

    /// Flat `(layer, coords...)` tuple form.
    #[must_use]
    pub fn as_tuple(&self) -> Vec<usize> {
        std::iter::once(self.layer)
            .chain(self.coords.iter().copied())
            .collect()
    }

    fn stale(&self, shape: &[usize]) -> EstimError {
        EstimError::StaleIndexCache {
            layer: self.layer,
            index: self.coords.clone(),
            shape: shape.to_vec(),
        }
    }

    /// Drill into `tensors[layer]` one coordinate at a time.
    ///
    /// Each step indexes the leading axis, which drops it, so the result is
    /// the 0-d element at this position.
    ///
    /// # Errors
    ///
    /// Returns [`EstimError::StaleIndexCache`] if the layer or any coordinate
    /// falls outside the current shapes.
    pub fn locate(&self, tensors: &[Tensor]) -> Result<Tensor> {
        let Some(layer) = tensors.get(self.layer) else {
            return Err(self.stale(&[]));
        };
        let shape = layer.dims();
        if shape.len() != self.coords.len()
            || self.coords.iter().zip(shape).any(|(c, d)| c >= d)
        {
            return Err(self.stale(shape));
        }

        let mut element = layer.clone();
        for &coord in &self.coords {
            element = element.get(coord)?;
        }
        Ok(element)
    }

    /// Element at this position as `f64`.
    ///
    /// # Errors
    ///
    /// See [`RandomIndex::locate`].
    pub fn value(&self, tensors: &[Tensor]) -> Result<f64> {
        Ok(self
            .locate(tensors)?
            .to_dtype(candle_core::DType::F64)?
            .to_scalar::<f64>()?)
    }
}

/// Draw one uniform coordinate per dimension of `shape`.
fn sample_coords(rng: &mut ChaCha8Rng, layer: usize, shape: &[usize]) -> Result<Vec<usize>> {
    shape
        .iter()
        .map(|&dim| {
            if dim == 0 {
                return Err(EstimError::empty_input(format!(
                    "layer {layer} has a zero-length dimension in shape {shape:?}"
                )));
            }
            Ok(rng.gen_range(0..dim))
        })
        .collect()
}

/// Stratified sampling of `number` indices over `shapes`.
///
/// Sub-range `i` is `[floor(i*L/number), floor((i+1)*L/number))`. When
/// `number` does not divide `L` the sub-ranges differ in length by one.
/// When `number > L` a sub-range can come out empty; it is widened to its
/// first layer, so several indices may share a layer.
///
/// # Errors
///
/// Returns [`EstimError::InvalidConfig`] if `number` is zero, and
/// [`EstimError::EmptyInput`] if there are no layers or a drawn layer has a
/// zero-length dimension.
pub fn sample_indices(shapes: &[Vec<usize>], number: usize, seed: u64) -> Result<Vec<RandomIndex>> {
    let num_layers = shapes.len();
    if number == 0 {
        return Err(EstimError::invalid_config("number of indices must be > 0"));
    }
    if num_layers == 0 {
        return Err(EstimError::empty_input("model has no parameters"));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut indices = Vec::with_capacity(number);

    for i in 0..number {
        let begin = i * num_layers / number;
        let end = ((i + 1) * num_layers / number).max(begin + 1);
        let layer = rng.gen_range(begin..end);
        let coords = sample_coords(&mut rng, layer, &shapes[layer])?;
        indices.push(RandomIndex::new(layer, coords));
    }

    Ok(indices)
}

/// Draw a single index: a uniform layer in `[0, L)` and a coordinate in it.
///
/// # Errors
///
/// Returns [`EstimError::EmptyInput`] if `shapes` is empty or the drawn
/// layer has a zero-length dimension.
pub fn sample_single(shapes: &[Vec<usize>], seed: u64) -> Result<RandomIndex> {
    if shapes.is_empty() {
        return Err(EstimError::empty_input("model has no parameters"));
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let layer = rng.gen_range(0..shapes.len());
    let coords = sample_coords(&mut rng, layer, &shapes[layer])?;
    Ok(RandomIndex::new(layer, coords))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheKey {
    number: usize,
    signature: ShapeSignature,
}

/// Memoizing index sampler.
///
/// Indices are cached under `(number, shape signature)`; asking with a
/// different count or for a different architecture recomputes them.
#[derive(Debug, Clone)]
pub struct IndexSampler {
    seed: u64,
    cache: Option<(CacheKey, Vec<RandomIndex>)>,
}

impl IndexSampler {
    /// Create a sampler with an empty cache.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { seed, cache: None }
    }

    /// Seed used for every computation.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Indices for `signature`, computed once per `(number, signature)`.
    ///
    /// # Errors
    ///
    /// See [`sample_indices`].
    pub fn get(&mut self, signature: &ShapeSignature, number: usize) -> Result<&[RandomIndex]> {
        let hit = self
            .cache
            .as_ref()
            .is_some_and(|(key, _)| key.number == number && &key.signature == signature);

        if !hit {
            if self.cache.is_some() {
                debug!("index cache invalidated (number={number}, layers={})", signature.num_layers());
            }
            let indices = sample_indices(signature.shapes(), number, self.seed)?;
            let key = CacheKey {
                number,
                signature: signature.clone(),
            };
            self.cache = Some((key, indices));
        }

        Ok(self
            .cache
            .as_ref()
            .map(|(_, indices)| indices.as_slice())
            .unwrap_or_default())
    }

    /// Cached indices, if any.
    #[must_use]
    pub fn cached(&self) -> Option<&[RandomIndex]> {
        self.cache.as_ref().map(|(_, indices)| indices.as_slice())
    }
}
