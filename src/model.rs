//! Read-only view over a model's trainable parameters.
//!
//! The estimator never mutates parameters; it only needs their order,
//! shapes and element counts to size accumulators and sample coordinates.

use candle_core::Tensor;

/// Ordered list of per-layer shapes describing a model architecture.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ShapeSignature(Vec<Vec<usize>>);

impl ShapeSignature {
    /// Build a signature from per-layer shapes.
    #[must_use]
    pub fn new(shapes: Vec<Vec<usize>>) -> Self {
        Self(shapes)
    }

    /// Build a signature from tensors.
    #[must_use]
    pub fn of(tensors: &[Tensor]) -> Self {
        Self(tensors.iter().map(|t| t.dims().to_vec()).collect())
    }

    /// Per-layer shapes.
    #[must_use]
    pub fn shapes(&self) -> &[Vec<usize>] {
        &self.0
    }

    /// Number of layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.0.len()
    }

    /// Total scalar count across all layers.
    #[must_use]
    pub fn num_weights(&self) -> usize {
        self.0.iter().map(|s| s.iter().product::<usize>()).sum()
    }
}

/// A model exposing its parameters as an ordered, fixed-length sequence.
///
/// `parameters()` must return the same order on every call within a run.
/// Candle tensors are reference counted, so returning owned handles is cheap.
pub trait ParameterSet {
    /// Parameters in stable order, one tensor per layer.
    fn parameters(&self) -> Vec<Tensor>;

    /// Per-layer shapes.
    fn shapes(&self) -> Vec<Vec<usize>> {
        self.parameters().iter().map(|p| p.dims().to_vec()).collect()
    }

    /// Number of parameter tensors.
    fn num_layers(&self) -> usize {
        self.parameters().len()
    }

    /// Total number of scalar weights.
    fn num_weights(&self) -> usize {
        self.parameters().iter().map(Tensor::elem_count).sum()
    }

    /// Architecture fingerprint.
    fn shape_signature(&self) -> ShapeSignature {
        ShapeSignature::of(&self.parameters())
    }
}

impl ParameterSet for [Tensor] {
    fn parameters(&self) -> Vec<Tensor> {
        self.to_vec()
    }
}

impl ParameterSet for Vec<Tensor> {
    fn parameters(&self) -> Vec<Tensor> {
        self.clone()
    }
}

impl ParameterSet for [(String, Tensor)] {
    fn parameters(&self) -> Vec<Tensor> {
        self.iter().map(|(_, t)| t.clone()).collect()
    }
}

impl ParameterSet for Vec<(String, Tensor)> {
    fn parameters(&self) -> Vec<Tensor> {
        self.as_slice().parameters()
    }
}
