//! Integration tests for grad-estim-rs.
//!
//! These tests drive the full estimator pipeline: cursor handling, gradient
//! sampling, bucket normalization, index sampling and both aggregators.

use std::panic::{self, AssertUnwindSafe};

use candle_core::{DType, Device, Tensor};
use grad_estim_rs::{
    flatten_and_normalize, ActiveCursor, EstimError, EstimatorConfig, EstimatorCore,
    GradientEstimator, GradientSample, ParameterSet, Result, SgdEstimator, ZeroNormPolicy,
};

/// Two layers with shapes `(2,)` and `(3, 3)`.
fn create_model(device: &Device) -> Vec<Tensor> {
    vec![
        Tensor::zeros(2, DType::F32, device).unwrap(),
        Tensor::zeros((3, 3), DType::F32, device).unwrap(),
    ]
}

/// Deterministic gradient for minibatch `k`, flattened per layer.
fn sequence_values(k: u32) -> (Vec<f64>, Vec<f64>) {
    let k = f64::from(k);
    let layer0 = vec![1.0 + k, -1.0];
    let layer1 = (0..9).map(|j| (k % 3.0) + 0.5 * f64::from(j)).collect();
    (layer0, layer1)
}

#[allow(clippy::ptr_arg)]
fn sequence_grad(params: &Vec<Tensor>, k: u32) -> Result<GradientSample> {
    let device = params[0].device();
    let (layer0, layer1) = sequence_values(k);
    Ok(vec![
        Tensor::from_vec(layer0, 2, device)?.to_dtype(DType::F32)?,
        Tensor::from_vec(layer1, (3, 3), device)?.to_dtype(DType::F32)?,
    ])
}

#[allow(clippy::ptr_arg)]
fn constant_grad(params: &Vec<Tensor>, _k: u32) -> Result<GradientSample> {
    sequence_grad(params, 7)
}

fn flat_values(k: u32) -> Vec<f64> {
    let (mut layer0, layer1) = sequence_values(k);
    layer0.extend(layer1);
    layer0
}

/// Per-element mean and population variance over minibatches `0..n`.
fn expected_moments(n: u32) -> (Vec<f64>, Vec<f64>) {
    let samples: Vec<Vec<f64>> = (0..n).map(flat_values).collect();
    let count = f64::from(n);
    let width = samples[0].len();

    let mean: Vec<f64> = (0..width)
        .map(|j| samples.iter().map(|s| s[j]).sum::<f64>() / count)
        .collect();
    let variance = (0..width)
        .map(|j| {
            samples
                .iter()
                .map(|s| (s[j] - mean[j]).powi(2))
                .sum::<f64>()
                / count
        })
        .collect();
    (mean, variance)
}

/// Position of a `(layer, coords...)` index in the flattened vector.
fn flat_position(layer: usize, coords: &[usize]) -> usize {
    match layer {
        0 => coords[0],
        _ => 2 + coords[0] * 3 + coords[1],
    }
}

#[test]
fn test_end_to_end_sequence() {
    let device = Device::Cpu;
    let model = create_model(&device);
    let mut estimator =
        SgdEstimator::new(0..10u32, EstimatorConfig::default(), sequence_grad).unwrap();

    let dist = estimator.gradient_distribution(&model, 10).unwrap();
    let (mean, variance) = expected_moments(10);

    let expected_total: f64 = mean.iter().sum();
    assert!(
        (dist.total_mean - expected_total).abs() < 1e-4,
        "total_mean {} != {expected_total}",
        dist.total_mean
    );

    // One bucket holds both layers; average the unit-normalized vectors.
    let expected_normalized: f64 = (0..10)
        .map(|k| {
            let v = flat_values(k);
            let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
            v.iter().sum::<f64>() / norm
        })
        .sum::<f64>()
        / 10.0;
    assert!((dist.total_mean_normalized - expected_normalized).abs() < 1e-4);

    assert_eq!(dist.means.len(), 4);
    assert_eq!(dist.variances.len(), 4);
    for ((index, m), v) in dist.indices.iter().zip(&dist.means).zip(&dist.variances) {
        let pos = flat_position(index.layer, &index.coords);
        assert!((m - mean[pos]).abs() < 1e-4, "mean at {:?}", index.as_tuple());
        assert!((v - variance[pos]).abs() < 1e-3, "variance at {:?}", index.as_tuple());
    }

    // 10 mean samples + 10 variance samples, all from the estimation cursor.
    assert_eq!(estimator.grad_calls(), 20);
}

#[test]
fn test_constant_source_statistics() {
    let device = Device::Cpu;
    let model = create_model(&device);
    let g0 = constant_grad(&model, 0).unwrap();
    let expected_total: f64 = flat_values(7).iter().sum();

    for gviter in [1, 3, 8] {
        let mut estimator =
            SgdEstimator::new(0..5u32, EstimatorConfig::default(), constant_grad).unwrap();
        let dist = estimator.gradient_distribution(&model, gviter).unwrap();

        assert!((dist.total_mean - expected_total).abs() < 1e-4);
        assert!(dist.variances.iter().all(|v| v.abs() < 1e-10));
        assert!(dist.total_variance_normalized.abs() < 1e-10);
        for (index, mean) in dist.indices.iter().zip(&dist.means) {
            assert!((index.value(&g0).unwrap() - mean).abs() < 1e-5);
        }
    }
}

#[test]
fn test_single_iteration_is_exact() {
    let device = Device::Cpu;
    let model = create_model(&device);
    let g0 = constant_grad(&model, 0).unwrap();
    let mut estimator =
        SgdEstimator::new(0..5u32, EstimatorConfig::default(), constant_grad).unwrap();

    let dist = estimator.gradient_distribution(&model, 1).unwrap();
    for ((index, mean), variance) in dist.indices.iter().zip(&dist.means).zip(&dist.variances) {
        assert_eq!(*mean, index.value(&g0).unwrap());
        assert_eq!(*variance, 0.0);
    }
}

#[test]
fn test_bucketed_normalization_totals() {
    let device = Device::Cpu;
    let model = create_model(&device);
    let config = EstimatorConfig::default().with_bucket_size(1);
    let mut estimator = SgdEstimator::new(0..5u32, config, constant_grad).unwrap();

    let dist = estimator.gradient_distribution(&model, 4).unwrap();

    // Two buckets, each normalized on its own.
    let (layer0, layer1) = sequence_values(7);
    let bucket_sum = |v: &[f64]| v.iter().sum::<f64>() / v.iter().map(|x| x * x).sum::<f64>().sqrt();
    let expected = bucket_sum(&layer0) + bucket_sum(&layer1);
    assert!((dist.total_mean_normalized - expected).abs() < 1e-4);
}

#[test]
fn test_flatten_and_normalize_properties() {
    let device = Device::Cpu;
    let gradient = vec![
        Tensor::randn(0.0f32, 1.0, (4, 5), &device).unwrap(),
        Tensor::randn(0.0f32, 1.0, 7, &device).unwrap(),
        Tensor::randn(0.0f32, 1.0, (2, 3, 2), &device).unwrap(),
    ];

    for bucket_size in [1, 2, 1024] {
        let buckets = flatten_and_normalize(&gradient, bucket_size, ZeroNormPolicy::Fail).unwrap();
        assert_eq!(buckets.len(), 3usize.div_ceil(bucket_size));

        let mut restored = Vec::new();
        for (bucket, layers) in buckets.iter().zip(gradient.chunks(bucket_size)) {
            let values: Vec<f32> = bucket.to_vec1().unwrap();
            let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);

            let original: Vec<f32> = layers
                .iter()
                .flat_map(|l| l.flatten_all().unwrap().to_vec1::<f32>().unwrap())
                .collect();
            let original_norm = original.iter().map(|x| x * x).sum::<f32>().sqrt();
            for (v, o) in values.iter().zip(&original) {
                assert!((v * original_norm - o).abs() < 1e-4);
            }
            restored.extend(original);
        }

        let full: Vec<f32> = gradient
            .iter()
            .flat_map(|l| l.flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect();
        assert_eq!(restored, full);
    }
}

#[test]
fn test_random_index_memoized_and_bounded() {
    let device = Device::Cpu;
    let model = vec![
        Tensor::zeros((4, 3), DType::F32, &device).unwrap(),
        Tensor::zeros(6, DType::F32, &device).unwrap(),
        Tensor::zeros((2, 2, 2), DType::F32, &device).unwrap(),
        Tensor::zeros(5, DType::F32, &device).unwrap(),
        Tensor::zeros((1, 9), DType::F32, &device).unwrap(),
    ];
    let mut estimator = SgdEstimator::new(
        0..3u32,
        EstimatorConfig::default(),
        |params: &Vec<Tensor>, _: u32| -> Result<GradientSample> {
            params.iter().map(|p| -> Result<Tensor> { Ok(p.zeros_like()?) }).collect()
        },
    )
    .unwrap();

    let first = estimator.get_random_index(&model, 4).unwrap();
    let second = estimator.get_random_index(&model, 4).unwrap();
    assert_eq!(first, second);

    let shapes = model.shapes();
    for index in &first {
        assert!(index.layer < model.num_layers());
        let shape = &shapes[index.layer];
        assert_eq!(index.coords.len(), shape.len());
        assert!(index.coords.iter().zip(shape).all(|(c, d)| c < d));
    }

    // A different count is a different cache key.
    assert_eq!(estimator.get_random_index(&model, 2).unwrap().len(), 2);
    // And returning to the first key reproduces the first draw.
    assert_eq!(estimator.get_random_index(&model, 4).unwrap(), first);
}

#[test]
fn test_grad_estim_preserves_training_cursor() {
    let device = Device::Cpu;
    let model = create_model(&device);

    let mut reference =
        SgdEstimator::new(0..6u32, EstimatorConfig::default(), sequence_grad).unwrap();
    let mut probed =
        SgdEstimator::new(0..6u32, EstimatorConfig::default(), sequence_grad).unwrap();

    for step in 0..9 {
        let expected = reference.grad(&model, false).unwrap();
        for _ in 0..step {
            probed.grad_estim(&model).unwrap();
        }
        if step == 4 {
            probed.gradient_distribution(&model, 3).unwrap();
        }
        let actual = probed.grad(&model, false).unwrap();

        for (e, a) in expected.iter().zip(&actual) {
            let diff = (e - a).unwrap().abs().unwrap().sum_all().unwrap();
            assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0, "step {step}");
        }
    }
}

/// Estimator that panics mid-`grad`, to check the cursor is still restored.
struct PanickingEstimator {
    core: EstimatorCore<std::ops::Range<u32>>,
}

impl GradientEstimator<Vec<Tensor>> for PanickingEstimator {
    type Source = std::ops::Range<u32>;

    fn core(&self) -> &EstimatorCore<Self::Source> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EstimatorCore<Self::Source> {
        &mut self.core
    }

    fn grad(&mut self, _model: &Vec<Tensor>, _in_place: bool) -> Result<GradientSample> {
        let batch = self.core.data_iter().next_batch()?;
        panic!("gradient blew up on minibatch {batch}");
    }
}

#[test]
fn test_cursor_restored_after_panic() {
    let model = create_model(&Device::Cpu);
    let mut estimator = PanickingEstimator {
        core: EstimatorCore::new(0..4, EstimatorConfig::default()).unwrap(),
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| estimator.grad_estim(&model)));
    assert!(outcome.is_err());

    let cursors = estimator.core.cursors();
    assert_eq!(cursors.active(), ActiveCursor::Training);
    assert_eq!(cursors.data_iter().batches_served(), 0);
    assert_eq!(cursors.estim_iter().batches_served(), 1);
}

#[test]
fn test_ege_var_end_to_end() {
    let device = Device::Cpu;
    let model = create_model(&device);
    let mut estimator =
        SgdEstimator::new(0..10u32, EstimatorConfig::default(), sequence_grad).unwrap();

    let result = estimator.ege_var(&model, 10).unwrap();
    let (mean, variance) = expected_moments(10);
    let pos = flat_position(result.index.layer, &result.index.coords);

    assert!((result.mean - mean[pos]).abs() < 1e-4);
    assert!((result.variance - variance[pos]).abs() < 1e-3);
    assert_eq!(result.snr, 0.0);

    let (_, _, _, placeholder) = result.into_tuple();
    assert_eq!(placeholder, grad_estim_rs::EGE_VAR_PLACEHOLDER);
}

#[test]
fn test_empty_source_fails_fast() {
    let model = create_model(&Device::Cpu);
    let mut estimator = SgdEstimator::new(
        std::iter::empty::<u32>(),
        EstimatorConfig::default(),
        sequence_grad,
    )
    .unwrap();

    assert!(matches!(
        estimator.gradient_distribution(&model, 2),
        Err(EstimError::EmptyInput(_))
    ));
}

#[test]
fn test_degenerate_bucket_policy() {
    let model = create_model(&Device::Cpu);
    let zero_grad = |params: &Vec<Tensor>, _: u32| -> Result<GradientSample> {
        params.iter().map(|p| -> Result<Tensor> { Ok(p.zeros_like()?) }).collect()
    };

    let config = EstimatorConfig::default().with_zero_norm(ZeroNormPolicy::Fail);
    let mut strict = SgdEstimator::new(0..3u32, config, zero_grad).unwrap();
    assert!(matches!(
        strict.gradient_distribution(&model, 2),
        Err(EstimError::DegenerateBucket { bucket: 0 })
    ));

    let mut lenient = SgdEstimator::new(0..3u32, EstimatorConfig::default(), zero_grad).unwrap();
    let dist = lenient.gradient_distribution(&model, 2).unwrap();
    assert_eq!(dist.total_mean_normalized, 0.0);
    assert_eq!(dist.total_mean, 0.0);
}
