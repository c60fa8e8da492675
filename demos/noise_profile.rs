//! Profile gradient noise of a toy linear regression.
//!
//! This example shows how to:
//! - Wrap a gradient function in an `SgdEstimator`
//! - Run both aggregators without disturbing the training cursor
//! - Read per-coordinate signal-to-noise
//!
//! Run with:
//! ```bash
//! RUST_LOG=grad_estim_rs=debug cargo run --example noise_profile
//! ```

use candle_core::{DType, Device, Tensor};
use grad_estim_rs::{EstimatorConfig, GradientEstimator, GradientSample, SgdEstimator};
use tracing_subscriber::EnvFilter;

/// Minibatch of `(x, y)` rows for `y = 2x + 1` plus deterministic jitter.
fn make_batches(device: &Device, count: usize, batch_size: usize) -> anyhow::Result<Vec<(Tensor, Tensor)>> {
    let mut batches = Vec::with_capacity(count);
    for b in 0..count {
        let xs: Vec<f32> = (0..batch_size)
            .map(|i| ((b * batch_size + i) % 17) as f32 / 17.0)
            .collect();
        let ys: Vec<f32> = xs
            .iter()
            .enumerate()
            .map(|(i, x)| 2.0 * x + 1.0 + 0.05 * (((b + i) % 5) as f32 - 2.0))
            .collect();
        batches.push((
            Tensor::from_vec(xs, batch_size, device)?,
            Tensor::from_vec(ys, batch_size, device)?,
        ));
    }
    Ok(batches)
}

/// Mean-squared-error gradient for parameters `[w (1,), b (1,)]`.
#[allow(clippy::ptr_arg)]
fn mse_grad(params: &Vec<Tensor>, (x, y): (Tensor, Tensor)) -> grad_estim_rs::Result<GradientSample> {
    let n = x.elem_count() as f64;
    let pred = x.broadcast_mul(&params[0])?.broadcast_add(&params[1])?;
    let residual = (pred - &y)?;
    let dw = ((&residual * &x)?.sum_all()? * (2.0 / n))?.reshape(1)?;
    let db = (residual.sum_all()? * (2.0 / n))?.reshape(1)?;
    Ok(vec![dw, db])
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let device = Device::Cpu;
    let model = vec![
        Tensor::new(&[0.5f32], &device)?,
        Tensor::zeros(1, DType::F32, &device)?,
    ];
    let batches = make_batches(&device, 32, 8)?;

    let config = EstimatorConfig::default().with_num_random_indices(2);
    let mut estimator = SgdEstimator::new(batches.into_iter(), config, mse_grad)?;

    // A couple of training-side draws, then diagnostics.
    for _ in 0..3 {
        estimator.grad(&model, false)?;
    }

    let dist = estimator.gradient_distribution(&model, 16)?;
    println!("{dist}");
    for ((index, mean), snr) in dist.indices.iter().zip(&dist.means).zip(dist.index_snr()) {
        println!("  {:?}: mean={mean:.5} snr={snr:.3}", index.as_tuple());
    }

    let ege = estimator.ege_var(&model, 16)?;
    println!(
        "single coordinate {:?}: mean={:.5} variance={:.6}",
        ege.index.as_tuple(),
        ege.mean,
        ege.variance
    );

    Ok(())
}
