//! Configuration for gradient distribution estimation.
//!
//! [`EstimatorConfig`] carries every knob the aggregators read: the bucket
//! size used when normalizing flattened gradients, how many coordinates are
//! inspected at fine granularity, the seed for index sampling, and what to do
//! with an all-zero bucket.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EstimError, Result};

/// What to do when a normalized bucket has zero L2 norm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ZeroNormPolicy {
    /// Divide a zero-norm bucket by `eps`, so it stays all-zero. Buckets
    /// with any positive norm divide by that norm.
    Epsilon(f64),
    /// Fail with [`EstimError::DegenerateBucket`].
    Fail,
}

impl Default for ZeroNormPolicy {
    fn default() -> Self {
        Self::Epsilon(1e-12)
    }
}

/// Configuration for a gradient estimator.
///
/// # Example
///
/// ```
/// use grad_estim_rs::EstimatorConfig;
///
/// let config = EstimatorConfig::default()
///     .with_bucket_size(256)
///     .with_seed(7);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Number of consecutive layers concatenated into one normalized bucket.
    pub bucket_size: usize,

    /// Number of coordinates inspected by the distribution aggregator.
    pub num_random_indices: usize,

    /// Seed for the index sampler.
    pub seed: u64,

    /// Zero-norm bucket handling.
    #[serde(default)]
    pub zero_norm: ZeroNormPolicy,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            bucket_size: 1024,
            num_random_indices: 4,
            seed: 123,
            zero_norm: ZeroNormPolicy::default(),
        }
    }
}

impl EstimatorConfig {
    /// Set the bucket size.
    #[must_use]
    pub const fn with_bucket_size(mut self, bucket_size: usize) -> Self {
        self.bucket_size = bucket_size;
        self
    }

    /// Set the number of inspected coordinates.
    #[must_use]
    pub const fn with_num_random_indices(mut self, number: usize) -> Self {
        self.num_random_indices = number;
        self
    }

    /// Set the sampling seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the zero-norm policy.
    #[must_use]
    pub const fn with_zero_norm(mut self, policy: ZeroNormPolicy) -> Self {
        self.zero_norm = policy;
        self
    }

    /// Check that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`EstimError::InvalidConfig`] if the bucket size or index count
    /// is zero, or the epsilon floor is not a positive finite number.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_size == 0 {
            return Err(EstimError::invalid_config("bucket_size must be > 0"));
        }
        if self.num_random_indices == 0 {
            return Err(EstimError::invalid_config("num_random_indices must be > 0"));
        }
        if let ZeroNormPolicy::Epsilon(eps) = self.zero_norm {
            if !(eps.is_finite() && eps > 0.0) {
                return Err(EstimError::invalid_config(format!(
                    "zero-norm epsilon must be positive and finite, got {eps}"
                )));
            }
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or the values are invalid.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Write the configuration to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}
