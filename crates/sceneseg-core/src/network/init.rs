//! Parameter initialisation.

use candle_core::{Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Standard deviation of every initial weight.
pub const WEIGHT_STDDEV: f64 = 0.02;

/// Samples beyond this many standard deviations are redrawn.
const TRUNCATION: f64 = 2.0;

/// Seeded source of truncated-normal samples.
pub struct TruncatedNormal {
    rng: StdRng,
    stddev: f64,
}

impl TruncatedNormal {
    #[must_use]
    pub fn new(seed: u64, stddev: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            stddev,
        }
    }

    /// Zero-mean sample bounded to `±2·stddev`.
    pub fn sample(&mut self) -> f32 {
        loop {
            let z: f64 = self.rng.sample(StandardNormal);
            if z.abs() <= TRUNCATION {
                return (z * self.stddev) as f32;
            }
        }
    }

    /// Fills a tensor of the given shape.
    pub fn tensor<S: Into<Shape>>(
        &mut self,
        shape: S,
        device: &Device,
    ) -> candle_core::Result<Tensor> {
        let shape = shape.into();
        let values: Vec<f32> = (0..shape.elem_count()).map(|_| self.sample()).collect();
        Tensor::from_vec(values, shape, device)
    }
}
