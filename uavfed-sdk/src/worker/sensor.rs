use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, StandardNormal};
use uavfed_core::model::seeded_rng;

/// Simulates the sensors of a UAV. Every sample is a vector of independent standard normal
/// readings.
#[derive(Debug, Clone)]
pub struct SensorSampler {
    rng: ChaCha20Rng,
    feature_count: usize,
}

impl SensorSampler {
    pub fn new(feature_count: usize, seed: Option<u64>) -> Self {
        Self {
            rng: seeded_rng(seed),
            feature_count,
        }
    }

    pub fn sample(&mut self) -> Vec<f64> {
        let rng = &mut self.rng;
        (0..self.feature_count)
            .map(|_| StandardNormal.sample(&mut *rng))
            .collect()
    }
}
