//! Model representation and the simulated model used by both roles.
//!
//! Training is simulated: the model only carries a flat weight vector that local training
//! perturbs with a little gaussian noise. The accuracy reported after an aggregation comes from
//! an [`Evaluator`], which either mimics the random placeholder metric of a real deployment or
//! returns a fixed value for deterministic runs.

use std::{
    iter::FromIterator,
    slice::{Iter, IterMut},
};

use derive_more::{AsRef, From, Index, IndexMut, Into};
use rand::{distributions::Uniform, Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(
    Debug, Clone, Default, PartialEq, AsRef, From, Index, IndexMut, Into, Serialize, Deserialize,
)]
/// The flat weight vector of a model.
pub struct Weights(Vec<f64>);

#[allow(clippy::len_without_is_empty)]
impl Weights {
    /// Creates a weight vector of `len` zeros.
    pub fn zeros(len: usize) -> Self {
        Weights(vec![0.0; len])
    }

    /// Gets the number of weights.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> Iter<f64> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> IterMut<f64> {
        self.0.iter_mut()
    }
}

impl FromIterator<f64> for Weights {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        Weights(iter.into_iter().collect())
    }
}

impl IntoIterator for Weights {
    type Item = f64;
    type IntoIter = std::vec::IntoIter<f64>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("dimension mismatch: expected {expected} weights, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid input: expected {expected} features, got {actual}")]
    InvalidInput { expected: usize, actual: usize },
}

/// The outcome of a local training pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingOutcome {
    pub loss: f64,
    pub sample_count: u64,
}

/// The capabilities the coordinator and the workers need from a model.
pub trait Model {
    /// The number of weights. Fixed for the lifetime of the model.
    fn dim(&self) -> usize;

    fn weights(&self) -> &Weights;

    /// Replaces the weights.
    ///
    /// # Errors
    /// Fails without touching the model if `weights` does not have [`Model::dim()`] entries.
    fn set_weights(&mut self, weights: Weights) -> Result<(), ModelError>;

    /// Trains the model on `sample_count` samples.
    fn train(&mut self, sample_count: u64) -> TrainingOutcome;

    /// Scores the model, as if it were evaluated on `sample_count` samples.
    fn evaluate(&mut self, sample_count: u64) -> f64;

    /// Applies the model to a single input vector.
    ///
    /// # Errors
    /// Fails if the input does not have the expected number of features.
    fn predict(&self, input: &[f64]) -> Result<Vec<f64>, ModelError>;
}

/// Produces the accuracy of a model.
#[derive(Debug, Clone)]
pub enum Evaluator {
    /// Draws a random base accuracy in `[0.5, 1)` scaled by `1 - exp(-0.001 * n)`.
    Simulated(ChaCha20Rng),
    /// Always reports the same accuracy.
    Fixed(f64),
}

impl Evaluator {
    /// Creates a simulated evaluator. Without a seed, the generator is seeded from entropy.
    pub fn simulated(seed: Option<u64>) -> Self {
        Evaluator::Simulated(seeded_rng(seed))
    }

    pub fn fixed(accuracy: f64) -> Self {
        Evaluator::Fixed(accuracy)
    }

    pub fn evaluate(&mut self, sample_count: u64) -> f64 {
        match self {
            Evaluator::Simulated(rng) => {
                let base = rng.gen_range(0.5..1.0);
                base * (1.0 - (-0.001 * sample_count as f64).exp())
            }
            Evaluator::Fixed(accuracy) => *accuracy,
        }
    }
}

/// The shape of a [`SimulatedModel`]: a dense linear map from `input_size` features to
/// `output_size` outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelShape {
    pub input_size: usize,
    pub output_size: usize,
}

impl ModelShape {
    pub fn dim(&self) -> usize {
        self.input_size * self.output_size
    }
}

/// A linear model whose training only adds noise to the weights.
#[derive(Debug, Clone)]
pub struct SimulatedModel {
    shape: ModelShape,
    weights: Weights,
    rng: ChaCha20Rng,
    evaluator: Evaluator,
}

impl SimulatedModel {
    /// Creates a model with weights drawn uniformly from `[-0.1, 0.1)`.
    pub fn new(shape: ModelShape, seed: Option<u64>, evaluator: Evaluator) -> Self {
        let mut rng = seeded_rng(seed);
        let init = Uniform::new(-0.1, 0.1);
        let weights = (0..shape.dim()).map(|_| init.sample(&mut rng)).collect();
        Self {
            shape,
            weights,
            rng,
            evaluator,
        }
    }

    /// Creates a model with the given initial weights.
    ///
    /// # Errors
    /// Fails if the number of weights does not match the shape.
    pub fn with_weights(
        shape: ModelShape,
        weights: Weights,
        seed: Option<u64>,
        evaluator: Evaluator,
    ) -> Result<Self, ModelError> {
        check_dim(shape.dim(), &weights)?;
        Ok(Self {
            shape,
            weights,
            rng: seeded_rng(seed),
            evaluator,
        })
    }

    pub fn shape(&self) -> ModelShape {
        self.shape
    }
}

impl Model for SimulatedModel {
    fn dim(&self) -> usize {
        self.shape.dim()
    }

    fn weights(&self) -> &Weights {
        &self.weights
    }

    fn set_weights(&mut self, weights: Weights) -> Result<(), ModelError> {
        check_dim(self.dim(), &weights)?;
        self.weights = weights;
        Ok(())
    }

    fn train(&mut self, sample_count: u64) -> TrainingOutcome {
        // the standard deviation is a positive constant, so this can't fail
        if let Ok(noise) = Normal::new(0.0, 0.01) {
            for weight in self.weights.iter_mut() {
                *weight += noise.sample(&mut self.rng);
            }
        }
        TrainingOutcome {
            loss: 1.0 / (1.0 + 0.1 * sample_count as f64),
            sample_count,
        }
    }

    fn evaluate(&mut self, sample_count: u64) -> f64 {
        self.evaluator.evaluate(sample_count)
    }

    fn predict(&self, input: &[f64]) -> Result<Vec<f64>, ModelError> {
        let ModelShape {
            input_size,
            output_size,
        } = self.shape;
        if input.len() != input_size {
            return Err(ModelError::InvalidInput {
                expected: input_size,
                actual: input.len(),
            });
        }
        let output = (0..output_size)
            .map(|i| {
                input
                    .iter()
                    .enumerate()
                    .map(|(j, x)| x * self.weights[j * output_size + i])
                    .sum()
            })
            .collect();
        Ok(output)
    }
}

fn check_dim(expected: usize, weights: &Weights) -> Result<(), ModelError> {
    if weights.len() != expected {
        return Err(ModelError::DimensionMismatch {
            expected,
            actual: weights.len(),
        });
    }
    Ok(())
}

/// Creates a ChaCha generator from `seed`, or from entropy if there is no seed.
pub fn seeded_rng(seed: Option<u64>) -> ChaCha20Rng {
    match seed {
        Some(seed) => ChaCha20Rng::seed_from_u64(seed),
        None => ChaCha20Rng::from_entropy(),
    }
}
