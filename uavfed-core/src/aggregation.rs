//! Federated averaging.

use displaydoc::Display;
use thiserror::Error;

use crate::model::Weights;

/// Errors that prevent an aggregation.
#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum AggregationError {
    /// no models to aggregate
    Empty,
    /// {0} models but {1} aggregation weights
    LengthMismatch(usize, usize),
    /// model {index} has {actual} weights, expected {expected}
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    /// the aggregation weights sum up to zero
    ZeroWeight,
}

/// Computes the weighted average of `models`.
///
/// Every entry `i` of the result is `sum_k models[k][i] * weights[k] / sum_k weights[k]`.
///
/// # Errors
/// Fails if there are no models, if the models do not all have `dim` weights, or if the
/// aggregation weights sum up to zero.
pub fn federated_average(
    models: &[&Weights],
    weights: &[u64],
    dim: usize,
) -> Result<Weights, AggregationError> {
    if models.is_empty() {
        return Err(AggregationError::Empty);
    }
    if models.len() != weights.len() {
        return Err(AggregationError::LengthMismatch(models.len(), weights.len()));
    }
    if let Some((index, model)) = models.iter().enumerate().find(|(_, m)| m.len() != dim) {
        return Err(AggregationError::DimensionMismatch {
            index,
            expected: dim,
            actual: model.len(),
        });
    }

    let total_weight = weights.iter().sum::<u64>();
    if total_weight == 0 {
        return Err(AggregationError::ZeroWeight);
    }

    let mut res = Weights::zeros(dim);
    for (model, &weight) in models.iter().zip(weights) {
        let weight = weight as f64;
        for (res_w, model_w) in res.iter_mut().zip(model.iter()) {
            *res_w += model_w * weight;
        }
    }

    let total_weight = total_weight as f64;
    for w in res.iter_mut() {
        *w /= total_weight;
    }

    Ok(res)
}
