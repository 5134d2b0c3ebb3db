//! Settings shared by the coordinator and the workers.
//!
//! Both roles must agree on the model shape, so both configuration files carry the same
//! `[model]` section.

use serde::Deserialize;
use validator::{Validate, ValidationError};

use crate::model::{Evaluator, ModelShape, SimulatedModel};

#[derive(Debug, Clone, PartialEq, Eq, Validate, Deserialize)]
#[validate(schema(function = "validate_model"))]
/// Model settings.
pub struct ModelSettings {
    /// The number of input features of the model.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [model]
    /// input_size = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_MODEL__INPUT_SIZE=10
    /// ```
    #[serde(default = "default_input_size")]
    pub input_size: usize,

    /// The number of outputs of the model.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [model]
    /// output_size = 2
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_MODEL__OUTPUT_SIZE=2
    /// ```
    #[serde(default = "default_output_size")]
    pub output_size: usize,

    /// The seed of the random generator used for the initial weights and the training noise.
    /// Seeded from entropy if missing.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [model]
    /// seed = 42
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_MODEL__SEED=42
    /// ```
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            input_size: default_input_size(),
            output_size: default_output_size(),
            seed: None,
        }
    }
}

fn default_input_size() -> usize {
    10
}

fn default_output_size() -> usize {
    2
}

impl ModelSettings {
    pub fn shape(&self) -> ModelShape {
        ModelShape {
            input_size: self.input_size,
            output_size: self.output_size,
        }
    }

    /// Builds a freshly initialized model.
    pub fn model(&self, evaluation: &EvaluationSettings) -> SimulatedModel {
        SimulatedModel::new(self.shape(), self.seed, evaluation.evaluator())
    }

    fn validate_model(&self) -> Result<(), ValidationError> {
        if self.input_size > 0 && self.output_size > 0 {
            Ok(())
        } else {
            Err(ValidationError::new("invalid model shape"))
        }
    }
}

fn validate_model(s: &ModelSettings) -> Result<(), ValidationError> {
    s.validate_model()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
/// How the placeholder accuracy of a model is produced.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [evaluation]
/// kind = "simulated"
/// seed = 7
/// ```
///
/// ```text
/// [evaluation]
/// kind = "fixed"
/// accuracy = 0.9
/// ```
///
/// **Environment variable**
/// ```text
/// UAVFED_EVALUATION__KIND=fixed
/// UAVFED_EVALUATION__ACCURACY=0.9
/// ```
pub enum EvaluationSettings {
    /// A random accuracy that grows with the number of samples.
    Simulated {
        #[serde(default)]
        seed: Option<u64>,
    },
    /// A constant accuracy, for reproducible runs.
    Fixed { accuracy: f64 },
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        EvaluationSettings::Simulated { seed: None }
    }
}

impl EvaluationSettings {
    pub fn evaluator(&self) -> Evaluator {
        match self {
            EvaluationSettings::Simulated { seed } => Evaluator::simulated(*seed),
            EvaluationSettings::Fixed { accuracy } => Evaluator::fixed(*accuracy),
        }
    }

    /// Checks that a fixed accuracy lies in `[0, 1]`.
    ///
    /// # Errors
    /// Fails for accuracies outside of `[0, 1]`.
    pub fn validate_evaluation(&self) -> Result<(), ValidationError> {
        match self {
            EvaluationSettings::Fixed { accuracy } if !(0.0..=1.0).contains(accuracy) => {
                Err(ValidationError::new("invalid fixed accuracy"))
            }
            _ => Ok(()),
        }
    }
}
