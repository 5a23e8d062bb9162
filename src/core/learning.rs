//! Weight-change rules run by LearningMechanisms.
//!
//! Only the interface matters to the rest of the framework: a rule turns
//! `(activation_input, activation_output, error)` into a weight-change
//! matrix shaped like the learned projection's matrix, plus the error signal
//! handed to the next LearningMechanism upstream.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LearningRule {
    /// `Δ = outer(input, error)`; single layer only.
    DeltaRule,
    /// `Δ = outer(input, error ∘ f'(output))`; hidden layers propagate error
    /// back through the downstream matrix.
    #[default]
    BackPropagation,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LearningFunction {
    pub rule: LearningRule,
    /// Scales the weight change before it leaves the mechanism. Kept at 1 by
    /// default so the LearningSignal/LearningProjection rate is the only knob.
    pub learning_rate: f64,
}

impl Default for LearningFunction {
    fn default() -> Self {
        Self::new(LearningRule::default())
    }
}

pub struct LearningInput<'a> {
    pub activation_input: &'a Value,
    pub activation_output: &'a Value,
    /// Comparator output for the last layer, or the downstream mechanism's
    /// error signal for hidden layers.
    pub error: &'a Value,
    /// Downstream matrix (`[output x downstream]`) for hidden layers.
    pub error_matrix: Option<&'a Value>,
    /// `f'(activation_output)` of the receiving mechanism's function.
    pub derivative: Option<&'a Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LearningOutput {
    pub weight_change: Value,
    pub error_signal: Value,
}

impl LearningFunction {
    pub fn new(rule: LearningRule) -> Self {
        Self {
            rule,
            learning_rate: 1.0,
        }
    }

    pub fn with_learning_rate(mut self, rate: f64) -> Self {
        self.learning_rate = rate;
        self
    }

    pub fn execute(&self, input: LearningInput<'_>) -> Result<LearningOutput> {
        let error = match input.error_matrix {
            Some(w) => w.matvec(input.error)?,
            None => input.error.clone(),
        };
        if error.len() != input.activation_output.len() {
            return Err(Error::execution(format!(
                "error signal of length {} does not match activation output of length {}",
                error.len(),
                input.activation_output.len()
            )));
        }

        let delta = match self.rule {
            LearningRule::DeltaRule => error,
            LearningRule::BackPropagation => {
                let d = input.derivative.ok_or_else(|| {
                    Error::execution("backpropagation requires the activation derivative")
                })?;
                error.mul(d)?
            }
        };

        let weight_change = Value::outer(input.activation_input, &delta).scale(self.learning_rate);
        Ok(LearningOutput {
            weight_change,
            error_signal: delta,
        })
    }
}
