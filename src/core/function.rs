//! Configurable computations `f(variable, params) -> value`.
//!
//! The catalog is a closed table: every function a Mechanism, State or
//! Projection can run is a [`FunctionKind`]. Parameters live in an ordered
//! [`Params`] table so that ParameterStates can be generated for them and
//! modulated by name.

use core::fmt;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::Value;

pub const SLOPE: &str = "slope";
pub const INTERCEPT: &str = "intercept";
pub const GAIN: &str = "gain";
pub const BIAS: &str = "bias";
pub const OFFSET: &str = "offset";
pub const SCALE: &str = "scale";
pub const RATE: &str = "rate";
pub const MATRIX: &str = "matrix";
pub const INITIALIZER: &str = "initializer";

/// Ordered name -> value table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    entries: Vec<(String, Value)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value.into());
        self
    }

    pub fn set(&mut self, name: &str, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_scalar)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CombinationOperation {
    #[default]
    Sum,
    Product,
}

type CustomFn = dyn Fn(&[Value], &Params) -> Result<Vec<Value>> + Send + Sync;

/// A named Rust closure standing in for a user-defined function.
#[derive(Clone)]
pub struct CustomFunction {
    name: String,
    f: Arc<CustomFn>,
}

impl fmt::Debug for CustomFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum FunctionKind {
    Identity,
    Linear,
    Logistic,
    Exponential,
    LinearCombination(CombinationOperation),
    LinearMatrix,
    AdaptiveIntegrator,
    Custom(CustomFunction),
}

#[derive(Debug, Clone)]
pub struct Function {
    kind: FunctionKind,
    params: Params,
    // Integrator memory, one entry per variable item.
    previous: Option<Vec<Value>>,
}

impl Function {
    fn build(kind: FunctionKind, params: Params) -> Self {
        Self {
            kind,
            params,
            previous: None,
        }
    }

    pub fn identity() -> Self {
        Self::build(FunctionKind::Identity, Params::new())
    }

    pub fn linear(slope: f64, intercept: f64) -> Self {
        Self::build(
            FunctionKind::Linear,
            Params::new().with(SLOPE, slope).with(INTERCEPT, intercept),
        )
    }

    /// `1 / (1 + exp(-(gain * (x - bias) - offset)))`
    pub fn logistic(gain: f64, bias: f64) -> Self {
        Self::build(
            FunctionKind::Logistic,
            Params::new()
                .with(GAIN, gain)
                .with(BIAS, bias)
                .with(OFFSET, 0.0),
        )
    }

    /// `scale * exp(rate * x + bias)`
    pub fn exponential(rate: f64, scale: f64) -> Self {
        Self::build(
            FunctionKind::Exponential,
            Params::new()
                .with(RATE, rate)
                .with(BIAS, 0.0)
                .with(SCALE, scale),
        )
    }

    pub fn linear_combination(operation: CombinationOperation) -> Self {
        Self::build(
            FunctionKind::LinearCombination(operation),
            Params::new().with(SCALE, 1.0).with(OFFSET, 0.0),
        )
    }

    /// Elementwise sum; the default combining function of every State.
    pub fn sum() -> Self {
        Self::linear_combination(CombinationOperation::Sum)
    }

    pub fn linear_matrix(matrix: Value) -> Self {
        Self::build(FunctionKind::LinearMatrix, Params::new().with(MATRIX, matrix))
    }

    /// `(1 - rate) * previous + rate * x + offset`
    pub fn adaptive_integrator(rate: f64) -> Self {
        Self::build(
            FunctionKind::AdaptiveIntegrator,
            Params::new()
                .with(RATE, rate)
                .with(OFFSET, 0.0)
                .with(INITIALIZER, 0.0),
        )
    }

    pub fn custom<F>(name: &str, params: Params, f: F) -> Self
    where
        F: Fn(&[Value], &Params) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        Self::build(
            FunctionKind::Custom(CustomFunction {
                name: name.to_string(),
                f: Arc::new(f),
            }),
            params,
        )
    }

    pub fn with_param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.set(name, value.into());
        self
    }

    pub fn set_param(&mut self, name: &str, value: Value) -> Result<()> {
        if !self.params.contains(name) {
            return Err(Error::spec(format!(
                "{} has no parameter named '{name}'",
                self.name()
            )));
        }
        self.params.set(name, value);
        Ok(())
    }

    pub fn kind(&self) -> &FunctionKind {
        &self.kind
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn name(&self) -> &str {
        match &self.kind {
            FunctionKind::Identity => "Identity",
            FunctionKind::Linear => "Linear",
            FunctionKind::Logistic => "Logistic",
            FunctionKind::Exponential => "Exponential",
            FunctionKind::LinearCombination(_) => "LinearCombination",
            FunctionKind::LinearMatrix => "LinearMatrix",
            FunctionKind::AdaptiveIntegrator => "AdaptiveIntegrator",
            FunctionKind::Custom(c) => &c.name,
        }
    }

    /// Parameter a MULTIPLICATIVE modulation rewrites.
    pub fn multiplicative_param(&self) -> Option<&'static str> {
        match self.kind {
            FunctionKind::Linear => Some(SLOPE),
            FunctionKind::Logistic => Some(GAIN),
            FunctionKind::Exponential => Some(RATE),
            FunctionKind::LinearCombination(_) => Some(SCALE),
            FunctionKind::AdaptiveIntegrator => Some(RATE),
            _ => None,
        }
    }

    /// Parameter an ADDITIVE modulation rewrites.
    pub fn additive_param(&self) -> Option<&'static str> {
        match self.kind {
            FunctionKind::Linear => Some(INTERCEPT),
            FunctionKind::Logistic | FunctionKind::Exponential => Some(BIAS),
            FunctionKind::LinearCombination(_) | FunctionKind::AdaptiveIntegrator => Some(OFFSET),
            _ => None,
        }
    }

    pub fn is_stateful(&self) -> bool {
        matches!(self.kind, FunctionKind::AdaptiveIntegrator)
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Execute on a scratch copy so that integrator memory is untouched.
    /// Used to validate shapes at construction time.
    pub fn validate(&self, variable: &[Value]) -> Result<Vec<Value>> {
        let mut scratch = self.clone();
        scratch
            .execute(variable, &Params::new())
            .map_err(Error::into_specification)
    }

    pub fn execute(&mut self, variable: &[Value], overrides: &Params) -> Result<Vec<Value>> {
        self.execute_weighted(variable, None, overrides)
    }

    /// `weights` holds one `(weight, exponent)` pair per variable item; only
    /// combination functions use it.
    pub fn execute_weighted(
        &mut self,
        variable: &[Value],
        weights: Option<&[(f64, f64)]>,
        overrides: &Params,
    ) -> Result<Vec<Value>> {
        let param = |name: &str| -> Result<Value> {
            overrides
                .get(name)
                .or_else(|| self.params.get(name))
                .cloned()
                .ok_or_else(|| Error::execution(format!("missing parameter '{name}'")))
        };

        match &self.kind {
            FunctionKind::Identity => Ok(variable.to_vec()),
            FunctionKind::Linear => {
                let (slope, intercept) = (param(SLOPE)?, param(INTERCEPT)?);
                variable
                    .iter()
                    .map(|x| x.mul(&slope)?.add(&intercept))
                    .collect()
            }
            FunctionKind::Logistic => {
                let (gain, bias, offset) = (param(GAIN)?, param(BIAS)?, param(OFFSET)?);
                variable
                    .iter()
                    .map(|x| {
                        let z = x.sub(&bias)?.mul(&gain)?.sub(&offset)?;
                        Ok(z.map(|z| 1.0 / (1.0 + (-z).exp())))
                    })
                    .collect()
            }
            FunctionKind::Exponential => {
                let (rate, bias, scale) = (param(RATE)?, param(BIAS)?, param(SCALE)?);
                variable
                    .iter()
                    .map(|x| x.mul(&rate)?.add(&bias)?.map(f64::exp).mul(&scale))
                    .collect()
            }
            FunctionKind::LinearCombination(op) => {
                let (scale, offset) = (param(SCALE)?, param(OFFSET)?);
                let combined = combine(*op, variable, weights)?;
                Ok(vec![combined.mul(&scale)?.add(&offset)?])
            }
            FunctionKind::LinearMatrix => {
                let matrix = param(MATRIX)?;
                variable.iter().map(|x| x.vecmat(&matrix)).collect()
            }
            FunctionKind::AdaptiveIntegrator => {
                let (rate, offset, init) = (param(RATE)?, param(OFFSET)?, param(INITIALIZER)?);
                let previous: Vec<Value> = match &self.previous {
                    Some(prev)
                        if prev.len() == variable.len()
                            && prev.iter().zip(variable).all(|(p, x)| p.shape_compatible(x)) =>
                    {
                        prev.clone()
                    }
                    _ => variable
                        .iter()
                        .map(|x| x.zeros_like().add(&init))
                        .collect::<Result<_>>()?,
                };
                let keep = rate.map(|r| 1.0 - r);
                let out = variable
                    .iter()
                    .zip(previous.iter())
                    .map(|(x, p)| p.mul(&keep)?.add(&x.mul(&rate)?)?.add(&offset))
                    .collect::<Result<Vec<_>>>()?;
                self.previous = Some(out.clone());
                Ok(out)
            }
            FunctionKind::Custom(c) => {
                let mut merged = self.params.clone();
                for (k, v) in overrides.iter() {
                    merged.set(k, v.clone());
                }
                (c.f)(variable, &merged)
            }
        }
    }

    /// d(output)/d(input) expressed in terms of the output, for learning.
    pub fn derivative(&self, output: &Value, overrides: &Params) -> Result<Value> {
        let param = |name: &str| -> Result<Value> {
            overrides
                .get(name)
                .or_else(|| self.params.get(name))
                .cloned()
                .ok_or_else(|| Error::execution(format!("missing parameter '{name}'")))
        };
        match self.kind {
            FunctionKind::Identity => Ok(output.map(|_| 1.0)),
            FunctionKind::Linear => output.map(|_| 1.0).mul(&param(SLOPE)?),
            FunctionKind::Logistic => output.map(|y| y * (1.0 - y)).mul(&param(GAIN)?),
            FunctionKind::Exponential => output.mul(&param(RATE)?),
            _ => Err(Error::execution(format!(
                "{} does not provide a derivative",
                self.name()
            ))),
        }
    }
}

fn combine(op: CombinationOperation, items: &[Value], weights: Option<&[(f64, f64)]>) -> Result<Value> {
    let mut acc: Option<Value> = None;
    for (i, item) in items.iter().enumerate() {
        let (w, e) = weights.and_then(|ws| ws.get(i)).copied().unwrap_or((1.0, 1.0));
        let term = item.powf(e).scale(w);
        acc = Some(match acc {
            None => term,
            Some(a) => match op {
                CombinationOperation::Sum => a.add(&term)?,
                CombinationOperation::Product => a.mul(&term)?,
            },
        });
    }
    acc.ok_or_else(|| Error::execution("LinearCombination called with an empty variable"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    #[test]
    fn linear_respects_overrides() {
        let mut f = Function::linear(2.0, 1.0);
        let out = f.execute(&[Value::vector([1.0, 2.0])], &Params::new()).unwrap();
        assert!(close(out[0].as_slice(), &[3.0, 5.0]));

        let out = f
            .execute(&[Value::vector([1.0, 2.0])], &Params::new().with(SLOPE, 3.0))
            .unwrap();
        assert!(close(out[0].as_slice(), &[4.0, 7.0]));
    }

    #[test]
    fn combination_uses_weights_and_modulated_params() {
        let mut f = Function::sum();
        let items = [Value::vector([1.0, 2.0]), Value::vector([3.0, 4.0])];
        let out = f.execute(&items, &Params::new()).unwrap();
        assert!(close(out[0].as_slice(), &[4.0, 6.0]));

        let out = f
            .execute_weighted(&items, Some(&[(-1.0, 1.0), (1.0, 1.0)]), &Params::new())
            .unwrap();
        assert!(close(out[0].as_slice(), &[2.0, 2.0]));

        let mods = Params::new()
            .with(SCALE, 2.0)
            .with(OFFSET, Value::vector([0.5, 0.5]));
        let out = f.execute(&items, &mods).unwrap();
        assert!(close(out[0].as_slice(), &[8.5, 12.5]));
    }

    #[test]
    fn roles_are_declared() {
        assert_eq!(Function::linear(1.0, 0.0).multiplicative_param(), Some(SLOPE));
        assert_eq!(Function::logistic(1.0, 0.0).additive_param(), Some(BIAS));
        assert_eq!(Function::identity().multiplicative_param(), None);
    }

    #[test]
    fn integrator_converges_and_resets() {
        let mut f = Function::adaptive_integrator(0.5);
        let x = [Value::vector([1.0])];
        let a = f.execute(&x, &Params::new()).unwrap()[0].as_slice()[0];
        let b = f.execute(&x, &Params::new()).unwrap()[0].as_slice()[0];
        assert!((a - 0.5).abs() < 1e-12);
        assert!((b - 0.75).abs() < 1e-12);
        f.reset();
        let c = f.execute(&x, &Params::new()).unwrap()[0].as_slice()[0];
        assert!((c - 0.5).abs() < 1e-12);
    }

    #[test]
    fn validate_does_not_touch_memory() {
        let f = Function::adaptive_integrator(0.5);
        f.validate(&[Value::vector([1.0])]).unwrap();
        assert!(f.previous.is_none());
        let m = Function::linear_matrix(Value::identity(2));
        let err = m.validate(&[Value::vector([1.0, 2.0, 3.0])]).unwrap_err();
        assert!(matches!(err, Error::Specification(_)));
    }

    #[test]
    fn logistic_derivative() {
        let f = Function::logistic(1.0, 0.0);
        let out = f.clone().execute(&[Value::vector([0.0])], &Params::new()).unwrap();
        assert!(close(out[0].as_slice(), &[0.5]));
        let d = f.derivative(&out[0], &Params::new()).unwrap();
        assert!(close(d.as_slice(), &[0.25]));
    }

    #[test]
    fn custom_sees_merged_params() {
        let mut f = Function::custom("double", Params::new().with("k", 2.0), |v, p| {
            let k = p.scalar("k").unwrap_or(1.0);
            Ok(v.iter().map(|x| x.scale(k)).collect())
        });
        let out = f.execute(&[Value::vector([1.0])], &Params::new().with("k", 3.0)).unwrap();
        assert!(close(out[0].as_slice(), &[3.0]));
        assert_eq!(f.name(), "double");
    }
}
