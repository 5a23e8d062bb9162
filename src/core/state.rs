//! Named ports on Mechanisms and Projections.
//!
//! A State owns its afferent and efferent edge lists, runs a combining
//! function over path afferents, and is the landing point for modulation.
//! The update protocol itself lives on [`Model`] because it has to reach
//! through the arena into projections and their senders.

use hashbrown::HashMap;
use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::adaptive::ControlSignalState;
use crate::error::{Error, Result};
use crate::function::{Function, Params};
use crate::model::{ExecContext, MechanismId, Model, ProjectionId, StateId};
use crate::value::Value;

/// How a ModulatorySignal acts on the State it projects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Modulation {
    Multiplicative,
    Additive,
    Override,
    Disable,
}

/// How a ParameterState folds modulation that did not name a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ModulationOperation {
    #[default]
    Product,
    /// Used by MATRIX ParameterStates so that learning is additive.
    Sum,
}

impl ModulationOperation {
    pub fn default_modulation(self) -> Modulation {
        match self {
            ModulationOperation::Product => Modulation::Multiplicative,
            ModulationOperation::Sum => Modulation::Additive,
        }
    }
}

/// Transform an OutputState applies to its slice of the owner's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Calculate {
    #[default]
    Identity,
    Mean,
    Variance,
    MaxValue,
    MaxIndicator,
    Sum,
    Sse,
    Mse,
}

pub const RESULT: &str = "RESULT";
pub const MEAN: &str = "MEAN";
pub const VARIANCE: &str = "VARIANCE";
pub const MAX_VAL: &str = "MAX_VAL";
pub const MAX_INDICATOR: &str = "MAX_INDICATOR";
pub const SSE: &str = "SSE";
pub const MSE: &str = "MSE";

impl Calculate {
    /// Standard OutputState names and their transforms.
    pub fn standard(name: &str) -> Option<Calculate> {
        match name {
            RESULT => Some(Calculate::Identity),
            MEAN => Some(Calculate::Mean),
            VARIANCE => Some(Calculate::Variance),
            MAX_VAL => Some(Calculate::MaxValue),
            MAX_INDICATOR => Some(Calculate::MaxIndicator),
            SSE => Some(Calculate::Sse),
            MSE => Some(Calculate::Mse),
            _ => None,
        }
    }

    pub fn apply(&self, v: &Value) -> Value {
        match self {
            Calculate::Identity => v.clone(),
            Calculate::Mean => Value::vector([v.mean()]),
            Calculate::Variance => Value::vector([v.variance()]),
            Calculate::MaxValue => Value::vector([v.max()]),
            Calculate::MaxIndicator => {
                let hot = v.argmax();
                Value::vector(
                    (0..v.len())
                        .map(|i| if Some(i) == hot { 1.0 } else { 0.0 })
                        .collect::<Vec<_>>(),
                )
            }
            Calculate::Sum => Value::vector([v.sum()]),
            Calculate::Sse => Value::vector([v.as_slice().iter().map(|x| x * x).sum::<f64>()]),
            Calculate::Mse => {
                let n = v.len().max(1) as f64;
                Value::vector([v.as_slice().iter().map(|x| x * x).sum::<f64>() / n])
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    Mechanism(MechanismId),
    Projection(ProjectionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SignalRole {
    Learning,
    Control,
    Gating,
}

#[derive(Debug, Clone)]
pub struct InputStateParams {
    pub weight: f64,
    pub exponent: f64,
    /// Bucket for modulatory afferents whose signal named none.
    pub modulation: Option<Modulation>,
}

#[derive(Debug, Clone)]
pub struct ParameterStateParams {
    pub param: String,
    pub base_value: Value,
    pub operation: ModulationOperation,
    /// Fold each fresh modulation into `base_value` (learned matrices).
    pub accumulate: bool,
    // Sender execution count already folded in, per afferent.
    pub(crate) consumed: HashMap<ProjectionId, u64>,
}

#[derive(Debug, Clone)]
pub struct OutputStateParams {
    pub index: usize,
    pub calculate: Calculate,
}

#[derive(Debug, Clone)]
pub struct SignalParams {
    pub role: SignalRole,
    pub index: usize,
    /// `None` defers to the receiving State's default.
    pub modulation: Option<Modulation>,
    pub learning_rate: Option<f64>,
    pub control: Option<ControlSignalState>,
}

#[derive(Debug, Clone)]
pub enum StateKind {
    Input(InputStateParams),
    Parameter(ParameterStateParams),
    Output(OutputStateParams),
    Signal(SignalParams),
}

impl StateKind {
    pub fn label(&self) -> &'static str {
        match self {
            StateKind::Input(_) => "InputState",
            StateKind::Parameter(_) => "ParameterState",
            StateKind::Output(_) => "OutputState",
            StateKind::Signal(s) => match s.role {
                SignalRole::Learning => "LearningSignal",
                SignalRole::Control => "ControlSignal",
                SignalRole::Gating => "GatingSignal",
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct State {
    pub(crate) name: String,
    pub(crate) owner: Option<Owner>,
    pub(crate) kind: StateKind,
    pub(crate) function: Function,
    pub(crate) variable: Value,
    pub(crate) value: Value,
    pub(crate) path_afferents: Vec<ProjectionId>,
    pub(crate) mod_afferents: Vec<ProjectionId>,
    pub(crate) efferents: Vec<ProjectionId>,
}

impl State {
    pub(crate) fn new(name: String, kind: StateKind, variable: Value) -> Self {
        let value = match &kind {
            StateKind::Parameter(p) => p.base_value.clone(),
            _ => variable.clone(),
        };
        Self {
            name,
            owner: None,
            kind,
            function: Function::sum(),
            variable,
            value,
            path_afferents: Vec::new(),
            mod_afferents: Vec::new(),
            efferents: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<Owner> {
        self.owner
    }

    pub fn owner_mechanism(&self) -> Option<MechanismId> {
        match self.owner {
            Some(Owner::Mechanism(m)) => Some(m),
            _ => None,
        }
    }

    pub fn kind(&self) -> &StateKind {
        &self.kind
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    /// Per-afferent template (the State's reference value).
    pub fn variable(&self) -> &Value {
        &self.variable
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn path_afferents(&self) -> &[ProjectionId] {
        &self.path_afferents
    }

    pub fn mod_afferents(&self) -> &[ProjectionId] {
        &self.mod_afferents
    }

    pub fn efferents(&self) -> &[ProjectionId] {
        &self.efferents
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, StateKind::Input(_))
    }

    pub fn is_parameter(&self) -> bool {
        matches!(self.kind, StateKind::Parameter(_))
    }

    /// OutputStates and ModulatorySignals both publish values to efferents.
    pub fn is_output(&self) -> bool {
        matches!(self.kind, StateKind::Output(_) | StateKind::Signal(_))
    }

    pub fn signal_role(&self) -> Option<SignalRole> {
        match &self.kind {
            StateKind::Signal(s) => Some(s.role),
            _ => None,
        }
    }

    pub fn weight(&self) -> f64 {
        match &self.kind {
            StateKind::Input(p) => p.weight,
            _ => 1.0,
        }
    }

    pub fn exponent(&self) -> f64 {
        match &self.kind {
            StateKind::Input(p) => p.exponent,
            _ => 1.0,
        }
    }

    pub fn base_value(&self) -> Option<&Value> {
        match &self.kind {
            StateKind::Parameter(p) => Some(&p.base_value),
            _ => None,
        }
    }

    pub fn modulation(&self) -> Option<Modulation> {
        match &self.kind {
            StateKind::Signal(s) => s.modulation,
            _ => None,
        }
    }

    /// Bucket used for a modulatory afferent whose sender named none.
    pub fn default_modulation(&self) -> Modulation {
        match &self.kind {
            StateKind::Parameter(p) => p.operation.default_modulation(),
            StateKind::Input(p) => p.modulation.unwrap_or(Modulation::Multiplicative),
            _ => Modulation::Multiplicative,
        }
    }

    pub(crate) fn add_afferent(&mut self, projection: ProjectionId, modulatory: bool) {
        let list = if modulatory {
            &mut self.mod_afferents
        } else {
            &mut self.path_afferents
        };
        if !list.contains(&projection) {
            list.push(projection);
        }
    }

    pub(crate) fn add_efferent(&mut self, projection: ProjectionId) {
        if !self.efferents.contains(&projection) {
            self.efferents.push(projection);
        }
    }
}

/// Modulation collected for one State during one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModulationSet {
    pub override_value: Option<Value>,
    /// Product of MULTIPLICATIVE values (μ).
    pub multiplicative: Option<Value>,
    /// Sum of ADDITIVE values (α).
    pub additive: Option<Value>,
}

impl ModulationSet {
    pub fn collect<I>(contributions: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Modulation, Value)>,
    {
        let mut set = ModulationSet::default();
        for (modulation, value) in contributions {
            match modulation {
                Modulation::Disable => {}
                Modulation::Override => {
                    if set.override_value.is_some() {
                        return Err(Error::spec(
                            "more than one OVERRIDE modulation converges on the same state",
                        ));
                    }
                    set.override_value = Some(value);
                }
                Modulation::Multiplicative => {
                    set.multiplicative = Some(match set.multiplicative.take() {
                        Some(acc) => acc.mul(&value)?,
                        None => value,
                    });
                }
                Modulation::Additive => {
                    set.additive = Some(match set.additive.take() {
                        Some(acc) => acc.add(&value)?,
                        None => value,
                    });
                }
            }
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.override_value.is_none() && self.multiplicative.is_none() && self.additive.is_none()
    }

    /// Parameter overrides that route μ and α into `function`.
    pub fn as_params(&self, function: &Function) -> Result<Params> {
        let mut params = Params::new();
        if let Some(mu) = &self.multiplicative {
            let name = function.multiplicative_param().ok_or_else(|| {
                Error::execution(format!(
                    "{} has no multiplicative parameter to modulate",
                    function.name()
                ))
            })?;
            params.set(name, mu.clone());
        }
        if let Some(alpha) = &self.additive {
            let name = function.additive_param().ok_or_else(|| {
                Error::execution(format!(
                    "{} has no additive parameter to modulate",
                    function.name()
                ))
            })?;
            params.set(name, alpha.clone());
        }
        Ok(params)
    }
}

/// `function(items; μ, α)`, or the OVERRIDE value when one is present.
pub fn modulated_value(function: &mut Function, items: &[Value], mods: &ModulationSet) -> Result<Value> {
    if let Some(v) = &mods.override_value {
        return Ok(v.clone());
    }
    let params = mods.as_params(function)?;
    let mut out = function.execute(items, &params)?;
    if out.len() != 1 {
        return Err(Error::execution(format!(
            "state function {} must combine its variable into a single value",
            function.name()
        )));
    }
    Ok(out.remove(0))
}

impl Model {
    /// Run the update protocol of one State.
    ///
    /// `seed` is the external input of an InputState, the runtime override of
    /// a ParameterState, or the freshly calculated slice of an OutputState.
    /// Input and Parameter states store their value; Output states only
    /// return it so the owner can publish it at the end of the time step.
    pub(crate) fn update_state(&mut self, sid: StateId, ctx: &ExecContext<'_>, seed: Option<Value>) -> Result<Value> {
        let (path, mods) = {
            let s = &self.states[sid.index()];
            (s.path_afferents.clone(), s.mod_afferents.clone())
        };

        let mut path_values = Vec::with_capacity(path.len() + 1);
        for pid in path {
            if let Some(v) = self.execute_projection(pid, ctx)? {
                path_values.push(v);
            }
        }

        let mut contributions = Vec::with_capacity(mods.len());
        let mut fresh_stamps = Vec::new();
        for pid in mods {
            if let Some((modulation, value, stamp)) = self.modulatory_contribution(pid, sid, ctx)? {
                if let StateKind::Parameter(p) = &self.states[sid.index()].kind {
                    if p.accumulate {
                        if p.consumed.get(&pid) == Some(&stamp) {
                            continue;
                        }
                        fresh_stamps.push((pid, stamp));
                    }
                }
                contributions.push((modulation, value));
            }
        }
        let mods = ModulationSet::collect(contributions)?;

        let state = &mut self.states[sid.index()];
        let items = match &state.kind {
            StateKind::Input(_) => {
                if let Some(external) = seed {
                    path_values.push(external);
                }
                if path_values.is_empty() {
                    path_values.push(state.variable.zeros_like());
                }
                path_values
            }
            StateKind::Parameter(p) => {
                if path_values.is_empty() {
                    vec![seed.unwrap_or_else(|| p.base_value.clone())]
                } else {
                    path_values
                }
            }
            StateKind::Output(_) | StateKind::Signal(_) => {
                let raw = seed.ok_or_else(|| {
                    Error::execution(format!("output state '{}' updated without a value", state.name))
                })?;
                vec![raw]
            }
        };

        let value = modulated_value(&mut state.function, &items, &mods)?;

        match &mut state.kind {
            StateKind::Input(_) => {
                if !value.shape_compatible(&state.variable) && !value.is_scalar_like() {
                    return Err(Error::execution(format!(
                        "input state '{}' expected {} but received {}",
                        state.name,
                        state.variable.dims(),
                        value.dims()
                    )));
                }
                state.value = value.clone();
            }
            StateKind::Parameter(p) => {
                if p.accumulate && !fresh_stamps.is_empty() {
                    debug!(state = %state.name, folds = fresh_stamps.len(), "accumulating modulation");
                    p.base_value = value.clone();
                    for (pid, stamp) in fresh_stamps {
                        p.consumed.insert(pid, stamp);
                    }
                }
                state.value = value.clone();
            }
            StateKind::Output(_) | StateKind::Signal(_) => {}
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_outranks_everything() {
        let set = ModulationSet::collect([
            (Modulation::Multiplicative, Value::scalar(3.0)),
            (Modulation::Override, Value::vector([9.0, 9.0])),
            (Modulation::Additive, Value::scalar(1.0)),
        ])
        .unwrap();
        let mut f = Function::sum();
        let v = modulated_value(&mut f, &[Value::vector([1.0, 2.0])], &set).unwrap();
        assert_eq!(v.as_slice(), &[9.0, 9.0]);
    }

    #[test]
    fn two_overrides_are_rejected() {
        let err = ModulationSet::collect([
            (Modulation::Override, Value::scalar(1.0)),
            (Modulation::Override, Value::scalar(2.0)),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Specification(_)));
    }

    #[test]
    fn buckets_reduce_then_apply_multiplicative_first() {
        let set = ModulationSet::collect([
            (Modulation::Multiplicative, Value::scalar(2.0)),
            (Modulation::Multiplicative, Value::scalar(3.0)),
            (Modulation::Additive, Value::scalar(0.5)),
            (Modulation::Additive, Value::scalar(0.25)),
            (Modulation::Disable, Value::scalar(100.0)),
        ])
        .unwrap();
        assert_eq!(set.multiplicative, Some(Value::scalar(6.0)));
        assert_eq!(set.additive, Some(Value::scalar(0.75)));
        let mut f = Function::sum();
        let v = modulated_value(&mut f, &[Value::vector([1.0, 2.0])], &set).unwrap();
        assert_eq!(v.as_slice(), &[6.75, 12.75]);
    }

    #[test]
    fn missing_role_is_an_error() {
        let set = ModulationSet::collect([(Modulation::Additive, Value::scalar(1.0))]).unwrap();
        let mut f = Function::identity();
        assert!(modulated_value(&mut f, &[Value::scalar(1.0)], &set).is_err());
    }

    #[test]
    fn standard_output_calculations() {
        let v = Value::vector([1.0, 3.0, 2.0]);
        assert_eq!(Calculate::standard(MAX_INDICATOR).unwrap().apply(&v).as_slice(), &[0.0, 1.0, 0.0]);
        assert_eq!(Calculate::standard(MEAN).unwrap().apply(&v).as_slice(), &[2.0]);
        assert_eq!(Calculate::Sse.apply(&v).as_slice(), &[14.0]);
        assert!(Calculate::standard("FIRST").is_none());
    }

    #[test]
    fn parameter_operation_picks_bucket() {
        assert_eq!(ModulationOperation::Sum.default_modulation(), Modulation::Additive);
        assert_eq!(ModulationOperation::Product.default_modulation(), Modulation::Multiplicative);
    }
}
