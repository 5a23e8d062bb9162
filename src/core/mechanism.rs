//! Mechanisms: a Function between ordered InputStates and OutputStates.
//!
//! Construction goes through [`MechanismSpec`], which layers subclass
//! defaults, positional arguments and a `params` map in that order of
//! precedence. Execution is split in two halves, [`Model::compute`] and
//! [`Model::publish`], so that every member of an execution set reads only
//! values published before the set started.

use hashbrown::HashMap;
use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::adaptive::AdaptiveKind;
use crate::error::{Error, Result};
use crate::function::{Function, Params};
use crate::model::{owner_scope, ExecContext, ExecutionId, MechanismId, Model, StateId, MECHANISM_SCOPE};
use crate::projection::{Endpoint, ProjectionKind, ProjectionSpec};
use crate::state::{
    Calculate, InputStateParams, ModulationOperation, OutputStateParams, Owner, ParameterStateParams, State,
    StateKind, RESULT,
};
use crate::state_spec::{size_from, StateSpec};
use crate::value::Value;

/// Output of an ObjectiveMechanism.
pub const OUTCOME: &str = "OUTCOME";
pub const DEFAULT_VARIABLE: &str = "default_variable";
pub const SIZE: &str = "size";

/// Roles a mechanism can play; a set rather than a class hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Capabilities(u8);

impl Capabilities {
    pub const PROCESSING: Self = Self(1);
    pub const ADAPTIVE: Self = Self(1 << 1);
    pub const LEARNING: Self = Self(1 << 2);
    pub const CONTROL: Self = Self(1 << 3);
    pub const GATING: Self = Self(1 << 4);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ProcessingKind {
    /// Applies its function to each InputState value.
    #[default]
    Transfer,
    /// Aggregates its InputStates with their weights and exponents.
    Objective,
}

#[derive(Debug, Clone)]
pub enum MechanismKind {
    Processing(ProcessingKind),
    Adaptive(AdaptiveKind),
}

impl MechanismKind {
    pub fn label(&self) -> &'static str {
        match self {
            MechanismKind::Processing(ProcessingKind::Transfer) => "ProcessingMechanism",
            MechanismKind::Processing(ProcessingKind::Objective) => "ObjectiveMechanism",
            MechanismKind::Adaptive(AdaptiveKind::Learning(_)) => "LearningMechanism",
            MechanismKind::Adaptive(AdaptiveKind::Control(_)) => "ControlMechanism",
            MechanismKind::Adaptive(AdaptiveKind::Gating(_)) => "GatingMechanism",
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            MechanismKind::Processing(_) => Capabilities::PROCESSING,
            MechanismKind::Adaptive(a) => Capabilities::ADAPTIVE.union(match a {
                AdaptiveKind::Learning(_) => Capabilities::LEARNING,
                AdaptiveKind::Control(_) => Capabilities::CONTROL,
                AdaptiveKind::Gating(_) => Capabilities::GATING,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Mechanism {
    pub(crate) name: String,
    pub(crate) kind: MechanismKind,
    pub(crate) function: Function,
    pub(crate) input_states: Vec<StateId>,
    pub(crate) parameter_states: Vec<StateId>,
    pub(crate) output_states: Vec<StateId>,
    pub(crate) value: Vec<Value>,
    pub(crate) convergence_threshold: f64,
    pub(crate) converged: bool,
    pub(crate) execution_count: u64,
    pub(crate) executed_in: Option<ExecutionId>,
}

impl Mechanism {
    pub(crate) fn new(name: String, kind: MechanismKind, function: Function, convergence_threshold: f64) -> Self {
        Self {
            name,
            kind,
            function,
            input_states: Vec::new(),
            parameter_states: Vec::new(),
            output_states: Vec::new(),
            value: Vec::new(),
            convergence_threshold,
            converged: false,
            execution_count: 0,
            executed_in: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &MechanismKind {
        &self.kind
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    pub fn capabilities(&self) -> Capabilities {
        self.kind.capabilities()
    }

    pub fn input_states(&self) -> &[StateId] {
        &self.input_states
    }

    pub fn parameter_states(&self) -> &[StateId] {
        &self.parameter_states
    }

    pub fn output_states(&self) -> &[StateId] {
        &self.output_states
    }

    /// Last published function output, one item per output slot.
    pub fn value(&self) -> &[Value] {
        &self.value
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    pub fn executed_in(&self) -> Option<ExecutionId> {
        self.executed_in
    }

    /// Converged on its last execution. Stateless functions converge
    /// immediately.
    pub fn is_finished(&self) -> bool {
        self.converged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ModulatoryKeyword {
    Learning,
    Control,
    Gating,
}

impl ModulatoryKeyword {
    pub fn projection_kind(self) -> ProjectionKind {
        match self {
            ModulatoryKeyword::Learning => ProjectionKind::Learning,
            ModulatoryKeyword::Control => ProjectionKind::Control,
            ModulatoryKeyword::Gating => ProjectionKind::Gating,
        }
    }
}

/// Entry of a mechanism `params` map.
#[derive(Debug, Clone)]
pub enum ParamSpec {
    Value(Value),
    /// Base value plus a modulatory projection aimed at its ParameterState.
    WithProjection(Value, ProjectionSpec),
    Projection(ProjectionSpec),
    Keyword(ModulatoryKeyword),
    Flag(bool),
    Text(String),
    Unset,
}

impl From<f64> for ParamSpec {
    fn from(x: f64) -> Self {
        ParamSpec::Value(Value::scalar(x))
    }
}

impl From<Value> for ParamSpec {
    fn from(v: Value) -> Self {
        ParamSpec::Value(v)
    }
}

impl From<bool> for ParamSpec {
    fn from(b: bool) -> Self {
        ParamSpec::Flag(b)
    }
}

impl From<&str> for ParamSpec {
    fn from(s: &str) -> Self {
        ParamSpec::Text(s.to_string())
    }
}

impl From<ModulatoryKeyword> for ParamSpec {
    fn from(k: ModulatoryKeyword) -> Self {
        ParamSpec::Keyword(k)
    }
}

impl From<ProjectionSpec> for ParamSpec {
    fn from(p: ProjectionSpec) -> Self {
        ParamSpec::Projection(p)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputStateSpec {
    pub(crate) name: String,
    pub(crate) index: usize,
    pub(crate) calculate: Calculate,
}

impl OutputStateSpec {
    /// Standard names (`MEAN`, `MAX_INDICATOR`, ...) pick their transform.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            index: 0,
            calculate: Calculate::standard(name).unwrap_or_default(),
        }
    }

    pub fn index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn calculate(mut self, calculate: Calculate) -> Self {
        self.calculate = calculate;
        self
    }
}

impl From<&str> for OutputStateSpec {
    fn from(name: &str) -> Self {
        OutputStateSpec::new(name)
    }
}

#[derive(Debug, Clone)]
pub struct MechanismSpec {
    pub(crate) kind: ProcessingKind,
    pub(crate) name: Option<String>,
    pub(crate) default_variable: Option<Vec<Value>>,
    pub(crate) size: Option<Vec<usize>>,
    pub(crate) function: Option<Function>,
    pub(crate) input_states: Option<Vec<StateSpec>>,
    pub(crate) output_states: Option<Vec<OutputStateSpec>>,
    pub(crate) params: Vec<(String, ParamSpec)>,
    pub(crate) convergence_threshold: f64,
}

impl MechanismSpec {
    pub fn new(kind: ProcessingKind) -> Self {
        Self {
            kind,
            name: None,
            default_variable: None,
            size: None,
            function: None,
            input_states: None,
            output_states: None,
            params: Vec::new(),
            convergence_threshold: 1e-3,
        }
    }

    pub fn transfer() -> Self {
        Self::new(ProcessingKind::Transfer)
    }

    pub fn objective() -> Self {
        Self::new(ProcessingKind::Objective)
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// One item per InputState.
    pub fn with_default_variable(mut self, items: Vec<Value>) -> Self {
        self.default_variable = Some(items);
        self
    }

    pub fn with_variable(self, item: impl Into<Value>) -> Self {
        self.with_default_variable(vec![item.into()])
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(vec![size]);
        self
    }

    pub fn with_sizes(mut self, sizes: Vec<usize>) -> Self {
        self.size = Some(sizes);
        self
    }

    pub fn with_function(mut self, function: Function) -> Self {
        self.function = Some(function);
        self
    }

    pub fn with_input_states(mut self, specs: Vec<StateSpec>) -> Self {
        self.input_states = Some(specs);
        self
    }

    pub fn with_output_states<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OutputStateSpec>,
    {
        self.output_states = Some(specs.into_iter().map(Into::into).collect());
        self
    }

    /// Later entries shadow earlier ones and the positional arguments.
    pub fn with_param(mut self, name: &str, spec: impl Into<ParamSpec>) -> Self {
        self.params.push((name.to_string(), spec.into()));
        self
    }

    pub fn with_convergence_threshold(mut self, threshold: f64) -> Self {
        self.convergence_threshold = threshold;
        self
    }

    fn resolve(self) -> Result<Resolved> {
        let mut function = self.function.unwrap_or_else(|| match self.kind {
            ProcessingKind::Transfer => Function::linear(1.0, 0.0),
            ProcessingKind::Objective => Function::sum(),
        });
        let mut default_variable = self.default_variable;
        let mut size = self.size;

        let mut user: Vec<ParameterDecl> = Vec::new();
        for (key, spec) in self.params {
            match key.as_str() {
                DEFAULT_VARIABLE => match spec {
                    ParamSpec::Value(v) => default_variable = Some(vec![v]),
                    _ => return Err(Error::spec("default_variable must be numeric")),
                },
                SIZE => match spec {
                    ParamSpec::Value(v) => {
                        size = Some(v.as_slice().iter().map(|&n| size_from(n)).collect::<Result<_>>()?)
                    }
                    _ => return Err(Error::spec("size must be numeric")),
                },
                _ => {
                    let (value, projection) = match spec {
                        ParamSpec::Value(v) => (Some(v), None),
                        ParamSpec::WithProjection(v, p) => (Some(v), Some(p)),
                        ParamSpec::Projection(p) => (None, Some(p)),
                        ParamSpec::Keyword(k) => (None, Some(ProjectionSpec::new(k.projection_kind()))),
                        ParamSpec::Flag(_) | ParamSpec::Text(_) | ParamSpec::Unset => {
                            debug!(param = %key, "non-numeric parameter skipped");
                            continue;
                        }
                    };
                    if let Some(v) = &value {
                        if function.param(&key).is_some() {
                            function.set_param(&key, v.clone())?;
                        }
                    }
                    let base = value
                        .or_else(|| function.param(&key).cloned())
                        .ok_or_else(|| Error::spec(format!("parameter '{key}' needs a value")))?;
                    match user.iter_mut().find(|d| d.name == key) {
                        Some(d) => {
                            d.base = base;
                            d.projections.extend(projection);
                        }
                        None => user.push(ParameterDecl {
                            name: key,
                            base,
                            projections: projection.into_iter().collect(),
                        }),
                    }
                }
            }
        }

        let mut parameters: Vec<ParameterDecl> = function
            .params()
            .iter()
            .map(|(k, v)| ParameterDecl {
                name: k.to_string(),
                base: v.clone(),
                projections: Vec::new(),
            })
            .collect();
        for d in user {
            match parameters.iter_mut().find(|p| p.name == d.name) {
                Some(p) => p.projections.extend(d.projections),
                None => parameters.push(d),
            }
        }

        let default_variable = match (default_variable, size) {
            (Some(dv), Some(sz)) => {
                if dv.len() != sz.len() || dv.iter().zip(&sz).any(|(v, n)| v.len() != *n) {
                    return Err(Error::spec("default_variable and size disagree"));
                }
                Some(dv)
            }
            (Some(dv), None) => Some(dv),
            (None, Some(sz)) => Some(sz.into_iter().map(Value::zeros).collect()),
            (None, None) => None,
        };

        Ok(Resolved {
            function,
            default_variable,
            parameters,
        })
    }
}

struct Resolved {
    function: Function,
    default_variable: Option<Vec<Value>>,
    parameters: Vec<ParameterDecl>,
}

#[derive(Debug, Clone)]
pub(crate) struct ParameterDecl {
    pub(crate) name: String,
    pub(crate) base: Value,
    pub(crate) projections: Vec<ProjectionSpec>,
}

/// Everything needed to lay out a mechanism in the arena.
pub(crate) struct MechanismBuild {
    pub(crate) name: String,
    pub(crate) kind: MechanismKind,
    pub(crate) function: Function,
    pub(crate) default_variable: Option<Vec<Value>>,
    pub(crate) inputs: Option<Vec<StateSpec>>,
    pub(crate) parameters: Vec<ParameterDecl>,
    pub(crate) value_template: Option<Vec<Value>>,
    pub(crate) outputs: Vec<OutputStateSpec>,
    pub(crate) convergence_threshold: f64,
}

/// Values a mechanism computed but has not yet published.
#[derive(Debug)]
pub(crate) struct PendingUpdate {
    mechanism: MechanismId,
    value: Vec<Value>,
    outputs: Vec<(StateId, Value)>,
}

impl Model {
    pub fn add_mechanism(&mut self, mut spec: MechanismSpec) -> Result<MechanismId> {
        let kind = MechanismKind::Processing(spec.kind);
        let name = spec.name.take().unwrap_or_else(|| kind.label().to_string());
        let inputs = spec.input_states.take();
        let outputs = spec.output_states.take().unwrap_or_else(|| match spec.kind {
            ProcessingKind::Transfer => vec![OutputStateSpec::new(RESULT)],
            ProcessingKind::Objective => vec![OutputStateSpec::new(OUTCOME)],
        });
        let threshold = spec.convergence_threshold;
        let resolved = spec.resolve()?;
        self.build_mechanism(MechanismBuild {
            name,
            kind,
            function: resolved.function,
            default_variable: resolved.default_variable,
            inputs,
            parameters: resolved.parameters,
            value_template: None,
            outputs,
            convergence_threshold: threshold,
        })
    }

    pub(crate) fn build_mechanism(&mut self, b: MechanismBuild) -> Result<MechanismId> {
        let name = self.names.claim(MECHANISM_SCOPE, &b.name)?;
        let mid = self.push_mechanism(Mechanism::new(name, b.kind, b.function, b.convergence_threshold));

        let inputs = match b.inputs {
            Some(specs) => specs,
            None => b
                .default_variable
                .clone()
                .unwrap_or_else(|| vec![Value::zeros(1)])
                .into_iter()
                .map(StateSpec::Value)
                .collect(),
        };
        self.instantiate_input_states(mid, inputs, b.default_variable.as_deref())?;
        self.instantiate_parameter_states(mid, b.parameters)?;
        match b.value_template {
            Some(v) => self.mechanisms[mid.index()].value = v,
            None => self.refresh_value_template(mid)?,
        }
        self.instantiate_output_states(mid, b.outputs)?;
        self.resolve_deferred()?;

        let m = &self.mechanisms[mid.index()];
        debug!(
            mechanism = %m.name,
            kind = m.kind.label(),
            inputs = m.input_states.len(),
            outputs = m.output_states.len(),
            "mechanism created"
        );
        Ok(mid)
    }

    pub(crate) fn push_owned_state(&mut self, owner: Owner, name: &str, kind: StateKind, variable: Value) -> Result<StateId> {
        let name = self.names.claim(&owner_scope(owner, &kind), name)?;
        let sid = self.push_state(State::new(name, kind, variable));
        self.states[sid.index()].owner = Some(owner);
        Ok(sid)
    }

    fn refresh_value_template(&mut self, mid: MechanismId) -> Result<()> {
        let variable: Vec<Value> = self.mechanisms[mid.index()]
            .input_states
            .iter()
            .map(|s| self.states[s.index()].variable.clone())
            .collect();
        let m = &mut self.mechanisms[mid.index()];
        if let MechanismKind::Processing(_) = m.kind {
            m.value = m.function.validate(&variable)?;
        }
        Ok(())
    }

    pub(crate) fn instantiate_input_states(
        &mut self,
        mid: MechanismId,
        specs: Vec<StateSpec>,
        defaults: Option<&[Value]>,
    ) -> Result<Vec<StateId>> {
        let mut dicts = Vec::new();
        for spec in specs {
            dicts.extend(self.canonicalize(spec)?);
        }
        if let Some(dv) = defaults {
            if dv.len() != dicts.len() {
                return Err(Error::spec(format!(
                    "default_variable has {} items but {} input states were specified",
                    dv.len(),
                    dicts.len()
                )));
            }
        }

        let owner = Owner::Mechanism(mid);
        let mut created = Vec::with_capacity(dicts.len());
        for (i, d) in dicts.into_iter().enumerate() {
            let template = defaults.and_then(|dv| dv.get(i));
            let variable = match (d.variable.clone(), template) {
                (Some(v), Some(t)) => {
                    if !v.shape_compatible(t) {
                        return Err(Error::spec(format!(
                            "input state variable {} does not match default_variable item {}",
                            v.dims(),
                            t.dims()
                        )));
                    }
                    v
                }
                (Some(v), None) => v,
                (None, Some(t)) => t.clone(),
                (None, None) => self.infer_variable(&d.projections).unwrap_or_else(|| Value::zeros(1)),
            };

            let sid = match d.instance {
                Some(sid) => {
                    if !self.state(sid)?.is_input() {
                        return Err(Error::spec("only an input state can be used as an input state spec"));
                    }
                    self.attach_state(sid, owner)?;
                    if d.variable.is_some() || template.is_some() {
                        self.states[sid.index()].variable = variable.clone();
                        self.states[sid.index()].value = variable;
                    }
                    sid
                }
                None => self.push_owned_state(
                    owner,
                    d.name.as_deref().unwrap_or("InputState"),
                    StateKind::Input(InputStateParams {
                        weight: 1.0,
                        exponent: 1.0,
                        modulation: None,
                    }),
                    variable,
                )?,
            };
            if let StateKind::Input(p) = &mut self.states[sid.index()].kind {
                if let Some(w) = d.weight {
                    p.weight = w;
                }
                if let Some(e) = d.exponent {
                    p.exponent = e;
                }
                if d.modulation.is_some() {
                    p.modulation = d.modulation;
                }
            }
            self.mechanisms[mid.index()].input_states.push(sid);
            for pref in d.projections {
                self.connect_ref(pref, sid)?;
            }
            created.push(sid);
        }
        Ok(created)
    }

    fn instantiate_parameter_states(&mut self, mid: MechanismId, decls: Vec<ParameterDecl>) -> Result<Vec<StateId>> {
        let mut created = Vec::with_capacity(decls.len());
        for d in decls {
            let sid = self.push_owned_state(
                Owner::Mechanism(mid),
                &d.name,
                StateKind::Parameter(ParameterStateParams {
                    param: d.name.clone(),
                    base_value: d.base.clone(),
                    operation: ModulationOperation::Product,
                    accumulate: false,
                    consumed: HashMap::new(),
                }),
                d.base,
            )?;
            self.mechanisms[mid.index()].parameter_states.push(sid);
            for mut p in d.projections {
                p.receiver = Some(Endpoint::State(sid));
                self.add_projection(p)?;
            }
            created.push(sid);
        }
        Ok(created)
    }

    pub(crate) fn instantiate_output_states(&mut self, mid: MechanismId, specs: Vec<OutputStateSpec>) -> Result<Vec<StateId>> {
        let mut created = Vec::with_capacity(specs.len());
        for spec in specs {
            let m = &self.mechanisms[mid.index()];
            let item = m.value.get(spec.index).ok_or_else(|| {
                Error::spec(format!(
                    "output state '{}' indexes item {} of '{}', which has {}",
                    spec.name,
                    spec.index,
                    m.name,
                    m.value.len()
                ))
            })?;
            let template = spec.calculate.apply(item);
            let sid = self.push_owned_state(
                Owner::Mechanism(mid),
                &spec.name,
                StateKind::Output(OutputStateParams {
                    index: spec.index,
                    calculate: spec.calculate,
                }),
                template,
            )?;
            self.mechanisms[mid.index()].output_states.push(sid);
            created.push(sid);
        }
        Ok(created)
    }

    /// Add InputStates to an existing mechanism, wiring any projections
    /// they name and completing projections waiting on them.
    pub fn add_states(&mut self, mid: MechanismId, specs: Vec<StateSpec>) -> Result<Vec<StateId>> {
        self.check_mechanism(mid)?;
        let created = self.instantiate_input_states(mid, specs, None)?;
        self.refresh_value_template(mid)?;
        self.resolve_deferred()?;
        Ok(created)
    }

    pub fn add_output_states(&mut self, mid: MechanismId, specs: Vec<OutputStateSpec>) -> Result<Vec<StateId>> {
        self.check_mechanism(mid)?;
        let created = self.instantiate_output_states(mid, specs)?;
        self.resolve_deferred()?;
        Ok(created)
    }

    /// Run a mechanism once outside any scheduler, under the model's current
    /// execution id.
    pub fn execute_mechanism(&mut self, mid: MechanismId, input: &[Value]) -> Result<Vec<Value>> {
        self.execute_mechanism_with(mid, input, None)
    }

    pub fn execute_mechanism_with(&mut self, mid: MechanismId, input: &[Value], runtime: Option<Params>) -> Result<Vec<Value>> {
        self.check_mechanism(mid)?;
        let runtime = runtime.map(|p| {
            let mut map = HashMap::new();
            map.insert(mid, p);
            map
        });
        let ctx = ExecContext::new(self.execution, runtime.as_ref());
        let external: Vec<Option<Value>> = input.iter().cloned().map(Some).collect();
        let pending = self.compute(mid, &ctx, Some(&external))?;
        self.publish(pending, ctx.execution);
        Ok(self.mechanisms[mid.index()].value.clone())
    }

    /// Inputs, parameters, function, then outputs, without publishing.
    pub(crate) fn compute(
        &mut self,
        mid: MechanismId,
        ctx: &ExecContext<'_>,
        external: Option<&[Option<Value>]>,
    ) -> Result<PendingUpdate> {
        let (inputs, params, outputs) = {
            let m = &self.mechanisms[mid.index()];
            (m.input_states.clone(), m.parameter_states.clone(), m.output_states.clone())
        };

        let mut variable = Vec::with_capacity(inputs.len());
        let mut connected = false;
        for (i, sid) in inputs.iter().enumerate() {
            let seed = external.and_then(|e| e.get(i)).cloned().flatten();
            connected |= seed.is_some() || !self.states[sid.index()].path_afferents.is_empty();
            variable.push(self.update_state(*sid, ctx, seed)?);
        }

        let runtime = ctx.runtime_for(mid);
        let mut overrides = Params::new();
        for sid in params {
            let name = self.states[sid.index()].name.clone();
            let seed = runtime.and_then(|p| p.get(&name)).cloned();
            let v = self.update_state(sid, ctx, seed)?;
            overrides.set(&name, v);
        }

        let value = self.mechanism_value(mid, &variable, &overrides, connected)?;

        let mut published = Vec::with_capacity(outputs.len());
        for sid in outputs {
            let raw = self.output_item(sid, &value)?;
            let v = self.update_state(sid, ctx, Some(raw))?;
            published.push((sid, v));
        }
        Ok(PendingUpdate {
            mechanism: mid,
            value,
            outputs: published,
        })
    }

    fn mechanism_value(&mut self, mid: MechanismId, variable: &[Value], overrides: &Params, connected: bool) -> Result<Vec<Value>> {
        let kind = self.mechanisms[mid.index()].kind.clone();
        match kind {
            MechanismKind::Processing(ProcessingKind::Transfer) => {
                self.mechanisms[mid.index()].function.execute(variable, overrides)
            }
            MechanismKind::Processing(ProcessingKind::Objective) => {
                let weights: Vec<(f64, f64)> = self.mechanisms[mid.index()]
                    .input_states
                    .iter()
                    .map(|s| {
                        let s = &self.states[s.index()];
                        (s.weight(), s.exponent())
                    })
                    .collect();
                self.mechanisms[mid.index()]
                    .function
                    .execute_weighted(variable, Some(&weights), overrides)
            }
            MechanismKind::Adaptive(AdaptiveKind::Learning(role)) => self.learning_value(&role, variable),
            MechanismKind::Adaptive(AdaptiveKind::Control(role)) if !connected => Ok(vec![role.default_allocation]),
            MechanismKind::Adaptive(AdaptiveKind::Gating(role)) if !connected => Ok(vec![role.default_allocation]),
            MechanismKind::Adaptive(_) => self.mechanisms[mid.index()].function.execute(variable, overrides),
        }
    }

    fn output_item(&mut self, sid: StateId, value: &[Value]) -> Result<Value> {
        let state = &self.states[sid.index()];
        match &state.kind {
            StateKind::Output(o) => {
                let item = value.get(o.index).ok_or_else(|| {
                    Error::execution(format!("output state '{}' has no item {} to read", state.name, o.index))
                })?;
                Ok(o.calculate.apply(item))
            }
            StateKind::Signal(s) => {
                // Policies shorter than the signal list broadcast their last item.
                let item = value
                    .get(s.index)
                    .or_else(|| value.last())
                    .cloned()
                    .ok_or_else(|| Error::execution(format!("signal '{}' received an empty policy", state.name)))?;
                if s.control.is_some() {
                    self.control_intensity(sid, &item)
                } else {
                    Ok(item)
                }
            }
            _ => Err(Error::execution(format!("'{}' is not an output state", state.name))),
        }
    }

    /// Make a computed update visible to downstream projections.
    pub(crate) fn publish(&mut self, pending: PendingUpdate, execution: ExecutionId) {
        for (sid, v) in pending.outputs {
            self.states[sid.index()].value = v;
        }
        let m = &mut self.mechanisms[pending.mechanism.index()];
        m.converged = if m.function.is_stateful() {
            m.value.len() == pending.value.len()
                && m
                    .value
                    .iter()
                    .zip(&pending.value)
                    .all(|(a, b)| a.max_abs_diff(b) < m.convergence_threshold)
        } else {
            true
        };
        m.value = pending.value;
        m.execution_count += 1;
        m.executed_in = Some(execution);
    }

    /// Mark a mechanism as already executed with `value` in the current
    /// context (cycle initialization).
    pub(crate) fn seed_value(&mut self, mid: MechanismId, value: Vec<Value>, execution: ExecutionId) -> Result<()> {
        let outputs = self.mechanisms[mid.index()].output_states.clone();
        let mut published = Vec::with_capacity(outputs.len());
        for sid in outputs {
            if let StateKind::Output(o) = &self.states[sid.index()].kind {
                let item = value.get(o.index).ok_or_else(|| {
                    Error::spec(format!("initial value has no item {} for its output states", o.index))
                })?;
                published.push((sid, o.calculate.apply(item)));
            }
        }
        for (sid, v) in published {
            self.states[sid.index()].value = v;
        }
        let m = &mut self.mechanisms[mid.index()];
        m.value = value;
        m.executed_in = Some(execution);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::SLOPE;
    use crate::state::MEAN;

    #[test]
    fn size_param_must_be_whole() {
        let mut model = Model::new("m");
        let err = model
            .add_mechanism(MechanismSpec::transfer().named("A").with_param(SIZE, 1.5))
            .unwrap_err();
        assert!(matches!(err, Error::Specification(_)));
        let b = model.add_mechanism(MechanismSpec::transfer().named("B").with_param(SIZE, 3.0)).unwrap();
        assert_eq!(model.state(model.primary_input(b).unwrap()).unwrap().variable().len(), 3);
    }

    #[test]
    fn params_shadow_positional_function_values() {
        let mut model = Model::new("m");
        let m = model
            .add_mechanism(
                MechanismSpec::transfer()
                    .with_function(Function::linear(2.0, 0.0))
                    .with_param(SLOPE, 3.0)
                    .with_param("verbose", true),
            )
            .unwrap();
        assert_eq!(model.current_value(m, SLOPE).unwrap().as_scalar(), Some(3.0));
        assert!(model.parameter_state(m, "verbose").is_err());
        let out = model.execute_mechanism(m, &[Value::vector([1.0])]).unwrap();
        assert_eq!(out[0].as_slice(), &[3.0]);
    }

    #[test]
    fn conflicting_default_variable_and_size() {
        let mut model = Model::new("m");
        let err = model
            .add_mechanism(MechanismSpec::transfer().with_variable([0.0, 0.0]).with_size(3))
            .unwrap_err();
        assert!(matches!(err, Error::Specification(_)));
        assert!(model
            .add_mechanism(MechanismSpec::transfer().with_variable([0.0, 0.0]).with_size(2))
            .is_ok());
    }

    #[test]
    fn runtime_params_apply_for_one_call() {
        let mut model = Model::new("m");
        let m = model.add_mechanism(MechanismSpec::transfer().with_size(2)).unwrap();
        let out = model
            .execute_mechanism_with(m, &[Value::vector([1.0, 2.0])], Some(Params::new().with(SLOPE, 10.0)))
            .unwrap();
        assert_eq!(out[0].as_slice(), &[10.0, 20.0]);
        let out = model.execute_mechanism(m, &[Value::vector([1.0, 2.0])]).unwrap();
        assert_eq!(out[0].as_slice(), &[1.0, 2.0]);
    }

    #[test]
    fn standard_output_states_calculate() {
        let mut model = Model::new("m");
        let m = model
            .add_mechanism(
                MechanismSpec::transfer()
                    .with_size(3)
                    .with_output_states([RESULT, MEAN]),
            )
            .unwrap();
        model.execute_mechanism(m, &[Value::vector([1.0, 2.0, 6.0])]).unwrap();
        let values = model.output_values(m).unwrap();
        assert_eq!(values[0].as_slice(), &[1.0, 2.0, 6.0]);
        assert_eq!(values[1].as_slice(), &[3.0]);
    }

    #[test]
    fn objective_weights_inputs() {
        let mut model = Model::new("m");
        let m = model
            .add_mechanism(MechanismSpec::objective().with_input_states(vec![
                StateSpec::Quad(Box::new(StateSpec::Value(Value::zeros(2))), -1.0, 1.0, None),
                StateSpec::Value(Value::zeros(2)),
            ]))
            .unwrap();
        let out = model
            .execute_mechanism(m, &[Value::vector([1.0, 1.0]), Value::vector([3.0, 0.0])])
            .unwrap();
        assert_eq!(out[0].as_slice(), &[2.0, -1.0]);
    }

    #[test]
    fn integrator_reports_convergence() {
        let mut model = Model::new("m");
        let m = model
            .add_mechanism(
                MechanismSpec::transfer()
                    .with_function(Function::adaptive_integrator(1.0))
                    .with_convergence_threshold(0.01),
            )
            .unwrap();
        model.execute_mechanism(m, &[Value::vector([1.0])]).unwrap();
        assert!(!model.mechanism(m).unwrap().is_finished());
        model.execute_mechanism(m, &[Value::vector([1.0])]).unwrap();
        assert!(model.mechanism(m).unwrap().is_finished());
    }

    #[test]
    fn capabilities_are_a_set() {
        let c = Capabilities::ADAPTIVE.union(Capabilities::CONTROL);
        assert!(c.contains(Capabilities::CONTROL));
        assert!(!c.contains(Capabilities::PROCESSING));
    }
}
