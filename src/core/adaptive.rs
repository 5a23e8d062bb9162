//! Learning, Control and Gating mechanisms.
//!
//! All three emit ModulatorySignals. Control and Gating mechanisms turn an
//! evaluative input into an allocation policy whose items become the values
//! of their signals; a LearningMechanism turns activity and error into a
//! weight-change matrix for one MappingProjection.

use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::function::{Function, Params};
use crate::learning::{LearningFunction, LearningInput, LearningRule};
use crate::mechanism::{MechanismBuild, MechanismKind, MechanismSpec, OutputStateSpec, OUTCOME};
use crate::model::{MechanismId, Model, ProjectionId, StateId};
use crate::projection::{Endpoint, ProjectionKind, ProjectionSlot, ProjectionSpec};
use crate::state::{Modulation, Owner, SignalParams, SignalRole, StateKind};
use crate::state_spec::{ProjectionRef, SpecDict, StateSpec, NAME, PROJECTIONS, VARIABLE};
use crate::value::Value;

pub const ACTIVATION_INPUT: &str = "ACTIVATION_INPUT";
pub const ACTIVATION_OUTPUT: &str = "ACTIVATION_OUTPUT";
pub const ERROR_SIGNAL: &str = "ERROR_SIGNAL";
pub const LEARNING_SIGNAL: &str = "LearningSignal";

#[derive(Debug, Clone)]
pub enum AdaptiveKind {
    Learning(Box<LearningRole>),
    Control(PolicyRole),
    Gating(PolicyRole),
}

#[derive(Debug, Clone)]
pub struct LearningRole {
    pub(crate) function: LearningFunction,
    pub(crate) learned: ProjectionId,
    /// Mechanism whose activity the learned projection drives.
    pub(crate) receiver: MechanismId,
    pub(crate) error_source: ErrorSource,
}

impl LearningRole {
    pub fn learned_projection(&self) -> ProjectionId {
        self.learned
    }

    pub fn rule(&self) -> LearningRule {
        self.function.rule
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// Error arrives directly from a comparator.
    Comparator,
    /// Error arrives from the next LearningMechanism downstream and is
    /// propagated back through this projection's matrix.
    Downstream(ProjectionId),
}

/// Shared by Control and Gating mechanisms.
#[derive(Debug, Clone)]
pub struct PolicyRole {
    /// Policy used while nothing feeds the mechanism.
    pub(crate) default_allocation: Value,
    pub(crate) objective: Option<MechanismId>,
}

impl PolicyRole {
    pub fn default_allocation(&self) -> &Value {
        &self.default_allocation
    }

    /// ObjectiveMechanism aggregating the monitored outputs, if any.
    pub fn objective(&self) -> Option<MechanismId> {
        self.objective
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CostOptions {
    pub intensity: bool,
    pub adjustment: bool,
    pub duration: bool,
}

impl Default for CostOptions {
    fn default() -> Self {
        Self {
            intensity: true,
            adjustment: false,
            duration: false,
        }
    }
}

impl CostOptions {
    pub const NONE: Self = Self {
        intensity: false,
        adjustment: false,
        duration: false,
    };
    pub const ALL: Self = Self {
        intensity: true,
        adjustment: true,
        duration: true,
    };
}

/// Intensity and cost bookkeeping of one ControlSignal.
#[derive(Debug, Clone)]
pub struct ControlSignalState {
    intensity_function: Function,
    costs: CostOptions,
    intensity_cost_function: Function,
    adjustment_cost_function: Function,
    allocation: Option<Value>,
    intensity: Option<Value>,
    intensity_cost: f64,
    adjustment_cost: f64,
    duration_cost: f64,
    cost: f64,
}

impl ControlSignalState {
    pub fn new(intensity_function: Function, costs: CostOptions) -> Self {
        Self {
            intensity_function,
            costs,
            intensity_cost_function: Function::exponential(1.0, 1.0),
            adjustment_cost_function: Function::linear(1.0, 0.0),
            allocation: None,
            intensity: None,
            intensity_cost: 0.0,
            adjustment_cost: 0.0,
            duration_cost: 0.0,
            cost: 0.0,
        }
    }

    fn first(mut out: Vec<Value>, what: &str) -> Result<Value> {
        if out.is_empty() {
            return Err(Error::execution(format!("{what} produced no value")));
        }
        Ok(out.swap_remove(0))
    }

    /// New allocation in, intensity out; costs follow the intensity.
    pub fn update(&mut self, allocation: &Value) -> Result<Value> {
        let none = Params::new();
        let intensity = Self::first(
            self.intensity_function.execute(&[allocation.clone()], &none)?,
            "intensity function",
        )?;

        self.intensity_cost = if self.costs.intensity {
            Self::first(
                self.intensity_cost_function.execute(&[intensity.clone()], &none)?,
                "intensity cost function",
            )?
            .sum()
        } else {
            0.0
        };
        self.adjustment_cost = match (&self.intensity, self.costs.adjustment) {
            (Some(previous), true) => {
                let delta = intensity.sub(previous)?.map(f64::abs);
                Self::first(
                    self.adjustment_cost_function.execute(&[delta], &none)?,
                    "adjustment cost function",
                )?
                .sum()
            }
            _ => 0.0,
        };
        self.duration_cost = if self.costs.duration {
            self.duration_cost + intensity.sum()
        } else {
            0.0
        };
        self.cost = (self.intensity_cost + self.adjustment_cost + self.duration_cost).max(0.0);

        self.allocation = Some(allocation.clone());
        self.intensity = Some(intensity.clone());
        Ok(intensity)
    }

    pub fn allocation(&self) -> Option<&Value> {
        self.allocation.as_ref()
    }

    pub fn intensity(&self) -> Option<&Value> {
        self.intensity.as_ref()
    }

    pub fn intensity_cost(&self) -> f64 {
        self.intensity_cost
    }

    pub fn adjustment_cost(&self) -> f64 {
        self.adjustment_cost
    }

    pub fn duration_cost(&self) -> f64 {
        self.duration_cost
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }
}

#[derive(Debug, Clone)]
pub struct ControlSignalSpec {
    name: Option<String>,
    target: Option<Endpoint>,
    modulation: Option<Modulation>,
    intensity_function: Function,
    costs: CostOptions,
}

impl Default for ControlSignalSpec {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlSignalSpec {
    pub fn new() -> Self {
        Self {
            name: None,
            target: None,
            modulation: None,
            intensity_function: Function::identity(),
            costs: CostOptions::default(),
        }
    }

    /// Modulate parameter `param` of mechanism `m`.
    pub fn for_param(m: MechanismId, param: &str) -> Self {
        Self::new().targeting(Endpoint::Parameter(m, param.to_string()))
    }

    pub fn targeting(mut self, target: Endpoint) -> Self {
        self.target = Some(target);
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_modulation(mut self, modulation: Modulation) -> Self {
        self.modulation = Some(modulation);
        self
    }

    pub fn with_intensity_function(mut self, f: Function) -> Self {
        self.intensity_function = f;
        self
    }

    pub fn with_costs(mut self, costs: CostOptions) -> Self {
        self.costs = costs;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct GatingSignalSpec {
    name: Option<String>,
    target: Option<Endpoint>,
    modulation: Option<Modulation>,
}

impl GatingSignalSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate an InputState or OutputState; a mechanism means its primary
    /// InputState.
    pub fn targeting(mut self, target: Endpoint) -> Self {
        self.target = Some(target);
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_modulation(mut self, modulation: Modulation) -> Self {
        self.modulation = Some(modulation);
        self
    }
}

/// An OutputState an adaptive mechanism evaluates.
#[derive(Debug, Clone)]
pub struct MonitorSpec {
    pub source: Endpoint,
    pub weight: f64,
    pub exponent: f64,
}

impl MonitorSpec {
    pub fn new(source: Endpoint) -> Self {
        Self {
            source,
            weight: 1.0,
            exponent: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_exponent(mut self, exponent: f64) -> Self {
        self.exponent = exponent;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ControlMechanismSpec {
    name: Option<String>,
    monitor: Vec<MonitorSpec>,
    signals: Vec<ControlSignalSpec>,
    function: Option<Function>,
    default_allocation: Value,
}

impl Default for ControlMechanismSpec {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlMechanismSpec {
    pub fn new() -> Self {
        Self {
            name: None,
            monitor: Vec::new(),
            signals: Vec::new(),
            function: None,
            default_allocation: Value::vector([1.0]),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn monitoring(mut self, monitor: MonitorSpec) -> Self {
        self.monitor.push(monitor);
        self
    }

    pub fn with_signal(mut self, signal: ControlSignalSpec) -> Self {
        self.signals.push(signal);
        self
    }

    /// Maps the evaluated input to the allocation policy.
    pub fn with_function(mut self, f: Function) -> Self {
        self.function = Some(f);
        self
    }

    pub fn with_default_allocation(mut self, allocation: impl Into<Value>) -> Self {
        self.default_allocation = allocation.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct GatingMechanismSpec {
    name: Option<String>,
    monitor: Vec<MonitorSpec>,
    signals: Vec<GatingSignalSpec>,
    function: Option<Function>,
    default_allocation: Value,
}

impl Default for GatingMechanismSpec {
    fn default() -> Self {
        Self::new()
    }
}

impl GatingMechanismSpec {
    pub fn new() -> Self {
        Self {
            name: None,
            monitor: Vec::new(),
            signals: Vec::new(),
            function: None,
            default_allocation: Value::vector([1.0]),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn monitoring(mut self, monitor: MonitorSpec) -> Self {
        self.monitor.push(monitor);
        self
    }

    pub fn with_signal(mut self, signal: GatingSignalSpec) -> Self {
        self.signals.push(signal);
        self
    }

    pub fn with_function(mut self, f: Function) -> Self {
        self.function = Some(f);
        self
    }

    pub fn with_default_allocation(mut self, allocation: impl Into<Value>) -> Self {
        self.default_allocation = allocation.into();
        self
    }
}

/// Where a LearningMechanism's ERROR_SIGNAL input comes from.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ErrorInput {
    Outcome(StateId),
    Downstream { error_signal: StateId, projection: ProjectionId },
}

impl Model {
    pub fn add_control_mechanism(&mut self, spec: ControlMechanismSpec) -> Result<MechanismId> {
        let name = spec.name.unwrap_or_else(|| "ControlMechanism".to_string());
        let mid = self.build_policy_mechanism(&name, &spec.monitor, spec.function, spec.default_allocation, |role| {
            AdaptiveKind::Control(role)
        })?;
        for signal in spec.signals {
            self.add_control_signal(mid, signal)?;
        }
        Ok(mid)
    }

    pub fn add_gating_mechanism(&mut self, spec: GatingMechanismSpec) -> Result<MechanismId> {
        let name = spec.name.unwrap_or_else(|| "GatingMechanism".to_string());
        let mid = self.build_policy_mechanism(&name, &spec.monitor, spec.function, spec.default_allocation, |role| {
            AdaptiveKind::Gating(role)
        })?;
        for signal in spec.signals {
            self.add_gating_signal(mid, signal)?;
        }
        Ok(mid)
    }

    fn build_policy_mechanism(
        &mut self,
        name: &str,
        monitor: &[MonitorSpec],
        function: Option<Function>,
        default_allocation: Value,
        kind: impl FnOnce(PolicyRole) -> AdaptiveKind,
    ) -> Result<MechanismId> {
        let objective = if monitor.is_empty() {
            None
        } else {
            let mut inputs = Vec::with_capacity(monitor.len());
            for m in monitor {
                let source = match &m.source {
                    Endpoint::State(s) => StateSpec::OutputState(*s),
                    Endpoint::Mechanism(mech) => StateSpec::Mechanism(*mech),
                    _ => return Err(Error::spec("only output states can be monitored")),
                };
                inputs.push(StateSpec::quad(source, m.weight, m.exponent, None));
            }
            Some(self.add_mechanism(
                MechanismSpec::objective()
                    .named(&format!("{name} ObjectiveMechanism"))
                    .with_input_states(inputs),
            )?)
        };

        let input = match objective {
            Some(o) => SpecDict::new()
                .with(NAME, OUTCOME)
                .with(PROJECTIONS, vec![ProjectionRef::Source(self.primary_output(o)?)]),
            None => SpecDict::new()
                .with(NAME, OUTCOME)
                .with(VARIABLE, default_allocation.zeros_like()),
        };

        let role = PolicyRole {
            default_allocation: default_allocation.clone(),
            objective,
        };
        self.build_mechanism(MechanismBuild {
            name: name.to_string(),
            kind: MechanismKind::Adaptive(kind(role)),
            function: function.unwrap_or_else(Function::identity),
            default_variable: None,
            inputs: Some(vec![input.into()]),
            parameters: Vec::new(),
            value_template: Some(vec![default_allocation]),
            outputs: Vec::new(),
            convergence_threshold: 0.0,
        })
    }

    fn policy_signal_template(&self, mid: MechanismId) -> (usize, Value) {
        let m = &self.mechanisms[mid.index()];
        let index = m
            .output_states
            .iter()
            .filter(|s| self.states[s.index()].signal_role().is_some())
            .count();
        let template = m
            .value
            .get(index)
            .or_else(|| m.value.last())
            .cloned()
            .unwrap_or_default();
        (index, template)
    }

    fn signal_name(&self, explicit: Option<String>, target: Option<&Endpoint>, suffix: &str) -> String {
        if let Some(n) = explicit {
            return n;
        }
        let target_name = match target {
            Some(Endpoint::Parameter(_, p)) | Some(Endpoint::ProjectionParameter(_, p)) => Some(p.clone()),
            Some(Endpoint::State(s)) => self.states.get(s.index()).map(|s| s.name.clone()),
            Some(Endpoint::Mechanism(m)) => self.mechanisms.get(m.index()).map(|m| m.name.clone()),
            None => None,
        };
        match target_name {
            Some(t) => format!("{t} {suffix}"),
            None => suffix.to_string(),
        }
    }

    pub fn add_control_signal(&mut self, mid: MechanismId, spec: ControlSignalSpec) -> Result<StateId> {
        if !matches!(self.mechanism(mid)?.kind, MechanismKind::Adaptive(AdaptiveKind::Control(_))) {
            return Err(Error::spec("control signals belong to control mechanisms"));
        }
        let (index, template) = self.policy_signal_template(mid);
        let mut scratch = spec.intensity_function.clone();
        let value = scratch
            .execute(&[template], &Params::new())
            .map_err(Error::into_specification)?
            .into_iter()
            .next()
            .unwrap_or_default();
        let name = self.signal_name(spec.name, spec.target.as_ref(), "ControlSignal");
        let sid = self.push_owned_state(
            Owner::Mechanism(mid),
            &name,
            StateKind::Signal(SignalParams {
                role: SignalRole::Control,
                index,
                modulation: spec.modulation,
                learning_rate: None,
                control: Some(ControlSignalState::new(spec.intensity_function, spec.costs)),
            }),
            value,
        )?;
        self.mechanisms[mid.index()].output_states.push(sid);
        if let Some(target) = spec.target {
            self.add_projection(ProjectionSpec::control().from(Endpoint::State(sid)).to(target))?;
        }
        Ok(sid)
    }

    pub fn add_gating_signal(&mut self, mid: MechanismId, spec: GatingSignalSpec) -> Result<StateId> {
        if !matches!(self.mechanism(mid)?.kind, MechanismKind::Adaptive(AdaptiveKind::Gating(_))) {
            return Err(Error::spec("gating signals belong to gating mechanisms"));
        }
        let (index, template) = self.policy_signal_template(mid);
        let name = self.signal_name(spec.name, spec.target.as_ref(), "GatingSignal");
        let sid = self.push_owned_state(
            Owner::Mechanism(mid),
            &name,
            StateKind::Signal(SignalParams {
                role: SignalRole::Gating,
                index,
                modulation: spec.modulation,
                learning_rate: None,
                control: None,
            }),
            template,
        )?;
        self.mechanisms[mid.index()].output_states.push(sid);
        if let Some(target) = spec.target {
            self.add_projection(ProjectionSpec::gating().from(Endpoint::State(sid)).to(target))?;
        }
        Ok(sid)
    }

    pub fn control_signal(&self, sid: StateId) -> Result<&ControlSignalState> {
        match &self.state(sid)?.kind {
            StateKind::Signal(SignalParams {
                control: Some(c), ..
            }) => Ok(c),
            _ => Err(Error::spec(format!("'{}' is not a control signal", self.states[sid.index()].name))),
        }
    }

    pub(crate) fn control_intensity(&mut self, sid: StateId, allocation: &Value) -> Result<Value> {
        match &mut self.states[sid.index()].kind {
            StateKind::Signal(SignalParams {
                control: Some(c), ..
            }) => c.update(allocation),
            _ => Ok(allocation.clone()),
        }
    }

    /// LearningMechanism for `learned`, wired to its activity and error
    /// sources. Its LearningProjection is left for
    /// [`take_over_as_default_learner`](Model::take_over_as_default_learner).
    pub(crate) fn add_learning_mechanism(
        &mut self,
        name: &str,
        learned: ProjectionId,
        error: ErrorInput,
        function: LearningFunction,
        learning_rate: Option<f64>,
    ) -> Result<MechanismId> {
        let (sender, receiver) = {
            let p = self.projection(learned)?;
            (p.sender, p.receiver)
        };
        let receiver_mech = self.states[receiver.index()]
            .owner_mechanism()
            .ok_or_else(|| Error::spec("learned projection has no receiving mechanism"))?;
        let activation_output = self.primary_output(receiver_mech)?;
        let (error_state, error_source) = match error {
            ErrorInput::Outcome(s) => (s, ErrorSource::Comparator),
            ErrorInput::Downstream {
                error_signal,
                projection,
            } => (error_signal, ErrorSource::Downstream(projection)),
        };
        let weight_change = self.matrix(learned)?.zeros_like();
        let error_len = self.states[activation_output.index()].value.len();

        let input = |label: &str, source: StateId| -> StateSpec {
            SpecDict::new()
                .with(NAME, label)
                .with(PROJECTIONS, vec![ProjectionRef::Source(source)])
                .into()
        };
        let inputs = vec![
            input(ACTIVATION_INPUT, sender),
            input(ACTIVATION_OUTPUT, activation_output),
            input(ERROR_SIGNAL, error_state),
        ];

        let role = LearningRole {
            function,
            learned,
            receiver: receiver_mech,
            error_source,
        };
        let mid = self.build_mechanism(MechanismBuild {
            name: name.to_string(),
            kind: MechanismKind::Adaptive(AdaptiveKind::Learning(Box::new(role))),
            function: Function::identity(),
            default_variable: None,
            inputs: Some(inputs),
            parameters: Vec::new(),
            value_template: Some(vec![weight_change.clone(), Value::zeros(error_len)]),
            outputs: vec![OutputStateSpec::new(ERROR_SIGNAL).index(1)],
            convergence_threshold: 0.0,
        })?;

        let signal = self.push_owned_state(
            Owner::Mechanism(mid),
            LEARNING_SIGNAL,
            StateKind::Signal(SignalParams {
                role: SignalRole::Learning,
                index: 0,
                modulation: Some(Modulation::Additive),
                learning_rate,
                control: None,
            }),
            weight_change,
        )?;
        self.mechanisms[mid.index()].output_states.push(signal);
        Ok(mid)
    }

    pub(crate) fn learning_value(&self, role: &LearningRole, variable: &[Value]) -> Result<Vec<Value>> {
        if variable.len() != 3 {
            return Err(Error::execution("learning mechanism expects activation input, activation output and error"));
        }
        let error_matrix = match role.error_source {
            ErrorSource::Comparator => None,
            ErrorSource::Downstream(p) => Some(self.matrix(p)?),
        };
        let derivative = match role.function.rule {
            LearningRule::BackPropagation => {
                let receiver = &self.mechanisms[role.receiver.index()];
                let mut current = Params::new();
                for sid in &receiver.parameter_states {
                    let s = &self.states[sid.index()];
                    current.set(&s.name, s.value.clone());
                }
                Some(receiver.function.derivative(&variable[1], &current)?)
            }
            LearningRule::DeltaRule => None,
        };
        let out = role.function.execute(LearningInput {
            activation_input: &variable[0],
            activation_output: &variable[1],
            error: &variable[2],
            error_matrix: error_matrix.as_ref(),
            derivative: derivative.as_ref(),
        })?;
        Ok(vec![out.weight_change, out.error_signal])
    }

    /// Complete deferred projections of `kind` that lack a sender, using the
    /// signal `signal_for` supplies for each receiver.
    fn adopt_deferred<F>(&mut self, kind: ProjectionKind, mut signal_for: F) -> Result<usize>
    where
        F: FnMut(&mut Self, StateId) -> Result<Option<StateId>>,
    {
        let mut adopted = 0;
        for pid in self.deferred_projections() {
            let receiver = match &self.projections[pid.index()] {
                ProjectionSlot::Partial(p) if p.spec.kind == kind && p.spec.sender.is_none() => {
                    p.spec.receiver.clone()
                }
                _ => continue,
            };
            let target = match receiver {
                Some(r) => match self.resolve_receiver(&r, kind)? {
                    Some(t) => t,
                    None => continue,
                },
                None => continue,
            };
            if let Some(signal) = signal_for(self, target)? {
                self.inject_sender(pid, Endpoint::State(signal))?;
                if self.try_complete(pid)? {
                    adopted += 1;
                }
            }
        }
        Ok(adopted)
    }

    /// Give `mid` a ControlSignal for every deferred ControlProjection.
    pub fn take_over_as_default_controller(&mut self, mid: MechanismId) -> Result<usize> {
        let n = self.adopt_deferred(ProjectionKind::Control, |model, target| {
            let name = format!("{} ControlSignal", model.states[target.index()].name);
            model.add_control_signal(mid, ControlSignalSpec::new().named(&name)).map(Some)
        })?;
        debug!(mechanism = %self.mechanisms[mid.index()].name, adopted = n, "default controller take-over");
        Ok(n)
    }

    pub fn take_over_as_default_gater(&mut self, mid: MechanismId) -> Result<usize> {
        let n = self.adopt_deferred(ProjectionKind::Gating, |model, target| {
            let name = format!("{} GatingSignal", model.states[target.index()].name);
            model.add_gating_signal(mid, GatingSignalSpec::new().named(&name)).map(Some)
        })?;
        debug!(mechanism = %self.mechanisms[mid.index()].name, adopted = n, "default gater take-over");
        Ok(n)
    }

    /// Adopt deferred LearningProjections aimed at the matrix `mid` learns.
    pub fn take_over_as_default_learner(&mut self, mid: MechanismId) -> Result<usize> {
        let (learned, signal) = match &self.mechanism(mid)?.kind {
            MechanismKind::Adaptive(AdaptiveKind::Learning(role)) => {
                let signal = self.mechanisms[mid.index()]
                    .output_states
                    .iter()
                    .copied()
                    .find(|s| self.states[s.index()].signal_role() == Some(SignalRole::Learning));
                (role.learned, signal)
            }
            _ => return Err(Error::spec("only learning mechanisms can take over learning projections")),
        };
        let signal = signal.ok_or_else(|| Error::spec("learning mechanism has no learning signal"))?;
        let matrix = self.projection_parameter_state(learned, crate::function::MATRIX)?;
        let n = self.adopt_deferred(ProjectionKind::Learning, |_, target| {
            Ok((target == matrix).then_some(signal))
        })?;
        debug!(mechanism = %self.mechanisms[mid.index()].name, adopted = n, "default learner take-over");
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::SLOPE;
    use crate::mechanism::{ModulatoryKeyword, ParamSpec};

    #[test]
    fn intensity_and_costs_track_allocation() {
        let mut c = ControlSignalState::new(Function::linear(2.0, 0.0), CostOptions::ALL);
        let i = c.update(&Value::vector([1.0])).unwrap();
        assert_eq!(i.as_slice(), &[2.0]);
        assert!((c.intensity_cost() - 2.0f64.exp()).abs() < 1e-9);
        assert_eq!(c.adjustment_cost(), 0.0);
        c.update(&Value::vector([1.5])).unwrap();
        assert!((c.adjustment_cost() - 1.0).abs() < 1e-9);
        assert!((c.duration_cost() - 5.0).abs() < 1e-9);
        assert!(c.cost() > 0.0);
    }

    #[test]
    fn controller_adopts_keyword_parameters() {
        let mut model = Model::new("m");
        let b = model
            .add_mechanism(MechanismSpec::transfer().named("B").with_param(SLOPE, ModulatoryKeyword::Control))
            .unwrap();
        assert_eq!(model.deferred_projections().len(), 1);
        let ctl = model.add_control_mechanism(ControlMechanismSpec::new()).unwrap();
        assert_eq!(model.take_over_as_default_controller(ctl).unwrap(), 1);
        assert!(model.deferred_projections().is_empty());
        let slope = model.parameter_state(b, SLOPE).unwrap();
        assert_eq!(model.state(slope).unwrap().mod_afferents().len(), 1);
        let signal = model.output_state(ctl, "slope ControlSignal").unwrap();
        assert!(model.control_signal(signal).is_ok());
    }

    #[test]
    fn unconnected_policy_uses_default_allocation() {
        let mut model = Model::new("m");
        let b = model
            .add_mechanism(
                MechanismSpec::transfer()
                    .named("B")
                    .with_param(SLOPE, ParamSpec::WithProjection(Value::scalar(1.0), ProjectionSpec::control())),
            )
            .unwrap();
        let ctl = model
            .add_control_mechanism(ControlMechanismSpec::new().with_default_allocation(Value::vector([2.0])))
            .unwrap();
        model.take_over_as_default_controller(ctl).unwrap();

        model.execute_mechanism(ctl, &[]).unwrap();
        let out = model.execute_mechanism(b, &[Value::vector([3.0])]).unwrap();
        assert_eq!(out[0].as_slice(), &[6.0]);
        assert_eq!(model.current_value(b, SLOPE).unwrap().as_slice(), &[2.0]);
    }

    #[test]
    fn signals_need_matching_mechanism() {
        let mut model = Model::new("m");
        let g = model.add_gating_mechanism(GatingMechanismSpec::new()).unwrap();
        assert!(model.add_control_signal(g, ControlSignalSpec::new()).is_err());
        assert!(model.add_gating_signal(g, GatingSignalSpec::new()).is_ok());
    }
}
