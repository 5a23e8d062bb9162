//! Directed edges between States.
//!
//! Pathway projections (Mapping, AutoAssociative) move activity between
//! Mechanisms through a matrix that lives in a ParameterState of the
//! projection. Modulatory projections (Learning, Control, Gating) carry a
//! ModulatorySignal's value to the State it modulates.

use hashbrown::HashMap;
use tracing::{debug, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::function::{Function, Params, MATRIX};
use crate::model::{ExecContext, MechanismId, Model, ProjectionId, StateId, PROJECTION_SCOPE};
use crate::state::{
    Modulation, ModulationOperation, Owner, ParameterStateParams, SignalRole, State, StateKind,
};
use crate::value::{Dims, Value};

pub const AUTO: &str = "auto";
pub const CROSS: &str = "cross";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ProjectionKind {
    Mapping,
    AutoAssociative,
    Learning,
    Control,
    Gating,
}

impl ProjectionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ProjectionKind::Mapping => "MappingProjection",
            ProjectionKind::AutoAssociative => "AutoAssociativeProjection",
            ProjectionKind::Learning => "LearningProjection",
            ProjectionKind::Control => "ControlProjection",
            ProjectionKind::Gating => "GatingProjection",
        }
    }

    pub fn is_pathway(&self) -> bool {
        matches!(self, ProjectionKind::Mapping | ProjectionKind::AutoAssociative)
    }

    pub fn is_modulatory(&self) -> bool {
        !self.is_pathway()
    }

    pub fn signal_role(&self) -> Option<SignalRole> {
        match self {
            ProjectionKind::Learning => Some(SignalRole::Learning),
            ProjectionKind::Control => Some(SignalRole::Control),
            ProjectionKind::Gating => Some(SignalRole::Gating),
            _ => None,
        }
    }
}

/// How to build a pathway matrix once both endpoint sizes are known.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum MatrixSpec {
    /// Identity when square, all ones otherwise.
    #[default]
    Auto,
    Identity,
    Full(f64),
    Hollow(f64),
    Random { low: f64, high: f64 },
    Explicit(Value),
}

impl MatrixSpec {
    pub fn materialize(&self, rows: usize, cols: usize, prng: &mut crate::prng::Prng) -> Result<Value> {
        let square = |what: &str| -> Result<()> {
            if rows != cols {
                return Err(Error::connection(format!(
                    "{what} matrix needs a square projection, got {rows}x{cols}"
                )));
            }
            Ok(())
        };
        match self {
            MatrixSpec::Auto if rows == cols => Ok(Value::identity(rows)),
            MatrixSpec::Auto => Ok(Value::full(rows, cols, 1.0)),
            MatrixSpec::Identity => {
                square("IDENTITY")?;
                Ok(Value::identity(rows))
            }
            MatrixSpec::Full(x) => Ok(Value::full(rows, cols, *x)),
            MatrixSpec::Hollow(x) => {
                square("HOLLOW")?;
                Ok(Value::hollow(rows, *x))
            }
            MatrixSpec::Random { low, high } => prng.matrix(rows, cols, *low, *high),
            MatrixSpec::Explicit(m) => {
                let m = match m.dims() {
                    Dims::Matrix(r, c) if r == rows && c == cols => m.clone(),
                    // Scalar sender: a column vector reads as a row.
                    Dims::Matrix(r, 1) if rows == 1 && r == cols => m.transpose(),
                    Dims::Vector(n) if rows == 1 && n == cols => Value::matrix(1, n, m.to_vec())?,
                    _ => {
                        return Err(Error::connection(format!(
                            "matrix {} cannot map a sender of length {rows} onto a receiver of length {cols}",
                            m.dims()
                        )))
                    }
                };
                Ok(m)
            }
        }
    }
}

impl From<Value> for MatrixSpec {
    fn from(v: Value) -> Self {
        MatrixSpec::Explicit(v)
    }
}

/// One end of a projection, possibly named indirectly.
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    State(StateId),
    /// Primary OutputState as a sender, primary InputState as a receiver.
    Mechanism(MechanismId),
    /// A mechanism ParameterState by parameter name.
    Parameter(MechanismId, String),
    /// A ParameterState of another projection, such as its MATRIX.
    ProjectionParameter(ProjectionId, String),
}

/// Constructor arguments of a projection; stored as-is while deferred.
#[derive(Debug, Clone)]
pub struct ProjectionSpec {
    pub(crate) kind: ProjectionKind,
    pub(crate) name: Option<String>,
    pub(crate) sender: Option<Endpoint>,
    pub(crate) receiver: Option<Endpoint>,
    pub(crate) matrix: Option<MatrixSpec>,
    pub(crate) auto: Option<f64>,
    pub(crate) cross: Option<f64>,
    pub(crate) weight: Option<f64>,
    pub(crate) exponent: Option<f64>,
    pub(crate) learning_rate: Option<f64>,
}

impl ProjectionSpec {
    pub fn new(kind: ProjectionKind) -> Self {
        Self {
            kind,
            name: None,
            sender: None,
            receiver: None,
            matrix: None,
            auto: None,
            cross: None,
            weight: None,
            exponent: None,
            learning_rate: None,
        }
    }

    pub fn mapping() -> Self {
        Self::new(ProjectionKind::Mapping)
    }

    pub fn auto_associative() -> Self {
        Self::new(ProjectionKind::AutoAssociative)
    }

    pub fn learning() -> Self {
        Self::new(ProjectionKind::Learning)
    }

    pub fn control() -> Self {
        Self::new(ProjectionKind::Control)
    }

    pub fn gating() -> Self {
        Self::new(ProjectionKind::Gating)
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn from(mut self, sender: Endpoint) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn to(mut self, receiver: Endpoint) -> Self {
        self.receiver = Some(receiver);
        self
    }

    pub fn with_matrix(mut self, matrix: impl Into<MatrixSpec>) -> Self {
        self.matrix = Some(matrix.into());
        self
    }

    /// Diagonal and off-diagonal strengths of an AutoAssociativeProjection.
    pub fn with_auto_cross(mut self, auto: f64, cross: f64) -> Self {
        self.auto = Some(auto);
        self.cross = Some(cross);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_exponent(mut self, exponent: f64) -> Self {
        self.exponent = Some(exponent);
        self
    }

    pub fn with_learning_rate(mut self, rate: f64) -> Self {
        self.learning_rate = Some(rate);
        self
    }

    pub fn kind(&self) -> ProjectionKind {
        self.kind
    }

    pub fn sender(&self) -> Option<&Endpoint> {
        self.sender.as_ref()
    }

    pub fn receiver(&self) -> Option<&Endpoint> {
        self.receiver.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct Projection {
    pub(crate) name: String,
    pub(crate) kind: ProjectionKind,
    pub(crate) sender: StateId,
    pub(crate) receiver: StateId,
    pub(crate) function: Function,
    pub(crate) value: Value,
    pub(crate) weight: Option<f64>,
    pub(crate) exponent: Option<f64>,
    pub(crate) learning_rate: Option<f64>,
    pub(crate) parameter_states: Vec<StateId>,
    pub(crate) enabled: bool,
    // Execution count of the sender's owner when this value was computed.
    pub(crate) sender_stamp: u64,
}

impl Projection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProjectionKind {
        self.kind
    }

    pub fn sender(&self) -> StateId {
        self.sender
    }

    pub fn receiver(&self) -> StateId {
        self.receiver
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn weight(&self) -> Option<f64> {
        self.weight
    }

    pub fn exponent(&self) -> Option<f64> {
        self.exponent
    }

    pub fn learning_rate(&self) -> Option<f64> {
        self.learning_rate
    }

    pub fn parameter_states(&self) -> &[StateId] {
        &self.parameter_states
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn param_value<'m>(&self, model: &'m Model, name: &str) -> Option<&'m Value> {
        self.parameter_states
            .iter()
            .map(|s| &model.states[s.index()])
            .find(|s| s.name == name)
            .map(|s| &s.value)
    }

    /// The matrix this projection would apply right now.
    pub(crate) fn effective_matrix(&self, model: &Model) -> Result<Value> {
        if let Some(m) = self.param_value(model, MATRIX) {
            return Ok(m.clone());
        }
        match (self.param_value(model, AUTO), self.param_value(model, CROSS)) {
            (Some(a), Some(c)) => {
                let n = model.states[self.receiver.index()].variable.len();
                auto_cross_matrix(n, a, c)
            }
            _ => Err(Error::spec(format!("'{}' carries no matrix", self.name))),
        }
    }
}

fn auto_cross_matrix(n: usize, auto: &Value, cross: &Value) -> Result<Value> {
    let diag = Value::identity(n).mul(auto)?;
    let off = Value::hollow(n, 1.0).mul(cross)?;
    diag.add(&off)
}

/// Either a finished projection or its stored constructor arguments.
#[derive(Debug, Clone)]
pub enum ProjectionSlot {
    Partial(PartialProjection),
    Ready(Projection),
}

#[derive(Debug, Clone)]
pub struct PartialProjection {
    pub(crate) spec: ProjectionSpec,
}

impl PartialProjection {
    pub fn spec(&self) -> &ProjectionSpec {
        &self.spec
    }

    pub fn kind(&self) -> ProjectionKind {
        self.spec.kind
    }
}

impl Model {
    /// Create a projection. It completes immediately when both endpoints
    /// resolve and stays deferred otherwise. A projection that fails to
    /// construct is not kept.
    pub fn add_projection(&mut self, spec: ProjectionSpec) -> Result<ProjectionId> {
        for end in [spec.sender.as_ref(), spec.receiver.as_ref()].into_iter().flatten() {
            self.check_endpoint(end)?;
        }
        let pid = self.push_projection(ProjectionSlot::Partial(PartialProjection { spec }));
        match self.try_complete(pid) {
            Ok(true) => {}
            Ok(false) => debug!(projection = %pid, "projection deferred"),
            Err(e) => {
                self.projections.truncate(pid.index());
                return Err(e);
            }
        }
        Ok(pid)
    }

    fn check_endpoint(&self, end: &Endpoint) -> Result<()> {
        match end {
            Endpoint::State(s) => self.check_state(*s),
            Endpoint::Mechanism(m) | Endpoint::Parameter(m, _) => self.check_mechanism(*m),
            Endpoint::ProjectionParameter(p, _) => self.check_projection(*p),
        }
    }

    pub(crate) fn resolve_sender(&self, end: &Endpoint) -> Result<Option<StateId>> {
        let sid = match end {
            Endpoint::State(s) => *s,
            Endpoint::Mechanism(m) => self.primary_output(*m)?,
            Endpoint::Parameter(..) | Endpoint::ProjectionParameter(..) => {
                return Err(Error::connection("a parameter state cannot send a projection"))
            }
        };
        Ok(Some(sid))
    }

    /// `None` while the receiver belongs to a projection that is itself still
    /// deferred.
    pub(crate) fn resolve_receiver(&self, end: &Endpoint, kind: ProjectionKind) -> Result<Option<StateId>> {
        Ok(Some(match end {
            Endpoint::State(s) => *s,
            Endpoint::Mechanism(m) => match kind {
                ProjectionKind::Control | ProjectionKind::Learning => {
                    return Err(Error::connection(format!(
                        "{} must name the parameter it modulates",
                        kind.label()
                    )))
                }
                _ => self.primary_input(*m)?,
            },
            Endpoint::Parameter(m, name) => self.parameter_state(*m, name)?,
            Endpoint::ProjectionParameter(p, name) => {
                if self.is_deferred(*p)? {
                    return Ok(None);
                }
                self.projection_parameter_state(*p, name)?
            }
        }))
    }

    /// Build the finished projection from its stored arguments. Endpoint
    /// lists are not touched.
    pub(crate) fn build_projection(
        &mut self,
        pid: ProjectionId,
        spec: &ProjectionSpec,
        sender: StateId,
        receiver: StateId,
    ) -> Result<Projection> {
        let kind = spec.kind;
        let (s, r) = (&self.states[sender.index()], &self.states[receiver.index()]);
        let describe = |msg: &str| {
            Error::connection(format!(
                "{} from '{}' to '{}': {msg}",
                kind.label(),
                s.name,
                r.name
            ))
        };

        let mut params: Vec<(&str, Value)> = Vec::new();
        let (function, value) = match kind {
            ProjectionKind::Mapping | ProjectionKind::AutoAssociative => {
                if !matches!(s.kind, StateKind::Output(_)) {
                    return Err(describe("sender must be an output state"));
                }
                if !r.is_input() {
                    return Err(describe("receiver must be an input state"));
                }
                let (rows, cols) = (s.value.len(), r.variable.len());
                let matrix = if kind == ProjectionKind::AutoAssociative {
                    if s.owner_mechanism().is_none() || s.owner_mechanism() != r.owner_mechanism() {
                        return Err(describe("sender and receiver must belong to the same mechanism"));
                    }
                    if rows != cols {
                        return Err(describe("recurrent matrix must be square"));
                    }
                    match (spec.auto, spec.cross) {
                        (Some(a), Some(c)) => {
                            params.push((AUTO, Value::scalar(a)));
                            params.push((CROSS, Value::scalar(c)));
                            auto_cross_matrix(rows, &Value::scalar(a), &Value::scalar(c))?
                        }
                        _ => {
                            let m = spec
                                .matrix
                                .clone()
                                .unwrap_or(MatrixSpec::Hollow(1.0))
                                .materialize(rows, cols, &mut self.prng)?;
                            params.push((MATRIX, m.clone()));
                            m
                        }
                    }
                } else {
                    let m = spec
                        .matrix
                        .clone()
                        .unwrap_or_default()
                        .materialize(rows, cols, &mut self.prng)
                        .map_err(|e| describe(&e.to_string()))?;
                    params.push((MATRIX, m.clone()));
                    m
                };
                let out = s.value.vecmat(&matrix).map_err(|e| describe(&e.to_string()))?;
                if out.len() != r.variable.len() {
                    return Err(describe("projected value does not fit the receiver"));
                }
                (Function::linear_matrix(matrix), out)
            }
            ProjectionKind::Learning | ProjectionKind::Control | ProjectionKind::Gating => {
                let role = kind.signal_role();
                if s.signal_role() != role {
                    return Err(describe("sender must be a matching modulatory signal"));
                }
                let receiver_ok = match kind {
                    ProjectionKind::Gating => r.is_input() || matches!(r.kind, StateKind::Output(_)),
                    _ => r.is_parameter(),
                };
                if !receiver_ok {
                    return Err(describe("receiver cannot be modulated by this projection"));
                }
                let modulation = s.modulation().unwrap_or_else(|| r.default_modulation());
                let role_ok = match modulation {
                    Modulation::Multiplicative => r.function.multiplicative_param().is_some(),
                    Modulation::Additive => r.function.additive_param().is_some(),
                    Modulation::Override | Modulation::Disable => true,
                };
                if !role_ok {
                    return Err(describe("receiver function has no parameter for this modulation"));
                }
                if kind == ProjectionKind::Learning {
                    let target = r.base_value().unwrap_or(&r.value);
                    let fits = s.value.shape_compatible(target)
                        || s.value.is_scalar_like()
                        || (target.rows() == target.cols() && s.value.len() == target.rows());
                    if !fits {
                        return Err(describe("learning signal does not fit the matrix it updates"));
                    }
                }
                (Function::identity(), s.value.clone())
            }
        };

        let name = match &spec.name {
            Some(n) => n.clone(),
            None => format!("{} from {} to {}", kind.label(), s.name, r.name),
        };
        let name = self.names.claim(PROJECTION_SCOPE, &name)?;

        let mut parameter_states = Vec::with_capacity(params.len());
        for (param, base) in params {
            let sid = self.push_state(State::new(
                param.to_string(),
                StateKind::Parameter(ParameterStateParams {
                    param: param.to_string(),
                    base_value: base.clone(),
                    operation: ModulationOperation::Product,
                    accumulate: false,
                    consumed: HashMap::new(),
                }),
                base,
            ));
            if let Err(e) = self.attach_state(sid, Owner::Projection(pid)) {
                self.names.release(PROJECTION_SCOPE, &name);
                return Err(e);
            }
            parameter_states.push(sid);
        }

        Ok(Projection {
            name,
            kind,
            sender,
            receiver,
            function,
            value,
            weight: spec.weight,
            exponent: spec.exponent,
            learning_rate: spec.learning_rate,
            parameter_states,
            enabled: true,
            sender_stamp: 0,
        })
    }

    /// Turn a MATRIX ParameterState into an accumulating SUM state so that
    /// learning adds weight changes to it.
    pub(crate) fn make_learnable(&mut self, pid: ProjectionId) -> Result<StateId> {
        let sid = self.projection_parameter_state(pid, MATRIX)?;
        if let StateKind::Parameter(p) = &mut self.states[sid.index()].kind {
            p.operation = ModulationOperation::Sum;
            p.accumulate = true;
        }
        Ok(sid)
    }

    /// Run one projection. `None` means it was skipped because its sender's
    /// owner has not executed in the current context.
    pub(crate) fn execute_projection(&mut self, pid: ProjectionId, ctx: &ExecContext<'_>) -> Result<Option<Value>> {
        let (sender, receiver, kind, params) = match self.ready(pid) {
            Some(p) => (p.sender, p.receiver, p.kind, p.parameter_states.clone()),
            None => return Ok(None),
        };

        let owner = self.states[sender.index()].owner_mechanism();
        let mut stamp = 0;
        if let Some(m) = owner {
            let mech = &self.mechanisms[m.index()];
            if mech.executed_in != Some(ctx.execution) {
                let name = &self.ready(pid).map(|p| p.name.clone()).unwrap_or_default();
                if self.verbose {
                    warn!(projection = %name, sender = %mech.name, "sender has not executed; projection skipped");
                } else {
                    debug!(projection = %name, sender = %mech.name, "sender has not executed; projection skipped");
                }
                return Ok(None);
            }
            stamp = mech.execution_count;
        }

        let mut overrides = Params::new();
        for ps in params {
            let v = self.update_state(ps, ctx, None)?;
            let name = self.states[ps.index()].name.clone();
            overrides.set(&name, v);
        }

        let sender_value = self.states[sender.index()].value.clone();
        let value = match kind {
            ProjectionKind::Mapping | ProjectionKind::AutoAssociative => {
                if !overrides.contains(MATRIX) {
                    if let (Some(a), Some(c)) = (overrides.get(AUTO), overrides.get(CROSS)) {
                        let m = auto_cross_matrix(sender_value.len(), a, c)?;
                        overrides.set(MATRIX, m);
                    }
                }
                let proj = self
                    .ready_mut(pid)
                    .ok_or_else(|| Error::deferred(format!("{pid} is still deferred")))?;
                let mut out = proj.function.execute(&[sender_value], &overrides)?;
                out.pop()
                    .ok_or_else(|| Error::execution(format!("'{}' produced no value", proj.name)))?
            }
            ProjectionKind::Learning => {
                let own = self.ready(pid).and_then(|p| p.learning_rate);
                let signal = match &self.states[sender.index()].kind {
                    StateKind::Signal(s) => s.learning_rate,
                    _ => None,
                };
                let lr = signal.or(own).unwrap_or(1.0);
                let v = sender_value.scale(lr);
                let target = &self.states[receiver.index()];
                let base = target.base_value().unwrap_or(&target.value);
                if !v.is_matrix() && base.is_matrix() && base.rows() == base.cols() && v.len() == base.rows() && v.len() > 1 {
                    v.as_diagonal()
                } else {
                    v
                }
            }
            ProjectionKind::Control | ProjectionKind::Gating => sender_value,
        };

        let proj = self
            .ready_mut(pid)
            .ok_or_else(|| Error::deferred(format!("{pid} is still deferred")))?;
        let mut value = value;
        if let Some(e) = proj.exponent {
            value = value.powf(e);
        }
        if let Some(w) = proj.weight {
            value = value.scale(w);
        }
        proj.value = value.clone();
        proj.sender_stamp = stamp;
        Ok(Some(value))
    }

    /// Modulation a ModulatoryProjection contributes to `receiver` this step.
    pub(crate) fn modulatory_contribution(
        &mut self,
        pid: ProjectionId,
        receiver: StateId,
        ctx: &ExecContext<'_>,
    ) -> Result<Option<(Modulation, Value, u64)>> {
        let sender = match self.ready(pid) {
            Some(p) if p.enabled => p.sender,
            _ => return Ok(None),
        };
        let modulation = self.states[sender.index()]
            .modulation()
            .unwrap_or_else(|| self.states[receiver.index()].default_modulation());
        if modulation == Modulation::Disable {
            return Ok(None);
        }
        let value = match self.execute_projection(pid, ctx)? {
            Some(v) => v,
            None => return Ok(None),
        };
        let stamp = self.ready(pid).map(|p| p.sender_stamp).unwrap_or(0);
        Ok(Some((modulation, value, stamp)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanism::MechanismSpec;
    use crate::prng::Prng;

    #[test]
    fn auto_matrix_is_identity_when_square() {
        let mut prng = Prng::new(1);
        assert_eq!(MatrixSpec::Auto.materialize(2, 2, &mut prng).unwrap(), Value::identity(2));
        assert_eq!(
            MatrixSpec::Auto.materialize(2, 3, &mut prng).unwrap(),
            Value::full(2, 3, 1.0)
        );
        assert!(MatrixSpec::Identity.materialize(2, 3, &mut prng).is_err());
    }

    #[test]
    fn scalar_sender_accepts_column_vector() {
        let mut prng = Prng::new(1);
        let column = Value::from_rows(&[vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let m = MatrixSpec::Explicit(column).materialize(1, 3, &mut prng).unwrap();
        assert_eq!(m.dims(), Dims::Matrix(1, 3));
        assert_eq!(m.as_slice(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn explicit_shape_mismatch_is_a_connection_error() {
        let mut prng = Prng::new(1);
        let err = MatrixSpec::Explicit(Value::identity(3))
            .materialize(2, 2, &mut prng)
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn failed_construction_leaves_no_projection_behind() {
        let mut model = Model::new("m");
        let a = model.add_mechanism(MechanismSpec::transfer().named("A").with_size(2)).unwrap();
        let b = model.add_mechanism(MechanismSpec::transfer().named("B").with_size(2)).unwrap();
        let states = model.states.len();
        let err = model
            .add_projection(
                ProjectionSpec::mapping()
                    .from(Endpoint::Mechanism(a))
                    .to(Endpoint::Mechanism(b))
                    .with_matrix(MatrixSpec::Explicit(Value::identity(3))),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert!(model.projections().is_empty());
        assert!(model.deferred_projections().is_empty());
        assert_eq!(model.states.len(), states);

        // Later structural changes are unaffected.
        model.add_mechanism(MechanismSpec::transfer().named("C")).unwrap();
        let p = model
            .add_projection(ProjectionSpec::mapping().from(Endpoint::Mechanism(a)).to(Endpoint::Mechanism(b)))
            .unwrap();
        assert_eq!(model.matrix(p).unwrap(), Value::identity(2));
    }

    fn run_sender(model: &mut Model, m: MechanismId, out: StateId, value: Value) {
        model.states[out.index()].value = value;
        model.mechanisms[m.index()].executed_in = Some(model.execution_id());
    }

    #[test]
    fn recurrent_projection_exposes_auto_and_cross() {
        let mut model = Model::new("m");
        let m = model.add_mechanism(MechanismSpec::transfer().named("R").with_size(2)).unwrap();
        let p = model
            .add_projection(
                ProjectionSpec::auto_associative()
                    .from(Endpoint::Mechanism(m))
                    .to(Endpoint::Mechanism(m))
                    .with_auto_cross(2.0, 0.5),
            )
            .unwrap();
        assert_eq!(model.projection(p).unwrap().kind, ProjectionKind::AutoAssociative);
        assert_eq!(model.projection_param(p, AUTO).unwrap(), Value::scalar(2.0));
        assert_eq!(model.projection_param(p, CROSS).unwrap(), Value::scalar(0.5));
        assert!(model.projection_parameter_state(p, MATRIX).is_err());
        let expected = Value::from_rows(&[vec![2.0, 0.5], vec![0.5, 2.0]]).unwrap();
        assert_eq!(model.matrix(p).unwrap(), expected);

        // A new AUTO only touches the diagonal.
        let auto = model.projection_parameter_state(p, AUTO).unwrap();
        if let StateKind::Parameter(ps) = &mut model.states[auto.index()].kind {
            ps.base_value = Value::scalar(3.0);
        }
        let out = model.primary_output(m).unwrap();
        run_sender(&mut model, m, out, Value::vector([1.0, 2.0]));
        let ctx = ExecContext::new(model.execution_id(), None);
        let v = model.execute_projection(p, &ctx).unwrap().unwrap();
        assert_eq!(v.as_slice(), &[4.0, 6.5]);
        let after = Value::from_rows(&[vec![3.0, 0.5], vec![0.5, 3.0]]).unwrap();
        assert_eq!(model.matrix(p).unwrap(), after);

        // And a new CROSS only touches the rest.
        let cross = model.projection_parameter_state(p, CROSS).unwrap();
        if let StateKind::Parameter(ps) = &mut model.states[cross.index()].kind {
            ps.base_value = Value::scalar(1.0);
        }
        let v = model.execute_projection(p, &ctx).unwrap().unwrap();
        assert_eq!(v.as_slice(), &[5.0, 7.0]);
        assert_eq!(model.projection_param(p, AUTO).unwrap(), Value::scalar(3.0));
    }

    #[test]
    fn recurrent_projection_needs_one_square_mechanism() {
        let mut model = Model::new("m");
        let a = model.add_mechanism(MechanismSpec::transfer().named("A").with_size(2)).unwrap();
        let b = model.add_mechanism(MechanismSpec::transfer().named("B").with_size(2)).unwrap();
        let err = model
            .add_projection(ProjectionSpec::auto_associative().from(Endpoint::Mechanism(a)).to(Endpoint::Mechanism(b)))
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));

        let p = model
            .add_projection(ProjectionSpec::auto_associative().from(Endpoint::Mechanism(a)).to(Endpoint::Mechanism(a)))
            .unwrap();
        assert_eq!(model.matrix(p).unwrap(), Value::hollow(2, 1.0));
    }

    /// A -> B identity mapping whose MATRIX is learned by `L` at rate 0.5,
    /// plus a LearningProjection from L's signal at rate 0.25.
    fn learned_pair() -> (Model, MechanismId, StateId, ProjectionId, ProjectionId) {
        use crate::adaptive::{ErrorInput, LEARNING_SIGNAL};
        use crate::learning::{LearningFunction, LearningRule};

        let mut model = Model::new("m");
        let a = model.add_mechanism(MechanismSpec::transfer().named("A").with_size(2)).unwrap();
        let b = model.add_mechanism(MechanismSpec::transfer().named("B").with_size(2)).unwrap();
        let mapping = model
            .add_projection(ProjectionSpec::mapping().from(Endpoint::Mechanism(a)).to(Endpoint::Mechanism(b)))
            .unwrap();
        model.make_learnable(mapping).unwrap();
        let error = ErrorInput::Outcome(model.primary_output(b).unwrap());
        let lm = model
            .add_learning_mechanism("L", mapping, error, LearningFunction::new(LearningRule::DeltaRule), Some(0.5))
            .unwrap();
        let signal = model.output_state(lm, LEARNING_SIGNAL).unwrap();
        let learning = model
            .add_projection(
                ProjectionSpec::learning()
                    .from(Endpoint::State(signal))
                    .to(Endpoint::ProjectionParameter(mapping, MATRIX.into()))
                    .with_learning_rate(0.25),
            )
            .unwrap();
        (model, lm, signal, mapping, learning)
    }

    #[test]
    fn signal_rate_wins_over_projection_rate() {
        let (mut model, lm, signal, _, learning) = learned_pair();
        let ctx = ExecContext::new(model.execution_id(), None);
        run_sender(&mut model, lm, signal, Value::full(2, 2, 0.8));
        let v = model.execute_projection(learning, &ctx).unwrap().unwrap();
        assert!(v.max_abs_diff(&Value::full(2, 2, 0.4)) < 1e-12);

        if let StateKind::Signal(sp) = &mut model.states[signal.index()].kind {
            sp.learning_rate = None;
        }
        let v = model.execute_projection(learning, &ctx).unwrap().unwrap();
        assert!(v.max_abs_diff(&Value::full(2, 2, 0.2)) < 1e-12);
    }

    #[test]
    fn vector_signal_spreads_along_the_diagonal() {
        let (mut model, lm, signal, _, learning) = learned_pair();
        let ctx = ExecContext::new(model.execution_id(), None);
        run_sender(&mut model, lm, signal, Value::vector([1.0, 2.0]));
        let v = model.execute_projection(learning, &ctx).unwrap().unwrap();
        let expected = Value::from_rows(&[vec![0.5, 0.0], vec![0.0, 1.0]]).unwrap();
        assert!(v.max_abs_diff(&expected) < 1e-12);
    }

    #[test]
    fn auto_cross_fills_diagonal_and_rest() {
        let m = auto_cross_matrix(2, &Value::scalar(2.0), &Value::scalar(-1.0)).unwrap();
        assert_eq!(m.as_slice(), &[2.0, -1.0, -1.0, 2.0]);
    }
}
