//! The InputState specification grammar.
//!
//! Every accepted form is a [`StateSpec`] variant; [`Model::canonicalize`]
//! reduces any of them to one or more [`StateSpecDict`] records, which is
//! the only thing the InputState factory consumes.

use crate::error::{Error, Result};
use crate::model::{MechanismId, Model, ProjectionId, StateId};
use crate::projection::{Endpoint, MatrixSpec, ProjectionKind, ProjectionSlot, ProjectionSpec};
use crate::state::Modulation;
use crate::value::Value;

pub const NAME: &str = "NAME";
pub const VARIABLE: &str = "VARIABLE";
pub const SIZE: &str = "SIZE";
pub const VALUE: &str = "VALUE";
pub const PROJECTIONS: &str = "PROJECTIONS";
pub const WEIGHT: &str = "WEIGHT";
pub const EXPONENT: &str = "EXPONENT";
pub const MECHANISM: &str = "MECHANISM";
pub const OUTPUT_STATES: &str = "OUTPUT_STATES";
pub const MODULATION: &str = "MODULATION";

/// Class keyword; as a name it means "a default InputState".
pub const INPUT_STATE: &str = "InputState";

const KEYWORDS: [&str; 10] = [
    NAME,
    VARIABLE,
    SIZE,
    VALUE,
    PROJECTIONS,
    WEIGHT,
    EXPONENT,
    MECHANISM,
    OUTPUT_STATES,
    MODULATION,
];

/// Anything that can stand in for an afferent projection.
#[derive(Debug, Clone)]
pub enum ProjectionRef {
    Id(ProjectionId),
    Spec(ProjectionSpec),
    Kind(ProjectionKind),
    /// MappingProjection from this OutputState.
    Source(StateId),
    Matrix(MatrixSpec),
}

impl From<ProjectionId> for ProjectionRef {
    fn from(p: ProjectionId) -> Self {
        ProjectionRef::Id(p)
    }
}

impl From<ProjectionSpec> for ProjectionRef {
    fn from(p: ProjectionSpec) -> Self {
        ProjectionRef::Spec(p)
    }
}

impl From<ProjectionKind> for ProjectionRef {
    fn from(k: ProjectionKind) -> Self {
        ProjectionRef::Kind(k)
    }
}

impl From<MatrixSpec> for ProjectionRef {
    fn from(m: MatrixSpec) -> Self {
        ProjectionRef::Matrix(m)
    }
}

#[derive(Debug, Clone)]
pub enum StateSpec {
    /// An existing, unowned InputState.
    Instance(StateId),
    Name(String),
    Value(Value),
    OutputState(StateId),
    Mechanism(MechanismId),
    Projection(ProjectionRef),
    Pair(Box<StateSpec>, ProjectionRef),
    /// `(state_spec, weight, exponent, projection_spec)`
    Quad(Box<StateSpec>, f64, f64, Option<ProjectionRef>),
    Dict(SpecDict),
}

impl StateSpec {
    pub fn pair(state: impl Into<StateSpec>, projection: impl Into<ProjectionRef>) -> Self {
        StateSpec::Pair(Box::new(state.into()), projection.into())
    }

    pub fn quad(state: impl Into<StateSpec>, weight: f64, exponent: f64, projection: Option<ProjectionRef>) -> Self {
        StateSpec::Quad(Box::new(state.into()), weight, exponent, projection)
    }
}

impl From<&str> for StateSpec {
    fn from(s: &str) -> Self {
        StateSpec::Name(s.to_string())
    }
}

impl From<Value> for StateSpec {
    fn from(v: Value) -> Self {
        StateSpec::Value(v)
    }
}

impl From<MechanismId> for StateSpec {
    fn from(m: MechanismId) -> Self {
        StateSpec::Mechanism(m)
    }
}

impl From<SpecDict> for StateSpec {
    fn from(d: SpecDict) -> Self {
        StateSpec::Dict(d)
    }
}

#[derive(Debug, Clone)]
pub enum SpecEntry {
    Text(String),
    Number(f64),
    Value(Value),
    Mechanism(MechanismId),
    Names(Vec<String>),
    Projections(Vec<ProjectionRef>),
    Modulation(Modulation),
    Spec(Box<StateSpec>),
}

impl SpecEntry {
    fn describe(&self) -> &'static str {
        match self {
            SpecEntry::Text(_) => "text",
            SpecEntry::Number(_) => "a number",
            SpecEntry::Value(_) => "an array",
            SpecEntry::Mechanism(_) => "a mechanism",
            SpecEntry::Names(_) => "a list of names",
            SpecEntry::Projections(_) => "a list of projections",
            SpecEntry::Modulation(_) => "a modulation",
            SpecEntry::Spec(_) => "a state specification",
        }
    }
}

impl From<&str> for SpecEntry {
    fn from(s: &str) -> Self {
        SpecEntry::Text(s.to_string())
    }
}

impl From<f64> for SpecEntry {
    fn from(x: f64) -> Self {
        SpecEntry::Number(x)
    }
}

impl From<Value> for SpecEntry {
    fn from(v: Value) -> Self {
        SpecEntry::Value(v)
    }
}

impl From<MechanismId> for SpecEntry {
    fn from(m: MechanismId) -> Self {
        SpecEntry::Mechanism(m)
    }
}

impl From<&[&str]> for SpecEntry {
    fn from(names: &[&str]) -> Self {
        SpecEntry::Names(names.iter().map(|n| n.to_string()).collect())
    }
}

impl From<Vec<ProjectionRef>> for SpecEntry {
    fn from(p: Vec<ProjectionRef>) -> Self {
        SpecEntry::Projections(p)
    }
}

impl From<Modulation> for SpecEntry {
    fn from(m: Modulation) -> Self {
        SpecEntry::Modulation(m)
    }
}

impl From<StateSpec> for SpecEntry {
    fn from(s: StateSpec) -> Self {
        SpecEntry::Spec(Box::new(s))
    }
}

/// Keyword-keyed specification, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct SpecDict {
    entries: Vec<(String, SpecEntry)>,
}

impl SpecDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, entry: impl Into<SpecEntry>) -> Self {
        self.entries.push((key.to_string(), entry.into()));
        self
    }
}

/// Canonical description of one InputState to build.
#[derive(Debug, Clone, Default)]
pub struct StateSpecDict {
    pub name: Option<String>,
    pub variable: Option<Value>,
    pub weight: Option<f64>,
    pub exponent: Option<f64>,
    pub projections: Vec<ProjectionRef>,
    pub modulation: Option<Modulation>,
    pub instance: Option<StateId>,
}

impl Model {
    pub fn canonicalize(&self, spec: StateSpec) -> Result<Vec<StateSpecDict>> {
        let one = |d: StateSpecDict| -> Result<Vec<StateSpecDict>> { Ok(vec![d]) };
        match spec {
            StateSpec::Instance(sid) => {
                let s = self.state(sid)?;
                if !s.is_input() {
                    return Err(Error::spec(format!("'{}' is not an input state", s.name)));
                }
                if s.owner.is_some() {
                    return Err(Error::spec(format!("input state '{}' already has an owner", s.name)));
                }
                one(StateSpecDict {
                    instance: Some(sid),
                    ..Default::default()
                })
            }
            StateSpec::Name(n) if n == INPUT_STATE => one(StateSpecDict::default()),
            StateSpec::Name(n) => one(StateSpecDict {
                name: Some(n),
                ..Default::default()
            }),
            StateSpec::Value(v) => one(StateSpecDict {
                variable: Some(v),
                ..Default::default()
            }),
            StateSpec::OutputState(sid) => {
                if !self.state(sid)?.is_output() {
                    return Err(Error::spec("projection source must be an output state"));
                }
                one(StateSpecDict {
                    projections: vec![ProjectionRef::Source(sid)],
                    ..Default::default()
                })
            }
            StateSpec::Mechanism(m) => one(StateSpecDict {
                projections: vec![ProjectionRef::Source(self.primary_output(m)?)],
                ..Default::default()
            }),
            StateSpec::Projection(p) => one(StateSpecDict {
                projections: vec![p],
                ..Default::default()
            }),
            StateSpec::Pair(inner, p) => {
                let mut d = self.single(*inner)?;
                attach_projection(&mut d, p);
                one(d)
            }
            StateSpec::Quad(inner, weight, exponent, p) => {
                let mut d = self.single(*inner)?;
                d.weight = Some(weight);
                d.exponent = Some(exponent);
                if let Some(p) = p {
                    attach_projection(&mut d, p);
                }
                one(d)
            }
            StateSpec::Dict(dict) => self.canonicalize_dict(dict),
        }
    }

    fn single(&self, spec: StateSpec) -> Result<StateSpecDict> {
        let mut dicts = self.canonicalize(spec)?;
        if dicts.len() != 1 {
            return Err(Error::spec("a tuple state specification must describe exactly one state"));
        }
        Ok(dicts.remove(0))
    }

    fn canonicalize_dict(&self, dict: SpecDict) -> Result<Vec<StateSpecDict>> {
        let mut entries = dict.entries;
        let unknown: Vec<&str> = entries
            .iter()
            .map(|(k, _)| k.as_str())
            .filter(|k| !KEYWORDS.contains(k))
            .collect();

        if entries.len() == 1 && unknown.len() == 1 {
            let (name, entry) = entries.remove(0);
            let inner = match entry {
                SpecEntry::Spec(s) => *s,
                SpecEntry::Value(v) => StateSpec::Value(v),
                SpecEntry::Number(x) => StateSpec::Value(Value::vector([x])),
                SpecEntry::Mechanism(m) => StateSpec::Mechanism(m),
                SpecEntry::Text(t) if t == INPUT_STATE => StateSpec::Name(t),
                other => {
                    return Err(Error::spec(format!(
                        "state '{name}' cannot be specified by {}",
                        other.describe()
                    )))
                }
            };
            let mut dicts = self.canonicalize(inner)?;
            for d in &mut dicts {
                d.name = Some(name.clone());
            }
            return Ok(dicts);
        }
        if let Some(k) = unknown.first() {
            return Err(Error::spec(format!("unrecognized keyword '{k}' in state specification")));
        }

        let mut base = StateSpecDict::default();
        let mut mechanism = None;
        let mut outputs: Option<Vec<String>> = None;
        let mut size = None;
        for (key, entry) in entries {
            match (key.as_str(), entry) {
                (NAME, SpecEntry::Text(t)) => base.name = Some(t),
                (VARIABLE | VALUE, SpecEntry::Value(v)) => base.variable = Some(v),
                (VARIABLE | VALUE, SpecEntry::Number(x)) => base.variable = Some(Value::vector([x])),
                (SIZE, SpecEntry::Number(n)) => size = Some(size_from(n)?),
                (PROJECTIONS, SpecEntry::Projections(ps)) => base.projections.extend(ps),
                (WEIGHT, SpecEntry::Number(w)) => base.weight = Some(w),
                (EXPONENT, SpecEntry::Number(e)) => base.exponent = Some(e),
                (MECHANISM, SpecEntry::Mechanism(m)) => mechanism = Some(m),
                (OUTPUT_STATES, SpecEntry::Names(ns)) => outputs = Some(ns),
                (MODULATION, SpecEntry::Modulation(m)) => base.modulation = Some(m),
                (k, e) => {
                    return Err(Error::spec(format!("{k} cannot take {}", e.describe())));
                }
            }
        }
        if let Some(n) = size {
            match &base.variable {
                Some(v) if v.len() != n => {
                    return Err(Error::spec(format!(
                        "VARIABLE of length {} conflicts with SIZE {n}",
                        v.len()
                    )))
                }
                Some(_) => {}
                None => base.variable = Some(Value::zeros(n)),
            }
        }

        match (mechanism, outputs) {
            (Some(m), Some(names)) => names
                .iter()
                .map(|n| {
                    let source = self.output_state(m, n)?;
                    let mut d = base.clone();
                    d.projections.insert(0, ProjectionRef::Source(source));
                    Ok(d)
                })
                .collect(),
            (Some(m), None) => {
                base.projections.insert(0, ProjectionRef::Source(self.primary_output(m)?));
                Ok(vec![base])
            }
            (None, Some(_)) => Err(Error::spec("OUTPUT_STATES requires MECHANISM")),
            (None, None) => Ok(vec![base]),
        }
    }

    /// Wire one projection reference into `receiver`.
    pub(crate) fn connect_ref(&mut self, pref: ProjectionRef, receiver: StateId) -> Result<ProjectionId> {
        let to = Endpoint::State(receiver);
        match pref {
            ProjectionRef::Id(pid) => {
                self.add_afferent(receiver, pid)?;
                Ok(pid)
            }
            ProjectionRef::Spec(mut ps) => {
                if ps.receiver.is_some() {
                    return Err(Error::spec("projection in a state specification already names a receiver"));
                }
                ps.receiver = Some(to);
                self.add_projection(ps)
            }
            ProjectionRef::Kind(k) => self.add_projection(ProjectionSpec::new(k).to(to)),
            ProjectionRef::Source(s) => self.add_projection(ProjectionSpec::mapping().from(Endpoint::State(s)).to(to)),
            ProjectionRef::Matrix(m) => self.add_projection(ProjectionSpec::mapping().with_matrix(m).to(to)),
        }
    }

    /// Receiver shape implied by the first projection that determines one.
    pub(crate) fn infer_variable(&self, refs: &[ProjectionRef]) -> Option<Value> {
        for r in refs {
            match r {
                ProjectionRef::Source(s) => {
                    return self.states.get(s.index()).map(|st| Value::zeros(st.value.len()));
                }
                ProjectionRef::Spec(ps) => {
                    if let Some(MatrixSpec::Explicit(m)) = &ps.matrix {
                        if m.is_matrix() {
                            return Some(Value::zeros(m.cols()));
                        }
                    }
                    if let Some(end) = &ps.sender {
                        if let Ok(Some(s)) = self.resolve_sender(end) {
                            return Some(Value::zeros(self.states[s.index()].value.len()));
                        }
                    }
                }
                ProjectionRef::Matrix(MatrixSpec::Explicit(m)) if m.is_matrix() => {
                    return Some(Value::zeros(m.cols()));
                }
                ProjectionRef::Id(pid) => match self.projections.get(pid.index()) {
                    Some(ProjectionSlot::Ready(p)) if p.kind.is_pathway() => {
                        return Some(Value::zeros(p.value.len()));
                    }
                    _ => {}
                },
                _ => {}
            }
        }
        None
    }
}

/// Fold a tuple's projection into a dict, merging it with a bare source.
/// A SIZE entry must be a whole, non-negative number.
pub(crate) fn size_from(n: f64) -> Result<usize> {
    if !n.is_finite() || n < 0.0 || n.fract() != 0.0 {
        return Err(Error::spec(format!("{SIZE} must be a non-negative whole number, got {n}")));
    }
    Ok(n as usize)
}

fn attach_projection(d: &mut StateSpecDict, p: ProjectionRef) {
    let source = match d.projections.last() {
        Some(ProjectionRef::Source(s)) => Some(*s),
        _ => None,
    };
    let merged = match (source, p) {
        (Some(s), ProjectionRef::Spec(mut ps)) if ps.sender.is_none() => {
            ps.sender = Some(Endpoint::State(s));
            Some(ProjectionRef::Spec(ps))
        }
        (Some(s), ProjectionRef::Kind(k)) => Some(ProjectionRef::Spec(ProjectionSpec::new(k).from(Endpoint::State(s)))),
        (Some(s), ProjectionRef::Matrix(m)) => Some(ProjectionRef::Spec(
            ProjectionSpec::mapping().from(Endpoint::State(s)).with_matrix(m),
        )),
        (_, other) => {
            d.projections.push(other);
            None
        }
    };
    if let Some(m) = merged {
        d.projections.pop();
        d.projections.push(m);
    }
}
