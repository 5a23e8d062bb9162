//! The arena that owns every Mechanism, State and Projection of one
//! composition.
//!
//! Components refer to each other by id rather than by reference, so the
//! back-references a neural graph needs (state -> owner, projection ->
//! sender/receiver) never fight the borrow checker. Ids are tagged with the
//! model that minted them.

use core::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use hashbrown::{HashMap, HashSet};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::function::Params;
use crate::mechanism::Mechanism;
use crate::prng::Prng;
use crate::projection::{Projection, ProjectionSlot};
use crate::state::{Owner, State, StateKind};
use crate::value::Value;

static NEXT_MODEL_TAG: AtomicU32 = AtomicU32::new(1);

macro_rules! arena_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        pub struct $name {
            model: u32,
            index: u32,
        }

        impl $name {
            pub(crate) fn new(model: u32, index: usize) -> Self {
                Self {
                    model,
                    index: index as u32,
                }
            }

            #[inline]
            pub fn index(&self) -> usize {
                self.index as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.index)
            }
        }
    };
}

arena_id!(MechanismId, "mechanism");
arena_id!(StateId, "state");
arena_id!(ProjectionId, "projection");

/// Marks which run context a mechanism last executed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExecutionId(pub u64);

/// Per-call parameter overrides, keyed by mechanism.
pub type RuntimeParams = HashMap<MechanismId, Params>;

pub(crate) struct ExecContext<'a> {
    pub(crate) execution: ExecutionId,
    pub(crate) runtime: Option<&'a RuntimeParams>,
}

impl<'a> ExecContext<'a> {
    pub(crate) fn new(execution: ExecutionId, runtime: Option<&'a RuntimeParams>) -> Self {
        Self { execution, runtime }
    }

    pub(crate) fn runtime_for(&self, mechanism: MechanismId) -> Option<&'a Params> {
        self.runtime.and_then(|r| r.get(&mechanism))
    }
}

pub(crate) const MECHANISM_SCOPE: &str = "mechanisms";
pub(crate) const PROJECTION_SCOPE: &str = "projections";
pub(crate) const UNOWNED_SCOPE: &str = "states";

/// Hands out names unique within a scope, suffixing `-1`, `-2`, ... on
/// collision.
#[derive(Debug, Clone, Default)]
pub(crate) struct NameRegistry {
    scopes: HashMap<String, HashSet<String>>,
}

impl NameRegistry {
    pub(crate) fn claim(&mut self, scope: &str, desired: &str) -> Result<String> {
        let desired = desired.trim();
        if desired.is_empty() {
            return Err(Error::spec("component names must not be empty"));
        }
        let used = self.scopes.entry(scope.to_string()).or_default();
        if used.insert(desired.to_string()) {
            return Ok(desired.to_string());
        }
        let mut n = 1usize;
        loop {
            let candidate = format!("{desired}-{n}");
            if used.insert(candidate.clone()) {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    pub(crate) fn release(&mut self, scope: &str, name: &str) {
        if let Some(used) = self.scopes.get_mut(scope) {
            used.remove(name);
        }
    }
}

/// State names are unique per owner and per state list.
pub(crate) fn owner_scope(owner: Owner, kind: &StateKind) -> String {
    let list = match kind {
        StateKind::Input(_) => "input",
        StateKind::Parameter(_) => "parameter",
        StateKind::Output(_) | StateKind::Signal(_) => "output",
    };
    match owner {
        Owner::Mechanism(m) => format!("{m}/{list}"),
        Owner::Projection(p) => format!("{p}/{list}"),
    }
}

#[derive(Debug)]
pub struct Model {
    tag: u32,
    name: String,
    pub(crate) mechanisms: Vec<Mechanism>,
    pub(crate) states: Vec<State>,
    pub(crate) projections: Vec<ProjectionSlot>,
    pub(crate) names: NameRegistry,
    pub(crate) execution: ExecutionId,
    next_execution: u64,
    pub(crate) prng: Prng,
    pub(crate) verbose: bool,
}

impl Default for Model {
    fn default() -> Self {
        Self::new("Model")
    }
}

impl Model {
    pub fn new(name: &str) -> Self {
        Self::with_seed(name, 0)
    }

    /// `seed` drives RANDOM connectivity matrices.
    pub fn with_seed(name: &str, seed: u64) -> Self {
        Self {
            tag: NEXT_MODEL_TAG.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            mechanisms: Vec::new(),
            states: Vec::new(),
            projections: Vec::new(),
            names: NameRegistry::default(),
            execution: ExecutionId(0),
            next_execution: 1,
            prng: Prng::new(seed),
            verbose: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Verbose models report skipped projections at `warn` level.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution
    }

    pub(crate) fn new_execution_id(&mut self) -> ExecutionId {
        let id = ExecutionId(self.next_execution);
        self.next_execution += 1;
        self.execution = id;
        id
    }

    // ---------------------------------------------------------------------
    // Arena plumbing

    pub(crate) fn push_mechanism(&mut self, m: Mechanism) -> MechanismId {
        self.mechanisms.push(m);
        MechanismId::new(self.tag, self.mechanisms.len() - 1)
    }

    pub(crate) fn push_state(&mut self, s: State) -> StateId {
        self.states.push(s);
        StateId::new(self.tag, self.states.len() - 1)
    }

    pub(crate) fn push_projection(&mut self, p: ProjectionSlot) -> ProjectionId {
        self.projections.push(p);
        ProjectionId::new(self.tag, self.projections.len() - 1)
    }

    fn foreign(what: impl fmt::Display) -> Error {
        Error::connection(format!("{what} is not in the same composition"))
    }

    pub(crate) fn check_mechanism(&self, id: MechanismId) -> Result<()> {
        if id.model != self.tag || id.index() >= self.mechanisms.len() {
            return Err(Self::foreign(id));
        }
        Ok(())
    }

    pub(crate) fn check_state(&self, id: StateId) -> Result<()> {
        if id.model != self.tag || id.index() >= self.states.len() {
            return Err(Self::foreign(id));
        }
        Ok(())
    }

    pub(crate) fn check_projection(&self, id: ProjectionId) -> Result<()> {
        if id.model != self.tag || id.index() >= self.projections.len() {
            return Err(Self::foreign(id));
        }
        Ok(())
    }

    pub(crate) fn mechanism_id(&self, index: usize) -> MechanismId {
        MechanismId::new(self.tag, index)
    }

    pub(crate) fn projection_id(&self, index: usize) -> ProjectionId {
        ProjectionId::new(self.tag, index)
    }

    /// Give an unowned State its owner. A State is attached exactly once.
    pub(crate) fn attach_state(&mut self, sid: StateId, owner: Owner) -> Result<()> {
        self.check_state(sid)?;
        let current = self.states[sid.index()].owner;
        if let Some(existing) = current {
            if existing == owner {
                return Ok(());
            }
            return Err(Error::spec(format!(
                "state '{}' already belongs to another component",
                self.states[sid.index()].name
            )));
        }
        let old = self.states[sid.index()].name.clone();
        self.names.release(UNOWNED_SCOPE, &old);
        let name = self.names.claim(&owner_scope(owner, &self.states[sid.index()].kind), &old)?;
        let state = &mut self.states[sid.index()];
        state.name = name;
        state.owner = Some(owner);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Structural inspection

    pub fn mechanism(&self, id: MechanismId) -> Result<&Mechanism> {
        self.check_mechanism(id)?;
        Ok(&self.mechanisms[id.index()])
    }

    pub fn state(&self, id: StateId) -> Result<&State> {
        self.check_state(id)?;
        Ok(&self.states[id.index()])
    }

    pub fn slot(&self, id: ProjectionId) -> Result<&ProjectionSlot> {
        self.check_projection(id)?;
        Ok(&self.projections[id.index()])
    }

    /// The completed projection; deferred ones report a `Deferred` error.
    pub fn projection(&self, id: ProjectionId) -> Result<&Projection> {
        match self.slot(id)? {
            ProjectionSlot::Ready(p) => Ok(p),
            ProjectionSlot::Partial(_) => Err(Error::deferred(format!("{id} is still deferred"))),
        }
    }

    pub(crate) fn ready(&self, id: ProjectionId) -> Option<&Projection> {
        match self.projections.get(id.index()) {
            Some(ProjectionSlot::Ready(p)) => Some(p),
            _ => None,
        }
    }

    pub(crate) fn ready_mut(&mut self, id: ProjectionId) -> Option<&mut Projection> {
        match self.projections.get_mut(id.index()) {
            Some(ProjectionSlot::Ready(p)) => Some(p),
            _ => None,
        }
    }

    pub fn is_deferred(&self, id: ProjectionId) -> Result<bool> {
        Ok(matches!(self.slot(id)?, ProjectionSlot::Partial(_)))
    }

    pub fn mechanisms(&self) -> Vec<MechanismId> {
        (0..self.mechanisms.len()).map(|i| self.mechanism_id(i)).collect()
    }

    pub fn projections(&self) -> Vec<ProjectionId> {
        (0..self.projections.len()).map(|i| self.projection_id(i)).collect()
    }

    pub fn find_mechanism(&self, name: &str) -> Option<MechanismId> {
        self.mechanisms
            .iter()
            .position(|m| m.name == name)
            .map(|i| self.mechanism_id(i))
    }

    pub fn input_states(&self, m: MechanismId) -> Result<&[StateId]> {
        Ok(&self.mechanism(m)?.input_states)
    }

    pub fn parameter_states(&self, m: MechanismId) -> Result<&[StateId]> {
        Ok(&self.mechanism(m)?.parameter_states)
    }

    pub fn output_states(&self, m: MechanismId) -> Result<&[StateId]> {
        Ok(&self.mechanism(m)?.output_states)
    }

    pub fn primary_input(&self, m: MechanismId) -> Result<StateId> {
        self.input_states(m)?
            .first()
            .copied()
            .ok_or_else(|| Error::spec(format!("'{}' has no input state", self.mechanisms[m.index()].name)))
    }

    pub fn primary_output(&self, m: MechanismId) -> Result<StateId> {
        self.output_states(m)?
            .first()
            .copied()
            .ok_or_else(|| Error::spec(format!("'{}' has no output state", self.mechanisms[m.index()].name)))
    }

    fn named_in(&self, list: &[StateId], name: &str, owner: &str, what: &str) -> Result<StateId> {
        list.iter()
            .copied()
            .find(|s| self.states[s.index()].name == name)
            .ok_or_else(|| Error::spec(format!("'{owner}' has no {what} named '{name}'")))
    }

    pub fn input_state(&self, m: MechanismId, name: &str) -> Result<StateId> {
        let mech = self.mechanism(m)?;
        self.named_in(&mech.input_states, name, &mech.name, "input state")
    }

    pub fn output_state(&self, m: MechanismId, name: &str) -> Result<StateId> {
        let mech = self.mechanism(m)?;
        self.named_in(&mech.output_states, name, &mech.name, "output state")
    }

    pub fn parameter_state(&self, m: MechanismId, param: &str) -> Result<StateId> {
        let mech = self.mechanism(m)?;
        self.named_in(&mech.parameter_states, param, &mech.name, "parameter")
    }

    pub fn projection_parameter_state(&self, p: ProjectionId, param: &str) -> Result<StateId> {
        let proj = self.projection(p)?;
        self.named_in(&proj.parameter_states, param, &proj.name, "parameter")
    }

    /// Late-bound read of a mechanism parameter: the value its ParameterState
    /// last produced, modulation included.
    pub fn current_value(&self, m: MechanismId, param: &str) -> Result<Value> {
        let sid = self.parameter_state(m, param)?;
        Ok(self.states[sid.index()].value.clone())
    }

    pub fn projection_param(&self, p: ProjectionId, param: &str) -> Result<Value> {
        let sid = self.projection_parameter_state(p, param)?;
        Ok(self.states[sid.index()].value.clone())
    }

    /// Current matrix of a pathway projection.
    pub fn matrix(&self, p: ProjectionId) -> Result<Value> {
        self.projection(p)?.effective_matrix(self)
    }

    pub fn output_values(&self, m: MechanismId) -> Result<Vec<Value>> {
        Ok(self
            .output_states(m)?
            .iter()
            .map(|s| self.states[s.index()].value.clone())
            .collect())
    }

    /// Mechanism owning `state`, directly or through a projection.
    pub fn owning_mechanism(&self, state: StateId) -> Result<Option<MechanismId>> {
        Ok(match self.state(state)?.owner {
            Some(Owner::Mechanism(m)) => Some(m),
            Some(Owner::Projection(p)) => match self.ready(p) {
                Some(proj) => self.states[proj.receiver.index()].owner_mechanism(),
                None => None,
            },
            None => None,
        })
    }

    /// Stand-alone, unowned InputState; attach it later through
    /// [`StateSpec::Instance`](crate::state_spec::StateSpec::Instance).
    pub fn create_state(&mut self, name: &str, variable: impl Into<Value>) -> Result<StateId> {
        let name = self.names.claim(UNOWNED_SCOPE, name)?;
        let variable = variable.into();
        Ok(self.push_state(State::new(
            name,
            StateKind::Input(crate::state::InputStateParams {
                weight: 1.0,
                exponent: 1.0,
                modulation: None,
            }),
            variable,
        )))
    }

    pub fn set_projection_enabled(&mut self, p: ProjectionId, enabled: bool) -> Result<()> {
        self.check_projection(p)?;
        match &mut self.projections[p.index()] {
            ProjectionSlot::Ready(proj) => {
                proj.enabled = enabled;
                Ok(())
            }
            ProjectionSlot::Partial(_) => Err(Error::deferred(format!("{p} is still deferred"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanism::MechanismSpec;

    #[test]
    fn names_are_suffixed_deterministically() {
        let mut r = NameRegistry::default();
        assert_eq!(r.claim("m", "A").unwrap(), "A");
        assert_eq!(r.claim("m", "A").unwrap(), "A-1");
        assert_eq!(r.claim("m", "A").unwrap(), "A-2");
        assert_eq!(r.claim("other", "A").unwrap(), "A");
        assert!(matches!(r.claim("m", "  "), Err(Error::Specification(_))));
    }

    #[test]
    fn ids_from_another_model_are_rejected() {
        let mut a = Model::new("a");
        let b = Model::new("b");
        let m = a.add_mechanism(MechanismSpec::transfer().named("A")).unwrap();
        assert!(a.mechanism(m).is_ok());
        assert!(matches!(b.mechanism(m), Err(Error::Connection(_))));
    }

    #[test]
    fn states_attach_once() {
        let mut model = Model::new("m");
        let a = model.add_mechanism(MechanismSpec::transfer().named("A")).unwrap();
        let b = model.add_mechanism(MechanismSpec::transfer().named("B")).unwrap();
        let s = model.create_state("free", Value::zeros(1)).unwrap();
        model.attach_state(s, Owner::Mechanism(a)).unwrap();
        let err = model.attach_state(s, Owner::Mechanism(b)).unwrap_err();
        assert!(matches!(err, Error::Specification(_)));
    }
}
