//! Deferred initialization of projections.
//!
//! A projection created without one of its endpoints is kept as a
//! [`ProjectionSlot::Partial`] holding its constructor arguments. Any later
//! event that supplies the missing endpoint re-runs the constructor; a
//! partial slot never appears on a State's afferent or efferent lists.

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{Model, ProjectionId, StateId};
use crate::projection::{Endpoint, ProjectionSlot};

impl Model {
    pub fn deferred_projections(&self) -> Vec<ProjectionId> {
        self.projections
            .iter()
            .enumerate()
            .filter(|(_, p)| matches!(p, ProjectionSlot::Partial(_)))
            .map(|(i, _)| self.projection_id(i))
            .collect()
    }

    /// Complete `pid` if both endpoints now resolve. Returns whether the
    /// projection is initialized.
    ///
    /// When construction fails the slot drops its receiver, so it stays
    /// deferred and later completion passes skip it.
    pub(crate) fn try_complete(&mut self, pid: ProjectionId) -> Result<bool> {
        let spec = match &self.projections[pid.index()] {
            ProjectionSlot::Partial(p) => p.spec.clone(),
            ProjectionSlot::Ready(_) => return Ok(true),
        };
        let (send, recv) = match (&spec.sender, &spec.receiver) {
            (Some(s), Some(r)) => (s, r),
            _ => return Ok(false),
        };
        let sender = match self.resolve_sender(send)? {
            Some(s) => s,
            None => return Ok(false),
        };
        let receiver = match self.resolve_receiver(recv, spec.kind)? {
            Some(r) => r,
            None => return Ok(false),
        };

        let states_before = self.states.len();
        let projection = match self.build_projection(pid, &spec, sender, receiver) {
            Ok(p) => p,
            Err(e) => {
                self.states.truncate(states_before);
                if let ProjectionSlot::Partial(p) = &mut self.projections[pid.index()] {
                    p.spec.receiver = None;
                }
                warn!(projection = %pid, error = %e, "projection construction failed");
                return Err(e);
            }
        };
        debug!(projection = %projection.name, "deferred projection initialized");
        self.states[sender.index()].add_efferent(pid);
        self.states[receiver.index()].add_afferent(pid, spec.kind.is_modulatory());
        self.projections[pid.index()] = ProjectionSlot::Ready(projection);
        Ok(true)
    }

    /// Repeat completion passes until nothing changes.
    pub(crate) fn resolve_deferred(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            let mut progressed = 0;
            for pid in self.deferred_projections() {
                if self.try_complete(pid)? {
                    progressed += 1;
                }
            }
            if progressed == 0 {
                return Ok(total);
            }
            total += progressed;
        }
    }

    pub(crate) fn inject_sender(&mut self, pid: ProjectionId, sender: Endpoint) -> Result<()> {
        self.check_projection(pid)?;
        match &mut self.projections[pid.index()] {
            ProjectionSlot::Partial(p) => match &p.spec.sender {
                Some(existing) if *existing != sender => {
                    Err(Error::connection(format!("{pid} already names a different sender")))
                }
                _ => {
                    p.spec.sender = Some(sender);
                    Ok(())
                }
            },
            ProjectionSlot::Ready(_) => Err(Error::connection(format!("{pid} is already initialized"))),
        }
    }

    pub(crate) fn inject_receiver(&mut self, pid: ProjectionId, receiver: Endpoint) -> Result<()> {
        self.check_projection(pid)?;
        match &mut self.projections[pid.index()] {
            ProjectionSlot::Partial(p) => match &p.spec.receiver {
                Some(existing) if *existing != receiver => {
                    Err(Error::connection(format!("{pid} already names a different receiver")))
                }
                _ => {
                    p.spec.receiver = Some(receiver);
                    Ok(())
                }
            },
            ProjectionSlot::Ready(_) => Err(Error::connection(format!("{pid} is already initialized"))),
        }
    }

    /// Make `state` the receiver of `pid`, completing it if it was deferred.
    pub fn add_afferent(&mut self, state: StateId, pid: ProjectionId) -> Result<()> {
        self.check_state(state)?;
        self.check_projection(pid)?;
        if let ProjectionSlot::Ready(p) = &self.projections[pid.index()] {
            if p.receiver == state {
                return Ok(());
            }
            return Err(Error::connection(format!("'{}' already has a receiver", p.name)));
        }
        self.inject_receiver(pid, Endpoint::State(state))?;
        self.try_complete(pid)?;
        self.resolve_deferred()?;
        Ok(())
    }

    /// Make `state` the sender of `pid`, completing it if it was deferred.
    pub fn add_efferent(&mut self, state: StateId, pid: ProjectionId) -> Result<()> {
        self.check_state(state)?;
        self.check_projection(pid)?;
        if let ProjectionSlot::Ready(p) = &self.projections[pid.index()] {
            if p.sender == state {
                return Ok(());
            }
            return Err(Error::connection(format!("'{}' already has a sender", p.name)));
        }
        self.inject_sender(pid, Endpoint::State(state))?;
        self.try_complete(pid)?;
        self.resolve_deferred()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::function::MATRIX;
    use crate::mechanism::MechanismSpec;
    use crate::model::Model;
    use crate::projection::{Endpoint, MatrixSpec, ProjectionSpec};
    use crate::value::Value;

    #[test]
    fn mapping_waits_for_its_receiver() {
        let mut model = Model::new("m");
        let a = model.add_mechanism(MechanismSpec::transfer().named("A").with_size(2)).unwrap();
        let b = model.add_mechanism(MechanismSpec::transfer().named("B").with_size(1)).unwrap();
        let p = model
            .add_projection(
                ProjectionSpec::mapping()
                    .from(Endpoint::Mechanism(a))
                    .with_matrix(MatrixSpec::Full(0.5)),
            )
            .unwrap();
        assert!(model.is_deferred(p).unwrap());
        let b_in = model.primary_input(b).unwrap();
        assert!(model.state(b_in).unwrap().path_afferents().is_empty());

        model.add_afferent(b_in, p).unwrap();
        assert!(!model.is_deferred(p).unwrap());
        assert_eq!(model.state(b_in).unwrap().path_afferents(), &[p]);
        assert_eq!(model.projection_param(p, MATRIX).unwrap(), Value::full(2, 1, 0.5));
    }

    #[test]
    fn learning_projection_waits_for_its_target_projection() {
        let mut model = Model::new("m");
        let a = model.add_mechanism(MechanismSpec::transfer().named("A").with_size(2)).unwrap();
        let b = model.add_mechanism(MechanismSpec::transfer().named("B").with_size(2)).unwrap();
        let mapping = model.add_projection(ProjectionSpec::mapping().from(Endpoint::Mechanism(a))).unwrap();
        let learning = model
            .add_projection(ProjectionSpec::learning().to(Endpoint::ProjectionParameter(mapping, MATRIX.into())))
            .unwrap();
        model.add_afferent(model.primary_input(b).unwrap(), mapping).unwrap();
        // Still missing a sender.
        assert!(model.is_deferred(learning).unwrap());
        assert_eq!(model.deferred_projections(), vec![learning]);
    }

    #[test]
    fn rejected_receiver_does_not_block_later_changes() {
        let mut model = Model::new("m");
        let a = model.add_mechanism(MechanismSpec::transfer().named("A").with_size(2)).unwrap();
        let b = model.add_mechanism(MechanismSpec::transfer().named("B").with_size(2)).unwrap();
        let p = model
            .add_projection(
                ProjectionSpec::mapping()
                    .from(Endpoint::Mechanism(a))
                    .with_matrix(MatrixSpec::Explicit(Value::identity(3))),
            )
            .unwrap();
        let b_in = model.primary_input(b).unwrap();
        assert!(model.add_afferent(b_in, p).is_err());
        assert!(model.state(b_in).unwrap().path_afferents().is_empty());
        assert_eq!(model.deferred_projections(), vec![p]);

        let c = model.add_mechanism(MechanismSpec::transfer().named("C").with_size(2)).unwrap();
        model
            .add_projection(ProjectionSpec::mapping().from(Endpoint::Mechanism(a)).to(Endpoint::Mechanism(c)))
            .unwrap();
        assert_eq!(model.deferred_projections(), vec![p]);
    }

    #[test]
    fn second_receiver_is_rejected() {
        let mut model = Model::new("m");
        let a = model.add_mechanism(MechanismSpec::transfer().named("A")).unwrap();
        let b = model.add_mechanism(MechanismSpec::transfer().named("B")).unwrap();
        let c = model.add_mechanism(MechanismSpec::transfer().named("C")).unwrap();
        let p = model
            .add_projection(ProjectionSpec::mapping().from(Endpoint::Mechanism(a)).to(Endpoint::Mechanism(b)))
            .unwrap();
        let c_in = model.primary_input(c).unwrap();
        assert!(model.add_afferent(c_in, p).is_err());
    }
}
