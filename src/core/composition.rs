//! Processes and Systems: pathway assembly, role analysis and trial execution.
//!
//! A [`System`] consumes the [`Model`] it is built from, so no mechanism can
//! belong to two compositions. Assembly wires pathways, inserts learning
//! machinery, lets the controller and gater adopt deferred projections, and
//! derives three dependency graphs: processing, learning and control. Each
//! graph gets its own [`Scheduler`]; a trial runs them in that order.

use std::ops::ControlFlow;

use hashbrown::{HashMap, HashSet};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use tracing::{debug, info, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::adaptive::{AdaptiveKind, ErrorInput, ERROR_SIGNAL};
use crate::error::{Error, Result};
use crate::function::{Params, MATRIX};
use crate::learning::{LearningFunction, LearningRule};
use crate::mechanism::{MechanismKind, MechanismSpec, OutputStateSpec, OUTCOME};
use crate::model::{ExecContext, ExecutionId, MechanismId, Model, ProjectionId, RuntimeParams};
use crate::prng::Prng;
use crate::projection::{Endpoint, MatrixSpec, ProjectionKind, ProjectionSlot, ProjectionSpec};
use crate::scheduler::{Condition, ExecutionHost, Scheduler, TrialTrace, DEFAULT_MAX_PASSES};
use crate::state::MSE;
use crate::state_spec::{ProjectionRef, SpecDict, StateSpec, NAME, PROJECTIONS, VARIABLE, WEIGHT};
use crate::value::Value;

pub const SAMPLE: &str = "SAMPLE";
pub const TARGET: &str = "TARGET";

/// Stimuli per mechanism, one value per trial.
pub type Inputs = HashMap<MechanismId, Vec<Value>>;

pub fn inputs<I>(pairs: I) -> Inputs
where
    I: IntoIterator<Item = (MechanismId, Vec<Value>)>,
{
    pairs.into_iter().collect()
}

#[derive(Debug, Clone)]
pub enum PathwayItem {
    Mechanism(MechanismId),
    /// An existing projection; a deferred one gets its missing ends from
    /// its neighbours in the pathway.
    Projection(ProjectionId),
    /// Shorthand for a new MappingProjection with this matrix.
    Matrix(MatrixSpec),
}

impl From<MechanismId> for PathwayItem {
    fn from(m: MechanismId) -> Self {
        PathwayItem::Mechanism(m)
    }
}

impl From<ProjectionId> for PathwayItem {
    fn from(p: ProjectionId) -> Self {
        PathwayItem::Projection(p)
    }
}

impl From<MatrixSpec> for PathwayItem {
    fn from(m: MatrixSpec) -> Self {
        PathwayItem::Matrix(m)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LearningSpec {
    pub rule: LearningRule,
    /// Rate carried by the LearningSignals; 1 when unset.
    pub learning_rate: Option<f64>,
}

impl Default for LearningSpec {
    fn default() -> Self {
        Self {
            rule: LearningRule::BackPropagation,
            learning_rate: None,
        }
    }
}

impl LearningSpec {
    pub fn new(rule: LearningRule) -> Self {
        Self {
            rule,
            learning_rate: None,
        }
    }

    pub fn with_learning_rate(mut self, rate: f64) -> Self {
        self.learning_rate = Some(rate);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    name: String,
    pathway: Vec<PathwayItem>,
    learning: Option<LearningSpec>,
}

impl ProcessSpec {
    pub fn new<I, P>(name: &str, pathway: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathwayItem>,
    {
        Self {
            name: name.to_string(),
            pathway: pathway.into_iter().map(Into::into).collect(),
            learning: None,
        }
    }

    pub fn with_learning(mut self, learning: LearningSpec) -> Self {
        self.learning = Some(learning);
        self
    }
}

/// An assembled pathway.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    name: String,
    pathway: Vec<MechanismId>,
    projections: Vec<ProjectionId>,
    comparator: Option<MechanismId>,
    learning: Vec<MechanismId>,
}

impl ProcessRecord {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pathway(&self) -> &[MechanismId] {
        &self.pathway
    }

    pub fn projections(&self) -> &[ProjectionId] {
        &self.projections
    }

    pub fn comparator(&self) -> Option<MechanismId> {
        self.comparator
    }

    pub fn learning_mechanisms(&self) -> &[MechanismId] {
        &self.learning
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Role {
    Origin,
    Internal,
    Terminal,
    /// Comparator receiving training targets.
    Target,
    InitializeCycle,
    Learning,
    Control,
    Gating,
    /// Aggregates what a Control or Gating mechanism monitors.
    Monitoring,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::Origin => "ORIGIN",
            Role::Internal => "INTERNAL",
            Role::Terminal => "TERMINAL",
            Role::Target => "TARGET",
            Role::InitializeCycle => "INITIALIZE_CYCLE",
            Role::Learning => "LEARNING",
            Role::Control => "CONTROL",
            Role::Gating => "GATING",
            Role::Monitoring => "MONITORING",
        }
    }
}

/// What to do with projections still deferred after assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UnresolvedPolicy {
    #[default]
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub name: String,
    /// Defaults to the first ControlMechanism in the model.
    pub controller: Option<MechanismId>,
    pub verbose: bool,
    pub unresolved: UnresolvedPolicy,
    /// Primary value seeded into INITIALIZE_CYCLE mechanisms; a mechanism
    /// listed here is also preferred when breaking its cycle.
    pub initial_values: HashMap<MechanismId, Value>,
    pub max_passes: u64,
    pub learning: bool,
    /// Reseeds the model's PRNG before pathway projections are built.
    pub seed: Option<u64>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self::new("System")
    }
}

impl SystemConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            controller: None,
            verbose: false,
            unresolved: UnresolvedPolicy::Warn,
            initial_values: HashMap::new(),
            max_passes: DEFAULT_MAX_PASSES,
            learning: true,
            seed: None,
        }
    }

    pub fn with_controller(mut self, controller: MechanismId) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_unresolved(mut self, policy: UnresolvedPolicy) -> Self {
        self.unresolved = policy;
        self
    }

    pub fn with_initial_value(mut self, m: MechanismId, value: impl Into<Value>) -> Self {
        self.initial_values.insert(m, value.into());
        self
    }

    pub fn with_max_passes(mut self, max_passes: u64) -> Self {
        self.max_passes = max_passes;
        self
    }

    pub fn with_learning(mut self, enabled: bool) -> Self {
        self.learning = enabled;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Per-run knobs.
#[derive(Default)]
pub struct RunOptions<'a> {
    /// Defaults to the longest stimulus list; shorter lists repeat.
    pub num_trials: Option<u64>,
    /// Keyed by TERMINAL mechanism or by its comparator.
    pub targets: Option<&'a Inputs>,
    pub call_before_trial: Option<&'a mut dyn FnMut(u64)>,
    /// `Break` stops the run after the current trial.
    pub call_after_trial: Option<&'a mut dyn FnMut(&TrialOutput) -> ControlFlow<()>>,
    pub termination_processing: Option<Condition>,
    pub termination_learning: Option<Condition>,
    pub runtime_params: RuntimeParams,
}

impl<'a> RunOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trials(mut self, n: u64) -> Self {
        self.num_trials = Some(n);
        self
    }

    pub fn with_targets(mut self, targets: &'a Inputs) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn before_trial(mut self, f: &'a mut dyn FnMut(u64)) -> Self {
        self.call_before_trial = Some(f);
        self
    }

    pub fn after_trial(mut self, f: &'a mut dyn FnMut(&TrialOutput) -> ControlFlow<()>) -> Self {
        self.call_after_trial = Some(f);
        self
    }

    pub fn terminate_processing(mut self, c: Condition) -> Self {
        self.termination_processing = Some(c);
        self
    }

    pub fn terminate_learning(mut self, c: Condition) -> Self {
        self.termination_learning = Some(c);
        self
    }

    pub fn with_runtime_params(mut self, m: MechanismId, params: Params) -> Self {
        self.runtime_params.insert(m, params);
        self
    }
}

/// TERMINAL outputs after one trial, plus the processing schedule it ran.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrialOutput {
    pub trial: u64,
    pub outputs: Vec<(MechanismId, Vec<Value>)>,
    pub trace: TrialTrace,
}

impl TrialOutput {
    pub fn of(&self, m: MechanismId) -> Option<&[Value]> {
        self.outputs.iter().find(|(id, _)| *id == m).map(|(_, v)| v.as_slice())
    }
}

/// Adapts the model to the scheduler: every member of a set computes from
/// previously published values, then all publish together.
struct ModelHost<'a> {
    model: &'a mut Model,
    ctx: ExecContext<'a>,
    externals: &'a HashMap<MechanismId, Vec<Option<Value>>>,
}

impl ExecutionHost for ModelHost<'_> {
    fn execute_set(&mut self, set: &[MechanismId]) -> Result<()> {
        let mut pending = Vec::with_capacity(set.len());
        for m in set {
            let external = self.externals.get(m).map(|v| v.as_slice());
            pending.push(self.model.compute(*m, &self.ctx, external)?);
        }
        for p in pending {
            self.model.publish(p, self.ctx.execution);
        }
        Ok(())
    }

    fn is_finished(&self, m: MechanismId) -> bool {
        self.model.mechanisms[m.index()].is_finished()
    }
}

impl Model {
    fn pathway_projection_between(&self, from: MechanismId, to: MechanismId) -> Option<ProjectionId> {
        self.mechanisms[from.index()]
            .output_states
            .iter()
            .flat_map(|s| self.states[s.index()].efferents.iter().copied())
            .find(|p| match self.ready(*p) {
                Some(proj) => {
                    proj.kind.is_pathway() && self.states[proj.receiver.index()].owner_mechanism() == Some(to)
                }
                None => false,
            })
    }

    fn link(&mut self, from: MechanismId, to: MechanismId, via: Option<&PathwayItem>) -> Result<ProjectionId> {
        match via {
            None => match self.pathway_projection_between(from, to) {
                Some(p) => Ok(p),
                None => self.add_projection(
                    ProjectionSpec::mapping()
                        .from(Endpoint::Mechanism(from))
                        .to(Endpoint::Mechanism(to)),
                ),
            },
            Some(PathwayItem::Matrix(m)) => self.add_projection(
                ProjectionSpec::mapping()
                    .from(Endpoint::Mechanism(from))
                    .to(Endpoint::Mechanism(to))
                    .with_matrix(m.clone()),
            ),
            Some(PathwayItem::Projection(p)) => {
                let p = *p;
                self.check_projection(p)?;
                if self.is_deferred(p)? {
                    let (has_sender, has_receiver) = match self.slot(p)? {
                        ProjectionSlot::Partial(part) => (part.spec.sender.is_some(), part.spec.receiver.is_some()),
                        ProjectionSlot::Ready(_) => (true, true),
                    };
                    if !has_sender {
                        self.inject_sender(p, Endpoint::Mechanism(from))?;
                    }
                    if !has_receiver {
                        self.inject_receiver(p, Endpoint::Mechanism(to))?;
                    }
                    if !self.try_complete(p)? {
                        return Err(Error::deferred(format!("{p} could not be completed from its pathway")));
                    }
                    self.resolve_deferred()?;
                }
                let proj = self.projection(p)?;
                let sender = self.states[proj.sender.index()].owner_mechanism();
                let receiver = self.states[proj.receiver.index()].owner_mechanism();
                if sender != Some(from) || receiver != Some(to) {
                    return Err(Error::connection(format!(
                        "'{}' does not connect '{}' to '{}'",
                        proj.name,
                        self.mechanisms[from.index()].name,
                        self.mechanisms[to.index()].name
                    )));
                }
                Ok(p)
            }
            Some(PathwayItem::Mechanism(_)) => Err(Error::spec("a mechanism cannot link two mechanisms")),
        }
    }

    fn assemble_process(&mut self, spec: &ProcessSpec) -> Result<ProcessRecord> {
        let mut pathway = Vec::new();
        let mut projections = Vec::new();
        let mut pending: Option<&PathwayItem> = None;
        for item in &spec.pathway {
            match item {
                PathwayItem::Mechanism(m) => {
                    self.check_mechanism(*m)?;
                    if !matches!(self.mechanisms[m.index()].kind, MechanismKind::Processing(_)) {
                        return Err(Error::spec(format!(
                            "pathway of '{}' may only hold processing mechanisms",
                            spec.name
                        )));
                    }
                    if let Some(&prev) = pathway.last() {
                        projections.push(self.link(prev, *m, pending.take())?);
                    } else if pending.is_some() {
                        return Err(Error::spec(format!("pathway of '{}' starts with a projection", spec.name)));
                    }
                    pathway.push(*m);
                }
                _ => {
                    if pending.is_some() {
                        return Err(Error::spec(format!(
                            "pathway of '{}' has two projections in a row",
                            spec.name
                        )));
                    }
                    pending = Some(item);
                }
            }
        }
        if pathway.is_empty() {
            return Err(Error::spec(format!("pathway of '{}' has no mechanisms", spec.name)));
        }
        if pending.is_some() {
            return Err(Error::spec(format!("pathway of '{}' ends with a projection", spec.name)));
        }

        let mut record = ProcessRecord {
            name: spec.name.clone(),
            pathway,
            projections,
            comparator: None,
            learning: Vec::new(),
        };
        if let Some(learning) = spec.learning {
            self.add_pathway_learning(&mut record, learning)?;
        }
        debug!(
            process = %record.name,
            mechanisms = record.pathway.len(),
            learning = record.learning.len(),
            "process assembled"
        );
        Ok(record)
    }

    /// Comparator on the terminal plus one LearningMechanism per projection,
    /// built from the output backwards so each hidden layer can read the
    /// error signal of the layer after it.
    fn add_pathway_learning(&mut self, record: &mut ProcessRecord, learning: LearningSpec) -> Result<()> {
        if record.projections.is_empty() {
            return Err(Error::spec(format!("process '{}' has nothing to learn", record.name)));
        }
        if learning.rule == LearningRule::DeltaRule && record.projections.len() > 1 {
            return Err(Error::spec("the delta rule cannot train hidden projections"));
        }
        let terminal = *record
            .pathway
            .last()
            .ok_or_else(|| Error::spec("learning needs a terminal mechanism"))?;
        let sample = self.primary_output(terminal)?;
        let target_template = self.states[sample.index()].value.zeros_like();
        let comparator_name = format!("{} Comparator", self.mechanisms[terminal.index()].name);
        let comparator = self.add_mechanism(
            MechanismSpec::objective()
                .named(&comparator_name)
                .with_input_states(vec![
                    SpecDict::new()
                        .with(NAME, SAMPLE)
                        .with(WEIGHT, -1.0)
                        .with(PROJECTIONS, vec![ProjectionRef::Source(sample)])
                        .into(),
                    SpecDict::new()
                        .with(NAME, TARGET)
                        .with(VARIABLE, target_template)
                        .into(),
                ])
                .with_output_states([OutputStateSpec::new(OUTCOME), OutputStateSpec::new(MSE)]),
        )?;
        record.comparator = Some(comparator);

        let mut error = ErrorInput::Outcome(self.primary_output(comparator)?);
        for &p in record.projections.iter().rev() {
            if self.projection(p)?.kind != ProjectionKind::Mapping {
                return Err(Error::spec(format!("'{}' cannot learn", self.projection(p)?.name)));
            }
            self.make_learnable(p)?;
            let name = format!("LearningMechanism for {}", self.projection(p)?.name);
            let lm = self.add_learning_mechanism(
                &name,
                p,
                error,
                LearningFunction::new(learning.rule),
                learning.learning_rate,
            )?;
            self.add_projection(ProjectionSpec::learning().to(Endpoint::ProjectionParameter(p, MATRIX.to_string())))?;
            self.take_over_as_default_learner(lm)?;
            record.learning.push(lm);
            error = ErrorInput::Downstream {
                error_signal: self.output_state(lm, ERROR_SIGNAL)?,
                projection: p,
            };
        }
        Ok(())
    }

    /// Dependency graph over `members`; edges are pathway projections between
    /// distinct members. AutoAssociative projections are recurrent by nature
    /// and never order anything.
    fn dependency_graph(&self, members: &[MechanismId]) -> DiGraph<MechanismId, ProjectionId> {
        let mut graph = DiGraph::new();
        let nodes: HashMap<MechanismId, NodeIndex> = members.iter().map(|m| (*m, graph.add_node(*m))).collect();
        for m in members {
            for s in &self.mechanisms[m.index()].output_states {
                for pid in &self.states[s.index()].efferents {
                    let Some(p) = self.ready(*pid) else { continue };
                    if p.kind != ProjectionKind::Mapping {
                        continue;
                    }
                    let Some(r) = self.states[p.receiver.index()].owner_mechanism() else { continue };
                    if r == *m {
                        continue;
                    }
                    if let Some(&to) = nodes.get(&r) {
                        graph.add_edge(nodes[m], to, *pid);
                    }
                }
            }
        }
        graph
    }

    fn adaptive_members(&self) -> (Vec<MechanismId>, Option<MechanismId>, Option<MechanismId>) {
        let mut members = Vec::new();
        let (mut first_control, mut first_gating) = (None, None);
        for (i, m) in self.mechanisms.iter().enumerate() {
            let id = self.mechanism_id(i);
            let role = match &m.kind {
                MechanismKind::Adaptive(AdaptiveKind::Control(r)) => {
                    first_control.get_or_insert(id);
                    r
                }
                MechanismKind::Adaptive(AdaptiveKind::Gating(r)) => {
                    first_gating.get_or_insert(id);
                    r
                }
                _ => continue,
            };
            if let Some(o) = role.objective {
                members.push(o);
            }
            members.push(id);
        }
        (members, first_control, first_gating)
    }
}

#[derive(Debug)]
pub struct System {
    name: String,
    model: Model,
    processes: Vec<ProcessRecord>,
    roles: HashMap<MechanismId, Vec<Role>>,
    processing: Vec<MechanismId>,
    graph: DiGraph<MechanismId, ProjectionId>,
    learning_graph: DiGraph<MechanismId, ProjectionId>,
    control_graph: DiGraph<MechanismId, ProjectionId>,
    processing_scheduler: Scheduler,
    learning_scheduler: Scheduler,
    control_scheduler: Scheduler,
    controller: Option<MechanismId>,
    origins: Vec<MechanismId>,
    terminals: Vec<MechanismId>,
    initialize_cycle: Vec<MechanismId>,
    /// `(terminal, comparator)` pairs.
    comparators: Vec<(MechanismId, MechanismId)>,
    initial_values: HashMap<MechanismId, Value>,
    learning_enabled: bool,
    execution: ExecutionId,
}

impl System {
    pub fn new(mut model: Model, processes: Vec<ProcessSpec>, config: SystemConfig) -> Result<Self> {
        if config.verbose {
            model.set_verbose(true);
        }
        if let Some(seed) = config.seed {
            model.prng = Prng::new(seed);
        }

        let mut records = Vec::with_capacity(processes.len());
        for spec in &processes {
            records.push(model.assemble_process(spec)?);
        }

        let mut processing = Vec::new();
        let mut seen = HashSet::new();
        for m in records.iter().flat_map(|r| r.pathway.iter()) {
            if seen.insert(*m) {
                processing.push(*m);
            }
        }

        let (control_members, first_control, first_gating) = model.adaptive_members();
        let controller = match config.controller {
            Some(c) => {
                if !matches!(model.mechanism(c)?.kind, MechanismKind::Adaptive(AdaptiveKind::Control(_))) {
                    return Err(Error::spec(format!("'{}' is not a control mechanism", model.mechanisms[c.index()].name)));
                }
                Some(c)
            }
            None => first_control,
        };
        model.resolve_deferred()?;
        if let Some(c) = controller {
            model.take_over_as_default_controller(c)?;
        }
        if let Some(g) = first_gating {
            model.take_over_as_default_gater(g)?;
        }
        model.resolve_deferred()?;
        let leftover = model.deferred_projections();
        if !leftover.is_empty() {
            match config.unresolved {
                UnresolvedPolicy::Warn => {
                    for p in &leftover {
                        warn!(projection = %p, system = %config.name, "projection still deferred after assembly; it will not execute");
                    }
                }
                UnresolvedPolicy::Error => {
                    return Err(Error::deferred(format!(
                        "{} projection(s) still deferred after assembling '{}'",
                        leftover.len(),
                        config.name
                    )))
                }
            }
        }

        let comparators: Vec<(MechanismId, MechanismId)> = records
            .iter()
            .filter_map(|r| Some((*r.pathway.last()?, r.comparator?)))
            .collect();
        let mut learning_members: Vec<MechanismId> = comparators.iter().map(|(_, c)| *c).collect();
        learning_members.extend(records.iter().flat_map(|r| r.learning.iter().copied()));

        let all: HashSet<MechanismId> = processing
            .iter()
            .chain(&learning_members)
            .chain(&control_members)
            .copied()
            .collect();
        check_membership(&model, &all)?;

        let graph = model.dependency_graph(&processing);
        let (scheduling_graph, initialize_cycle) = break_cycles(&graph, &processing, &config.initial_values);
        let learning_graph = model.dependency_graph(&learning_members);
        let control_graph = model.dependency_graph(&control_members);

        let origins: Vec<MechanismId> = scheduling_graph
            .node_indices()
            .filter(|n| scheduling_graph.neighbors_directed(*n, Direction::Incoming).next().is_none())
            .map(|n| scheduling_graph[n])
            .collect();
        let terminals: Vec<MechanismId> = scheduling_graph
            .node_indices()
            .filter(|n| scheduling_graph.neighbors_directed(*n, Direction::Outgoing).next().is_none())
            .map(|n| scheduling_graph[n])
            .collect();

        let mut roles: HashMap<MechanismId, Vec<Role>> = HashMap::new();
        for m in &processing {
            let r = roles.entry(*m).or_default();
            let origin = origins.contains(m);
            let terminal = terminals.contains(m);
            if origin {
                r.push(Role::Origin);
            }
            if terminal {
                r.push(Role::Terminal);
            }
            if !origin && !terminal {
                r.push(Role::Internal);
            }
            if initialize_cycle.contains(m) {
                r.push(Role::InitializeCycle);
            }
        }
        for (_, c) in &comparators {
            roles.entry(*c).or_default().push(Role::Target);
        }
        for r in &records {
            for lm in &r.learning {
                roles.entry(*lm).or_default().push(Role::Learning);
            }
        }
        for m in &control_members {
            let role = match &model.mechanisms[m.index()].kind {
                MechanismKind::Adaptive(AdaptiveKind::Control(_)) => Role::Control,
                MechanismKind::Adaptive(AdaptiveKind::Gating(_)) => Role::Gating,
                _ => Role::Monitoring,
            };
            roles.entry(*m).or_default().push(role);
        }
        for r in roles.values_mut() {
            r.sort();
            r.dedup();
        }

        let processing_scheduler = Scheduler::from_graph(&scheduling_graph)?.with_max_passes(config.max_passes);
        let learning_scheduler = Scheduler::from_graph(&learning_graph)?.with_max_passes(config.max_passes);
        let control_scheduler = Scheduler::from_graph(&control_graph)?.with_max_passes(config.max_passes);

        let execution = model.new_execution_id();
        info!(
            system = %config.name,
            processing = processing.len(),
            learning = learning_members.len(),
            control = control_members.len(),
            origins = origins.len(),
            terminals = terminals.len(),
            "system assembled"
        );

        Ok(Self {
            name: config.name,
            model,
            processes: records,
            roles,
            processing,
            graph,
            learning_graph,
            control_graph,
            processing_scheduler,
            learning_scheduler,
            control_scheduler,
            controller,
            origins,
            terminals,
            initialize_cycle,
            comparators,
            initial_values: config.initial_values,
            learning_enabled: config.learning,
            execution,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn processes(&self) -> &[ProcessRecord] {
        &self.processes
    }

    /// Processing mechanisms in order of first appearance.
    pub fn mechanisms(&self) -> &[MechanismId] {
        &self.processing
    }

    pub fn roles(&self, m: MechanismId) -> &[Role] {
        self.roles.get(&m).map(|r| r.as_slice()).unwrap_or(&[])
    }

    pub fn has_role(&self, m: MechanismId, role: Role) -> bool {
        self.roles(m).contains(&role)
    }

    pub fn members(&self) -> Vec<MechanismId> {
        let mut all: Vec<MechanismId> = self.roles.keys().copied().collect();
        all.sort();
        all
    }

    pub fn origins(&self) -> &[MechanismId] {
        &self.origins
    }

    pub fn terminals(&self) -> &[MechanismId] {
        &self.terminals
    }

    pub fn initialize_cycle(&self) -> &[MechanismId] {
        &self.initialize_cycle
    }

    pub fn controller(&self) -> Option<MechanismId> {
        self.controller
    }

    pub fn comparator_for(&self, terminal: MechanismId) -> Option<MechanismId> {
        self.comparators.iter().find(|(t, _)| *t == terminal).map(|(_, c)| *c)
    }

    /// Processing dependencies, cycles included.
    pub fn graph(&self) -> &DiGraph<MechanismId, ProjectionId> {
        &self.graph
    }

    pub fn learning_graph(&self) -> &DiGraph<MechanismId, ProjectionId> {
        &self.learning_graph
    }

    pub fn control_graph(&self) -> &DiGraph<MechanismId, ProjectionId> {
        &self.control_graph
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.processing_scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.processing_scheduler
    }

    pub fn learning_scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.learning_scheduler
    }

    pub fn control_scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.control_scheduler
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution
    }

    /// Start a fresh execution context: nothing counts as having executed,
    /// so modulation from earlier runs is not applied until senders run again.
    pub fn reset_execution_context(&mut self) {
        self.execution = self.model.new_execution_id();
        debug!(system = %self.name, execution = self.execution.0, "execution context reset");
    }

    pub fn set_learning_enabled(&mut self, enabled: bool) {
        self.learning_enabled = enabled;
    }

    pub fn set_projection_enabled(&mut self, p: ProjectionId, enabled: bool) -> Result<()> {
        self.model.set_projection_enabled(p, enabled)
    }

    fn stimulus_plan(&self, inputs: &Inputs, targets: Option<&Inputs>) -> Result<(u64, Vec<(MechanismId, MechanismId)>)> {
        for (m, stimuli) in inputs {
            if !self.origins.contains(m) {
                return Err(Error::spec(format!("{m} is not an ORIGIN mechanism of '{}'", self.name)));
            }
            if stimuli.is_empty() {
                return Err(Error::spec(format!("no stimuli given for {m}")));
            }
            let expected = self.model.states[self.model.primary_input(*m)?.index()].variable.clone();
            if let Some(bad) = stimuli.iter().find(|s| !s.shape_compatible(&expected)) {
                return Err(Error::spec(format!("stimulus {} for {m} does not match {}", bad.dims(), expected.dims())));
            }
        }
        if let Some(missing) = self.origins.iter().find(|m| !inputs.contains_key(*m)) {
            return Err(Error::spec(format!(
                "no input for ORIGIN '{}'",
                self.model.mechanisms[missing.index()].name
            )));
        }

        let mut target_keys = Vec::new();
        if self.learning_enabled {
            for (terminal, comparator) in &self.comparators {
                let key = match targets {
                    Some(t) if t.contains_key(comparator) => *comparator,
                    Some(t) if t.contains_key(terminal) => *terminal,
                    _ => {
                        return Err(Error::spec(format!(
                            "learning needs targets for '{}'",
                            self.model.mechanisms[terminal.index()].name
                        )))
                    }
                };
                if targets.and_then(|t| t.get(&key)).is_some_and(|v| v.is_empty()) {
                    return Err(Error::spec(format!("no targets given for {key}")));
                }
                target_keys.push((key, *comparator));
            }
        }

        let longest = inputs
            .values()
            .map(Vec::len)
            .chain(target_keys.iter().filter_map(|(k, _)| targets.and_then(|t| t.get(k)).map(Vec::len)))
            .max()
            .unwrap_or(1);
        Ok((longest as u64, target_keys))
    }

    fn seed_cycles(&mut self) -> Result<()> {
        for m in self.initialize_cycle.clone() {
            let mut value = self.model.mechanisms[m.index()].value.clone();
            if let Some(v) = self.initial_values.get(&m) {
                match value.first_mut() {
                    Some(first) => *first = v.clone(),
                    None => value.push(v.clone()),
                }
            }
            self.model.seed_value(m, value, self.execution)?;
        }
        Ok(())
    }

    /// Run trials: processing, then learning, then control and gating.
    pub fn run(&mut self, inputs: &Inputs, mut options: RunOptions<'_>) -> Result<Vec<TrialOutput>> {
        let (longest, target_keys) = self.stimulus_plan(inputs, options.targets)?;
        let num_trials = options.num_trials.unwrap_or(longest);
        let termination_processing = options.termination_processing.take().unwrap_or(Condition::AllHaveRun);
        let termination_learning = options.termination_learning.take().unwrap_or(Condition::AllHaveRun);
        self.processing_scheduler.check_termination(&termination_processing)?;
        self.learning_scheduler.check_termination(&termination_learning)?;
        let learning = self.learning_enabled && self.learning_scheduler.members().next().is_some();
        let control = self.control_scheduler.members().next().is_some();

        self.seed_cycles()?;
        let runtime = std::mem::take(&mut options.runtime_params);
        let mut results = Vec::with_capacity(num_trials as usize);

        for trial in 0..num_trials {
            if let Some(f) = options.call_before_trial.as_mut() {
                f(trial);
            }
            debug!(system = %self.name, trial, "trial start");
            let pick = |list: &Vec<Value>| list[(trial as usize) % list.len()].clone();

            let externals: HashMap<MechanismId, Vec<Option<Value>>> =
                inputs.iter().map(|(m, list)| (*m, vec![Some(pick(list))])).collect();
            let trace = {
                let mut host = ModelHost {
                    model: &mut self.model,
                    ctx: ExecContext::new(self.execution, Some(&runtime)),
                    externals: &externals,
                };
                self.processing_scheduler.run_trial(&mut host, &termination_processing)?
            };

            if learning {
                let targets = options.targets.unwrap_or(inputs);
                let externals: HashMap<MechanismId, Vec<Option<Value>>> = target_keys
                    .iter()
                    .filter_map(|(key, comparator)| {
                        targets.get(key).map(|list| (*comparator, vec![None, Some(pick(list))]))
                    })
                    .collect();
                let mut host = ModelHost {
                    model: &mut self.model,
                    ctx: ExecContext::new(self.execution, Some(&runtime)),
                    externals: &externals,
                };
                self.learning_scheduler.run_trial(&mut host, &termination_learning)?;
            }

            if control {
                let none = HashMap::new();
                let mut host = ModelHost {
                    model: &mut self.model,
                    ctx: ExecContext::new(self.execution, Some(&runtime)),
                    externals: &none,
                };
                self.control_scheduler.run_trial(&mut host, &Condition::AllHaveRun)?;
            }

            let mut outputs = Vec::with_capacity(self.terminals.len());
            for t in &self.terminals {
                outputs.push((*t, self.model.output_values(*t)?));
            }
            let output = TrialOutput { trial, outputs, trace };
            let flow = match options.call_after_trial.as_mut() {
                Some(f) => f(&output),
                None => ControlFlow::Continue(()),
            };
            results.push(output);
            if flow.is_break() {
                debug!(system = %self.name, trial, "run interrupted by caller");
                break;
            }
        }

        self.processing_scheduler.end_run();
        self.learning_scheduler.end_run();
        self.control_scheduler.end_run();
        Ok(results)
    }
}

/// A single pathway run on its own.
#[derive(Debug)]
pub struct Process {
    system: System,
}

impl Process {
    pub fn new(model: Model, spec: ProcessSpec) -> Result<Self> {
        let config = SystemConfig::new(&spec.name);
        Self::with_config(model, spec, config)
    }

    pub fn with_config(model: Model, spec: ProcessSpec, config: SystemConfig) -> Result<Self> {
        Ok(Self {
            system: System::new(model, vec![spec], config)?,
        })
    }

    pub fn pathway(&self) -> &[MechanismId] {
        self.system.processes[0].pathway()
    }

    pub fn record(&self) -> &ProcessRecord {
        &self.system.processes[0]
    }

    pub fn model(&self) -> &Model {
        self.system.model()
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut System {
        &mut self.system
    }

    pub fn run(&mut self, inputs: &Inputs, options: RunOptions<'_>) -> Result<Vec<TrialOutput>> {
        self.system.run(inputs, options)
    }
}

/// Every projection touching a member must stay inside the composition.
fn check_membership(model: &Model, members: &HashSet<MechanismId>) -> Result<()> {
    for pid in model.projections() {
        let Some(p) = model.ready(pid) else { continue };
        let sender = model.owning_mechanism(p.sender)?;
        let receiver = model.owning_mechanism(p.receiver)?;
        if let (Some(s), Some(r)) = (sender, receiver) {
            if members.contains(&s) != members.contains(&r) {
                return Err(Error::connection(format!(
                    "'{}' connects '{}' and '{}', which are not in the same composition",
                    p.name,
                    model.mechanisms[s.index()].name,
                    model.mechanisms[r.index()].name
                )));
            }
        }
    }
    Ok(())
}

/// Remove, for every strongly connected component, the in-component edges
/// leaving one designated node. Returns the acyclic graph and the
/// designated (INITIALIZE_CYCLE) nodes.
fn break_cycles(
    graph: &DiGraph<MechanismId, ProjectionId>,
    order: &[MechanismId],
    preferred: &HashMap<MechanismId, Value>,
) -> (DiGraph<MechanismId, ProjectionId>, Vec<MechanismId>) {
    let mut g = graph.clone();
    let mut chosen = Vec::new();
    let position = |m: MechanismId| order.iter().position(|x| *x == m).unwrap_or(usize::MAX);
    while toposort(&g, None).is_err() {
        let mut cut: HashSet<(NodeIndex, NodeIndex)> = HashSet::new();
        for scc in tarjan_scc(&g) {
            if scc.len() < 2 {
                continue;
            }
            let pick = scc
                .iter()
                .copied()
                .find(|n| preferred.contains_key(&g[*n]))
                .or_else(|| scc.iter().copied().max_by_key(|n| position(g[*n])));
            let Some(pick) = pick else { continue };
            for e in g.edges_directed(pick, Direction::Outgoing) {
                if scc.contains(&e.target()) {
                    cut.insert((pick, e.target()));
                }
            }
            if !chosen.contains(&g[pick]) {
                chosen.push(g[pick]);
            }
        }
        if cut.is_empty() {
            break;
        }
        g.retain_edges(|frozen, e| match frozen.edge_endpoints(e) {
            Some(ends) => !cut.contains(&ends),
            None => true,
        });
    }
    (g, chosen)
}
