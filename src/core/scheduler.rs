//! Clock, conditions and the consideration-queue scheduler.
//!
//! The dependency graph is flattened into a *consideration queue*: layers of
//! mechanisms whose dependencies all sit in earlier layers. One pass walks
//! the queue once; every layer whose members' conditions hold becomes an
//! execution set and advances the time step.

use hashbrown::HashMap;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use petgraph::Direction;
use tracing::trace;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::MechanismId;

/// `(run, trial, pass, time_step)`, ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Clock {
    pub run: u64,
    pub trial: u64,
    pub pass: u64,
    pub time_step: u64,
}

impl std::fmt::Display for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run {} trial {} pass {} step {}", self.run, self.trial, self.pass, self.time_step)
    }
}

/// Predicate over the clock and per-trial execution counts.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Condition {
    #[default]
    Always,
    Never,
    AtPass(u64),
    /// Strictly after pass `n`.
    AfterPass(u64),
    EveryNPasses(u64),
    AtTrial(u64),
    AfterTrial(u64),
    /// `n` trials have completed in this run.
    AfterNTrials(u64),
    /// `m` has executed at least `n` times this trial.
    AfterNCalls(MechanismId, u64),
    AtNCalls(MechanismId, u64),
    BeforeNCalls(MechanismId, u64),
    /// Once per `n` executions of `m`.
    EveryNCalls(MechanismId, u64),
    /// `m` executed this trial and its function has converged.
    WhenFinished(MechanismId),
    WhenFinishedAny(Vec<MechanismId>),
    WhenFinishedAll(Vec<MechanismId>),
    /// Every scheduled mechanism executed at least once this trial.
    AllHaveRun,
    /// `m` was in the previous execution set.
    JustRan(MechanismId),
    Any(Vec<Condition>),
    All(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn any(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Condition::Any(conditions.into_iter().collect())
    }

    pub fn all(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Condition::All(conditions.into_iter().collect())
    }

    pub fn not(condition: Condition) -> Self {
        Condition::Not(Box::new(condition))
    }

    /// Mechanisms this condition refers to.
    pub fn mechanisms(&self) -> Vec<MechanismId> {
        let mut out = Vec::new();
        self.collect_mechanisms(&mut out);
        out
    }

    fn collect_mechanisms(&self, out: &mut Vec<MechanismId>) {
        match self {
            Condition::AfterNCalls(m, _)
            | Condition::AtNCalls(m, _)
            | Condition::BeforeNCalls(m, _)
            | Condition::EveryNCalls(m, _)
            | Condition::WhenFinished(m)
            | Condition::JustRan(m) => out.push(*m),
            Condition::WhenFinishedAny(ms) | Condition::WhenFinishedAll(ms) => out.extend(ms.iter().copied()),
            Condition::Any(cs) | Condition::All(cs) => {
                for c in cs {
                    c.collect_mechanisms(out);
                }
            }
            Condition::Not(c) => c.collect_mechanisms(out),
            _ => {}
        }
    }
}

/// What the scheduler drives.
pub trait ExecutionHost {
    /// Execute every member of `set` against the values published before
    /// this call.
    fn execute_set(&mut self, set: &[MechanismId]) -> Result<()>;

    fn is_finished(&self, mechanism: MechanismId) -> bool;
}

/// Execution sets of one trial, with the clock at which each ran.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrialTrace {
    pub sets: Vec<(Clock, Vec<MechanismId>)>,
}

impl TrialTrace {
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn executions_of(&self, m: MechanismId) -> usize {
        self.sets.iter().filter(|(_, s)| s.contains(&m)).count()
    }

    pub fn first_run_of(&self, m: MechanismId) -> Option<Clock> {
        self.sets.iter().find(|(_, s)| s.contains(&m)).map(|(c, _)| *c)
    }
}

pub const DEFAULT_MAX_PASSES: u64 = 1000;

static ALWAYS: Condition = Condition::Always;

#[derive(Debug, Clone)]
pub struct Scheduler {
    queue: Vec<Vec<MechanismId>>,
    conditions: HashMap<MechanismId, Condition>,
    clock: Clock,
    counts: HashMap<MechanismId, u64>,
    last_set: Vec<MechanismId>,
    max_passes: u64,
}

impl Scheduler {
    /// Layer an acyclic dependency graph. Edges point from sender to receiver.
    pub fn from_graph<E>(graph: &DiGraph<MechanismId, E>) -> Result<Self> {
        let order = toposort(graph, None).map_err(|cycle| {
            Error::execution(format!("dependency graph has a cycle through {}", graph[cycle.node_id()]))
        })?;
        let mut depth = vec![0usize; graph.node_count()];
        for &n in &order {
            let d = graph
                .neighbors_directed(n, Direction::Incoming)
                .map(|p| depth[p.index()] + 1)
                .max()
                .unwrap_or(0);
            depth[n.index()] = d;
        }
        let layers = depth.iter().copied().max().map_or(0, |d| d + 1);
        let mut queue = vec![Vec::new(); layers];
        for n in graph.node_indices() {
            queue[depth[n.index()]].push(graph[n]);
        }
        Ok(Self::from_queue(queue))
    }

    pub fn from_queue(queue: Vec<Vec<MechanismId>>) -> Self {
        Self {
            queue: queue.into_iter().filter(|l| !l.is_empty()).collect(),
            conditions: HashMap::new(),
            clock: Clock::default(),
            counts: HashMap::new(),
            last_set: Vec::new(),
            max_passes: DEFAULT_MAX_PASSES,
        }
    }

    pub fn with_max_passes(mut self, max_passes: u64) -> Self {
        self.max_passes = max_passes;
        self
    }

    pub fn set_max_passes(&mut self, max_passes: u64) {
        self.max_passes = max_passes;
    }

    pub fn consideration_queue(&self) -> &[Vec<MechanismId>] {
        &self.queue
    }

    pub fn members(&self) -> impl Iterator<Item = MechanismId> + '_ {
        self.queue.iter().flatten().copied()
    }

    pub fn contains(&self, m: MechanismId) -> bool {
        self.members().any(|x| x == m)
    }

    /// Replace the condition of `m`. Mechanisms without one run `Always`.
    pub fn add_condition(&mut self, m: MechanismId, condition: Condition) -> Result<()> {
        if !self.contains(m) {
            return Err(Error::execution(format!("{m} is not scheduled here")));
        }
        if let Some(bad) = condition.mechanisms().into_iter().find(|x| !self.contains(*x)) {
            return Err(Error::execution(format!("condition for {m} refers to {bad}, which is not scheduled here")));
        }
        self.conditions.insert(m, condition);
        Ok(())
    }

    pub fn condition(&self, m: MechanismId) -> &Condition {
        self.conditions.get(&m).unwrap_or(&ALWAYS)
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Executions of `m` in the current (or last finished) trial.
    pub fn calls(&self, m: MechanismId) -> u64 {
        self.counts.get(&m).copied().unwrap_or(0)
    }

    /// Close the current run: the next trial is trial 0 of the next run.
    pub fn end_run(&mut self) {
        self.clock.run += 1;
        self.clock.trial = 0;
        self.clock.pass = 0;
        self.clock.time_step = 0;
    }

    /// Validate a termination condition against this scheduler's members.
    pub fn check_termination(&self, termination: &Condition) -> Result<()> {
        match termination.mechanisms().into_iter().find(|x| !self.contains(*x)) {
            Some(bad) => Err(Error::execution(format!("termination condition refers to {bad}, which is not scheduled here"))),
            None => Ok(()),
        }
    }

    fn satisfied<H: ExecutionHost + ?Sized>(&self, c: &Condition, owner: Option<MechanismId>, host: &H) -> bool {
        let calls = |m: &MechanismId| self.calls(*m);
        let finished = |m: &MechanismId| calls(m) > 0 && host.is_finished(*m);
        let clock = self.clock;
        match c {
            Condition::Always => true,
            Condition::Never => false,
            Condition::AtPass(n) => clock.pass == *n,
            Condition::AfterPass(n) => clock.pass > *n,
            Condition::EveryNPasses(n) => *n > 0 && clock.pass % n == 0,
            Condition::AtTrial(n) => clock.trial == *n,
            Condition::AfterTrial(n) => clock.trial > *n,
            Condition::AfterNTrials(n) => clock.trial >= *n,
            Condition::AfterNCalls(m, n) => calls(m) >= *n,
            Condition::AtNCalls(m, n) => calls(m) == *n,
            Condition::BeforeNCalls(m, n) => calls(m) < *n,
            Condition::EveryNCalls(m, n) => {
                let n = (*n).max(1);
                match owner {
                    Some(o) if o != *m => calls(m) >= n * (calls(&o) + 1),
                    _ => calls(m) > 0 && calls(m) % n == 0,
                }
            }
            Condition::WhenFinished(m) => finished(m),
            Condition::WhenFinishedAny(ms) => ms.iter().any(|m| finished(m)),
            Condition::WhenFinishedAll(ms) => ms.iter().all(|m| finished(m)),
            Condition::AllHaveRun => self.members().all(|m| calls(&m) > 0),
            Condition::JustRan(m) => self.last_set.contains(m),
            Condition::Any(cs) => cs.iter().any(|c| self.satisfied(c, owner, host)),
            Condition::All(cs) => cs.iter().all(|c| self.satisfied(c, owner, host)),
            Condition::Not(c) => !self.satisfied(c, owner, host),
        }
    }

    /// Drive one trial to `termination`.
    pub fn run_trial<H: ExecutionHost + ?Sized>(&mut self, host: &mut H, termination: &Condition) -> Result<TrialTrace> {
        self.counts.clear();
        self.last_set.clear();
        self.clock.pass = 0;
        self.clock.time_step = 0;
        let mut trace = TrialTrace::default();

        'trial: loop {
            if self.satisfied(termination, None, &*host) {
                break;
            }
            if self.clock.pass >= self.max_passes {
                return Err(Error::execution(format!(
                    "trial {} did not terminate within {} passes",
                    self.clock.trial, self.max_passes
                )));
            }
            for layer in 0..self.queue.len() {
                let set: Vec<MechanismId> = self.queue[layer]
                    .iter()
                    .copied()
                    .filter(|m| self.satisfied(self.condition(*m), Some(*m), &*host))
                    .collect();
                if set.is_empty() {
                    continue;
                }
                trace!(clock = %self.clock, size = set.len(), "execution set");
                host.execute_set(&set)?;
                for m in &set {
                    *self.counts.entry(*m).or_insert(0) += 1;
                }
                trace.sets.push((self.clock, set.clone()));
                self.last_set = set;
                self.clock.time_step += 1;
                if self.satisfied(termination, None, &*host) {
                    break 'trial;
                }
            }
            self.clock.pass += 1;
            self.clock.time_step = 0;
        }

        self.clock.trial += 1;
        self.clock.pass = 0;
        self.clock.time_step = 0;
        Ok(trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashSet;

    fn id(i: usize) -> MechanismId {
        MechanismId::new(0, i)
    }

    /// Records sets; a mechanism is finished after `finish_after` runs.
    #[derive(Default)]
    struct Recorder {
        runs: HashMap<MechanismId, u64>,
        finish_after: HashMap<MechanismId, u64>,
    }

    impl ExecutionHost for Recorder {
        fn execute_set(&mut self, set: &[MechanismId]) -> Result<()> {
            for m in set {
                *self.runs.entry(*m).or_insert(0) += 1;
            }
            Ok(())
        }

        fn is_finished(&self, m: MechanismId) -> bool {
            let runs = self.runs.get(&m).copied().unwrap_or(0);
            runs >= self.finish_after.get(&m).copied().unwrap_or(1)
        }
    }

    fn chain(n: usize) -> DiGraph<MechanismId, ()> {
        let mut g = DiGraph::new();
        let nodes: Vec<_> = (0..n).map(|i| g.add_node(id(i))).collect();
        for w in nodes.windows(2) {
            g.add_edge(w[0], w[1], ());
        }
        g
    }

    #[test]
    fn chain_layers_in_order() {
        let s = Scheduler::from_graph(&chain(3)).unwrap();
        assert_eq!(s.consideration_queue(), &[vec![id(0)], vec![id(1)], vec![id(2)]]);
    }

    #[test]
    fn diamond_shares_a_layer() {
        let mut g = DiGraph::new();
        let a = g.add_node(id(0));
        let b = g.add_node(id(1));
        let c = g.add_node(id(2));
        let d = g.add_node(id(3));
        g.add_edge(a, b, ());
        g.add_edge(a, c, ());
        g.add_edge(b, d, ());
        g.add_edge(c, d, ());
        let s = Scheduler::from_graph(&g).unwrap();
        assert_eq!(s.consideration_queue()[1], vec![id(1), id(2)]);
    }

    #[test]
    fn cycles_are_rejected() {
        let mut g = chain(2);
        g.add_edge(petgraph::graph::NodeIndex::new(1), petgraph::graph::NodeIndex::new(0), ());
        assert!(matches!(Scheduler::from_graph(&g), Err(Error::Execution(_))));
    }

    #[test]
    fn all_have_run_ends_after_one_pass() {
        let mut s = Scheduler::from_graph(&chain(3)).unwrap();
        let mut host = Recorder::default();
        let trace = s.run_trial(&mut host, &Condition::AllHaveRun).unwrap();
        assert_eq!(trace.len(), 3);
        assert_eq!(trace.sets[2].0.time_step, 2);
        assert_eq!(s.clock().trial, 1);
    }

    #[test]
    fn any_of_finished_or_call_count() {
        let mut s = Scheduler::from_graph(&chain(3)).unwrap();
        s.add_condition(id(0), Condition::AtPass(0)).unwrap();
        s.add_condition(id(1), Condition::Always).unwrap();
        s.add_condition(
            id(2),
            Condition::any([Condition::WhenFinished(id(1)), Condition::AfterNCalls(id(1), 10)]),
        )
        .unwrap();
        let mut host = Recorder::default();
        host.finish_after.insert(id(1), 4);

        let trace = s.run_trial(&mut host, &Condition::AfterNCalls(id(2), 1)).unwrap();
        assert_eq!(trace.executions_of(id(0)), 1);
        assert_eq!(trace.executions_of(id(1)), 4);
        assert_eq!(trace.executions_of(id(2)), 1);
        let c = trace.first_run_of(id(2)).unwrap();
        assert_eq!(c.pass, 3);
    }

    #[test]
    fn every_n_calls_tracks_the_owner() {
        let mut s = Scheduler::from_graph(&chain(2)).unwrap();
        s.add_condition(id(1), Condition::EveryNCalls(id(0), 2)).unwrap();
        let mut host = Recorder::default();
        let trace = s.run_trial(&mut host, &Condition::AfterNCalls(id(1), 3)).unwrap();
        assert_eq!(trace.executions_of(id(0)), 6);
        assert_eq!(trace.executions_of(id(1)), 3);
    }

    #[test]
    fn dependencies_precede_members_in_each_pass() {
        let mut s = Scheduler::from_graph(&chain(4)).unwrap();
        let mut host = Recorder::default();
        let trace = s.run_trial(&mut host, &Condition::AfterNCalls(id(3), 2)).unwrap();
        for pass in 0..2 {
            let mut seen = HashSet::new();
            for (c, set) in trace.sets.iter().filter(|(c, _)| c.pass == pass) {
                for m in set {
                    if m.index() > 0 {
                        assert!(seen.contains(&id(m.index() - 1)), "{m} ran before its sender at {c}");
                    }
                }
                seen.extend(set.iter().copied());
            }
        }
    }

    #[test]
    fn foreign_mechanisms_are_rejected() {
        let mut s = Scheduler::from_graph(&chain(2)).unwrap();
        assert!(matches!(s.add_condition(id(7), Condition::Always), Err(Error::Execution(_))));
        assert!(s.add_condition(id(1), Condition::JustRan(id(9))).is_err());
        assert!(s.check_termination(&Condition::AfterNCalls(id(5), 1)).is_err());
    }

    #[test]
    fn runaway_trials_hit_the_pass_guard() {
        let mut s = Scheduler::from_graph(&chain(1)).unwrap().with_max_passes(5);
        let mut host = Recorder::default();
        assert!(matches!(s.run_trial(&mut host, &Condition::Never), Err(Error::Execution(_))));
    }

    #[test]
    fn trial_conditions_follow_the_clock() {
        let mut s = Scheduler::from_graph(&chain(1)).unwrap();
        s.add_condition(id(0), Condition::AfterTrial(0)).unwrap();
        let mut host = Recorder::default();
        let first = s.run_trial(&mut host, &Condition::AtPass(1)).unwrap();
        assert!(first.is_empty());
        let second = s.run_trial(&mut host, &Condition::AtPass(1)).unwrap();
        assert_eq!(second.len(), 1);
        s.end_run();
        assert_eq!(s.clock().run, 1);
        assert_eq!(s.clock().trial, 0);
    }
}
