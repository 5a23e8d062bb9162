//! End-to-end runs of small systems through the public API.

use std::ops::ControlFlow;

use hashbrown::HashSet;
use neuromech::adaptive::LEARNING_SIGNAL;
use neuromech::function::SLOPE;
use neuromech::prelude::*;
use neuromech::projection::ProjectionKind;
use neuromech::state_spec::{MECHANISM, OUTPUT_STATES, WEIGHT};

fn sized(model: &mut Model, name: &str, size: usize) -> MechanismId {
    model.add_mechanism(MechanismSpec::transfer().named(name).with_size(size)).unwrap()
}

fn row(xs: &[f64]) -> Value {
    Value::vector(xs.to_vec())
}

#[test]
fn identity_chain() {
    let mut model = Model::new("s1");
    let a = sized(&mut model, "A", 3);
    let b = sized(&mut model, "B", 3);
    let c = sized(&mut model, "C", 3);
    let mut system = System::new(
        model,
        vec![ProcessSpec::new(
            "p",
            vec![
                PathwayItem::from(a),
                MatrixSpec::Identity.into(),
                b.into(),
                MatrixSpec::Identity.into(),
                c.into(),
            ],
        )],
        SystemConfig::new("S1"),
    )
    .unwrap();

    let out = system.run(&inputs([(a, vec![row(&[1.0, 2.0, 3.0])])]), RunOptions::new()).unwrap();
    assert_eq!(out[0].of(c).unwrap()[0].as_slice(), &[1.0, 2.0, 3.0]);
    assert_eq!(system.model().mechanism(c).unwrap().value()[0].as_slice(), &[1.0, 2.0, 3.0]);
}

#[test]
fn control_applies_on_the_following_trial() {
    let mut model = Model::new("s2");
    let a = sized(&mut model, "A", 3);
    let b = model
        .add_mechanism(MechanismSpec::transfer().named("B").with_size(3).with_param(SLOPE, 1.0))
        .unwrap();
    let c = sized(&mut model, "C", 3);
    let ctl = model
        .add_control_mechanism(
            ControlMechanismSpec::new()
                .named("Ctl")
                .with_default_allocation(row(&[2.0]))
                .with_signal(ControlSignalSpec::for_param(b, SLOPE)),
        )
        .unwrap();
    let mut system = System::new(model, vec![ProcessSpec::new("p", [a, b, c])], SystemConfig::new("S2")).unwrap();
    assert_eq!(system.controller(), Some(ctl));

    let out = system
        .run(&inputs([(a, vec![row(&[1.0, 2.0, 3.0])])]), RunOptions::new().trials(2))
        .unwrap();
    assert_eq!(out[0].of(c).unwrap()[0].as_slice(), &[1.0, 2.0, 3.0]);
    assert_eq!(out[1].of(c).unwrap()[0].as_slice(), &[2.0, 4.0, 6.0]);
    assert_eq!(system.model().current_value(b, SLOPE).unwrap().as_slice(), &[2.0]);
}

#[test]
fn gating_adds_to_the_primary_input() {
    let mut model = Model::new("s3");
    let a = sized(&mut model, "A", 3);
    let b = sized(&mut model, "B", 3);
    let c = sized(&mut model, "C", 3);
    let gate_target = model.primary_input(b).unwrap();
    model
        .add_gating_mechanism(
            GatingMechanismSpec::new()
                .named("Gate")
                .with_default_allocation(row(&[0.5, 0.5, 0.5]))
                .with_signal(
                    GatingSignalSpec::new()
                        .targeting(Endpoint::State(gate_target))
                        .with_modulation(Modulation::Additive),
                ),
        )
        .unwrap();
    let mut system = System::new(model, vec![ProcessSpec::new("p", [a, b, c])], SystemConfig::new("S3")).unwrap();

    let out = system
        .run(&inputs([(a, vec![row(&[1.0, 2.0, 3.0])])]), RunOptions::new().trials(3))
        .unwrap();
    assert_eq!(out[0].of(c).unwrap()[0].as_slice(), &[1.0, 2.0, 3.0]);
    assert_eq!(out[1].of(c).unwrap()[0].as_slice(), &[1.5, 2.5, 3.5]);
    assert_eq!(out[2].of(c).unwrap()[0].as_slice(), &[1.5, 2.5, 3.5]);
}

fn two_layer(rule: LearningRule, rate: f64) -> (System, MechanismId, MechanismId, ProjectionId) {
    let mut model = Model::new("s4");
    let a = sized(&mut model, "A", 2);
    let b = sized(&mut model, "B", 1);
    let matrix = Value::from_rows(&[vec![0.1], vec![0.1]]).unwrap();
    let process = ProcessSpec::new("p", vec![PathwayItem::from(a), MatrixSpec::Explicit(matrix).into(), b.into()])
        .with_learning(LearningSpec::new(rule).with_learning_rate(rate));
    let system = System::new(model, vec![process], SystemConfig::new("S4")).unwrap();
    let p = system.processes()[0].projections()[0];
    (system, a, b, p)
}

#[test]
fn learning_changes_the_next_trial_matrix() {
    let (mut system, a, b, p) = two_layer(LearningRule::BackPropagation, 1.0);
    let lm = system.processes()[0].learning_mechanisms()[0];
    assert!(system.has_role(lm, Role::Learning));
    let comparator = system.comparator_for(b).unwrap();
    assert!(system.has_role(comparator, Role::Target));

    let stim = inputs([(a, vec![row(&[1.0, 1.0])])]);
    let targets = inputs([(b, vec![row(&[1.0])])]);

    let first = system.run(&stim, RunOptions::new().with_targets(&targets)).unwrap();
    assert!((first[0].of(b).unwrap()[0].as_slice()[0] - 0.2).abs() < 1e-12);
    let before = system.model().matrix(p).unwrap();
    assert!(before.max_abs_diff(&Value::from_rows(&[vec![0.1], vec![0.1]]).unwrap()) < 1e-12);
    let signal = system.model().output_state(lm, LEARNING_SIGNAL).unwrap();
    let delta = system.model().state(signal).unwrap().value().clone();

    let second = system.run(&stim, RunOptions::new().with_targets(&targets)).unwrap();
    let after = system.model().matrix(p).unwrap();
    let expected = before.add(&delta).unwrap();
    assert!(after.max_abs_diff(&expected) < 1e-12);
    assert!((after.as_slice()[0] - 0.9).abs() < 1e-12);
    assert!((second[0].of(b).unwrap()[0].as_slice()[0] - 1.8).abs() < 1e-12);
}

#[test]
fn learning_rate_scales_the_weight_change() {
    let (mut system, a, b, p) = two_layer(LearningRule::BackPropagation, 0.5);
    let lm = system.processes()[0].learning_mechanisms()[0];
    let stim = inputs([(a, vec![row(&[1.0, 1.0])])]);
    let targets = inputs([(b, vec![row(&[1.0])])]);

    system.run(&stim, RunOptions::new().with_targets(&targets)).unwrap();
    // The signal carries the unscaled change; the rate applies on the way in.
    let signal = system.model().output_state(lm, LEARNING_SIGNAL).unwrap();
    let delta = system.model().state(signal).unwrap().value().clone();
    assert!(delta.max_abs_diff(&Value::from_rows(&[vec![0.8], vec![0.8]]).unwrap()) < 1e-12);

    let second = system.run(&stim, RunOptions::new().with_targets(&targets)).unwrap();
    let after = system.model().matrix(p).unwrap();
    assert!(after.max_abs_diff(&Value::from_rows(&[vec![0.5], vec![0.5]]).unwrap()) < 1e-12);
    assert!((second[0].of(b).unwrap()[0].as_slice()[0] - 1.0).abs() < 1e-12);
}

#[test]
fn targets_may_be_keyed_by_comparator() {
    let (mut system, a, b, p) = two_layer(LearningRule::DeltaRule, 1.0);
    let comparator = system.comparator_for(b).unwrap();
    let stim = inputs([(a, vec![row(&[1.0, 1.0])])]);
    let targets = inputs([(comparator, vec![row(&[1.0])])]);
    system.run(&stim, RunOptions::new().with_targets(&targets).trials(2)).unwrap();
    assert!((system.model().matrix(p).unwrap().as_slice()[1] - 0.9).abs() < 1e-12);
}

#[test]
fn learning_without_targets_is_rejected() {
    let (mut system, a, _, _) = two_layer(LearningRule::BackPropagation, 1.0);
    let stim = inputs([(a, vec![row(&[1.0, 1.0])])]);
    assert!(matches!(system.run(&stim, RunOptions::new()), Err(Error::Specification(_))));

    system.set_learning_enabled(false);
    system.run(&stim, RunOptions::new()).unwrap();
}

#[test]
fn third_mechanism_waits_for_the_integrator() {
    let mut model = Model::new("s5");
    let m1 = sized(&mut model, "M1", 1);
    let m2 = model
        .add_mechanism(
            MechanismSpec::transfer()
                .named("M2")
                .with_function(Function::adaptive_integrator(1.0))
                .with_convergence_threshold(0.01),
        )
        .unwrap();
    let m3 = sized(&mut model, "M3", 1);
    let mut system = System::new(model, vec![ProcessSpec::new("p", [m1, m2, m3])], SystemConfig::new("S5")).unwrap();
    let scheduler = system.scheduler_mut();
    scheduler.add_condition(m1, Condition::AtPass(0)).unwrap();
    scheduler.add_condition(m2, Condition::Always).unwrap();
    scheduler
        .add_condition(m3, Condition::any([Condition::WhenFinished(m2), Condition::AfterNCalls(m2, 10)]))
        .unwrap();

    let out = system
        .run(
            &inputs([(m1, vec![row(&[1.0])])]),
            RunOptions::new().terminate_processing(Condition::AfterNCalls(m3, 1)),
        )
        .unwrap();
    let trace = &out[0].trace;
    assert_eq!(trace.executions_of(m1), 1);
    assert_eq!(trace.executions_of(m2), 2);
    assert_eq!(trace.executions_of(m3), 1);
    assert_eq!(trace.first_run_of(m3).unwrap().pass, 1);
}

#[test]
fn dict_spec_expands_into_weighted_input_states() {
    let mut model = Model::new("s6");
    let r = model
        .add_mechanism(
            MechanismSpec::transfer()
                .named("R")
                .with_size(2)
                .with_output_states([OutputStateSpec::new("FIRST"), OutputStateSpec::new("SECOND")]),
        )
        .unwrap();
    let q = model
        .add_mechanism(
            MechanismSpec::transfer().named("Q").with_input_states(vec![SpecDict::new()
                .with(MECHANISM, r)
                .with(OUTPUT_STATES, &["FIRST", "SECOND"][..])
                .with(WEIGHT, 2.0)
                .into()]),
        )
        .unwrap();

    let states = model.input_states(q).unwrap().to_vec();
    assert_eq!(states.len(), 2);
    for (sid, source) in states.iter().zip(["FIRST", "SECOND"]) {
        let state = model.state(*sid).unwrap();
        assert_eq!(state.weight(), 2.0);
        assert_eq!(state.path_afferents().len(), 1);
        let p = model.projection(state.path_afferents()[0]).unwrap();
        assert_eq!(p.kind(), ProjectionKind::Mapping);
        assert_eq!(p.sender(), model.output_state(r, source).unwrap());
    }
}

#[test]
fn projection_values_match_receiver_shapes() {
    let mut model = Model::new("p1");
    let a = sized(&mut model, "A", 3);
    let b = sized(&mut model, "B", 2);
    let c = sized(&mut model, "C", 4);
    let mut system = System::new(
        model,
        vec![ProcessSpec::new(
            "p",
            vec![
                PathwayItem::from(a),
                MatrixSpec::Full(0.5).into(),
                b.into(),
                MatrixSpec::Random { low: -1.0, high: 1.0 }.into(),
                c.into(),
            ],
        )],
        SystemConfig::new("P1").with_seed(11),
    )
    .unwrap();
    system.run(&inputs([(a, vec![row(&[1.0, 2.0, 3.0])])]), RunOptions::new()).unwrap();

    let model = system.model();
    for pid in model.projections() {
        let p = model.projection(pid).unwrap();
        if p.kind() != ProjectionKind::Mapping {
            continue;
        }
        let receiver = model.state(p.receiver()).unwrap();
        assert_eq!(p.value().dims(), receiver.variable().dims(), "{}", p.name());
    }
}

#[test]
fn control_lags_one_trial_behind_its_cue() {
    let mut model = Model::new("p3");
    let cue = model
        .add_mechanism(MechanismSpec::transfer().named("Cue").with_function(Function::linear(2.0, 0.0)))
        .unwrap();
    let a = sized(&mut model, "A", 3);
    let b = model
        .add_mechanism(
            MechanismSpec::transfer()
                .named("B")
                .with_size(3)
                .with_param(SLOPE, ModulatoryKeyword::Control),
        )
        .unwrap();
    let c = sized(&mut model, "C", 3);
    model
        .add_control_mechanism(
            ControlMechanismSpec::new()
                .named("Ctl")
                .monitoring(MonitorSpec::new(Endpoint::Mechanism(cue))),
        )
        .unwrap();
    let mut system = System::new(
        model,
        vec![ProcessSpec::new("p", [a, b, c]), ProcessSpec::new("cue", [cue])],
        SystemConfig::new("P3"),
    )
    .unwrap();
    assert!(system.model().deferred_projections().is_empty());

    let trial_index: Vec<Value> = (0..4).map(|t| row(&[t as f64])).collect();
    let stim = inputs([(a, vec![row(&[1.0, 2.0, 3.0])]), (cue, trial_index)]);
    let out = system.run(&stim, RunOptions::new()).unwrap();
    assert_eq!(out.len(), 4);
    assert_eq!(out[0].of(c).unwrap()[0].as_slice(), &[1.0, 2.0, 3.0]);
    for t in 1..4 {
        let slope = 2.0 * (t - 1) as f64;
        assert_eq!(out[t].of(c).unwrap()[0].as_slice(), &[slope, 2.0 * slope, 3.0 * slope], "trial {t}");
    }
}

#[test]
fn only_orphaned_projections_stay_deferred() {
    let mut model = Model::new("p5");
    let a = sized(&mut model, "A", 1);
    let b = sized(&mut model, "B", 1);
    let pending = model.add_projection(ProjectionSpec::mapping().named("pending")).unwrap();
    let orphan = model.add_projection(ProjectionSpec::mapping().named("orphan")).unwrap();
    let system = System::new(
        model,
        vec![ProcessSpec::new("p", vec![PathwayItem::from(a), pending.into(), b.into()])],
        SystemConfig::new("P5"),
    )
    .unwrap();
    assert!(!system.model().is_deferred(pending).unwrap());
    assert_eq!(system.model().deferred_projections(), vec![orphan]);
}

#[test]
fn sets_never_outrun_their_senders() {
    let mut model = Model::new("p6");
    let a = sized(&mut model, "A", 1);
    let b = sized(&mut model, "B", 1);
    let c = sized(&mut model, "C", 1);
    let d = sized(&mut model, "D", 1);
    let mut system = System::new(
        model,
        vec![ProcessSpec::new("left", [a, b, d]), ProcessSpec::new("right", [a, c, d])],
        SystemConfig::new("P6"),
    )
    .unwrap();
    let out = system
        .run(
            &inputs([(a, vec![row(&[1.0])])]),
            RunOptions::new().terminate_processing(Condition::AfterNCalls(d, 3)),
        )
        .unwrap();

    let graph = system.graph();
    let senders = |m: MechanismId| -> Vec<MechanismId> {
        graph
            .node_indices()
            .filter(|n| graph[*n] == m)
            .flat_map(|n| graph.neighbors_directed(n, petgraph::Direction::Incoming))
            .map(|n| graph[n])
            .collect()
    };
    let trace = &out[0].trace;
    for pass in 0..3 {
        let mut ran = HashSet::new();
        for (clock, set) in trace.sets.iter().filter(|(c, _)| c.pass == pass) {
            for m in set {
                for s in senders(*m) {
                    assert!(ran.contains(&s), "{m} ran before {s} at {clock}");
                }
            }
            ran.extend(set.iter().copied());
        }
    }
    // B and C share a layer.
    assert!(trace.sets.iter().any(|(_, set)| set.contains(&b) && set.contains(&c)));
}

#[test]
fn cycle_initializer_feeds_the_first_step() {
    let mut model = Model::new("p7");
    let a = sized(&mut model, "A", 1);
    let b = sized(&mut model, "B", 1);
    let c = sized(&mut model, "C", 1);
    let mut system = System::new(
        model,
        vec![ProcessSpec::new("p", [a, b, c]), ProcessSpec::new("loop", [c, b])],
        SystemConfig::new("P7").with_initial_value(c, row(&[5.0])),
    )
    .unwrap();
    assert!(system.has_role(c, Role::InitializeCycle));

    let mut seen = Vec::new();
    let mut after = |o: &TrialOutput| {
        seen.push(o.trial);
        ControlFlow::Continue(())
    };
    let out = system
        .run(&inputs([(a, vec![row(&[1.0])])]), RunOptions::new().trials(2).after_trial(&mut after))
        .unwrap();
    assert_eq!(seen, vec![0, 1]);
    assert_eq!(out[0].of(c).unwrap()[0].as_slice(), &[6.0]);
    // Second trial feeds back C's own output.
    assert_eq!(out[1].of(c).unwrap()[0].as_slice(), &[7.0]);
}
