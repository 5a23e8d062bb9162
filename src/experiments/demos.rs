use neuromech::function::SLOPE;
use neuromech::observer::{GraphOptions, SystemAdapter};
use neuromech::prelude::*;

fn sized(model: &mut Model, name: &str, size: usize) -> Result<MechanismId> {
    model.add_mechanism(MechanismSpec::transfer().named(name).with_size(size))
}

fn report(system: &System, outputs: &[TrialOutput]) -> Result<()> {
    for out in outputs {
        let line = serde_json::to_string(&out.outputs).map_err(|e| Error::Execution(e.to_string()))?;
        println!("trial {:>3}  sets {:>2}  {}", out.trial, out.trace.len(), line);
    }
    let snapshot = SystemAdapter::new(system).snapshot();
    for m in &snapshot.mechanisms {
        let roles: Vec<&str> = m.roles.iter().map(|r| r.label()).collect();
        println!("  {:<40} {:<24} runs={}", m.name, roles.join("|"), m.execution_count);
    }
    Ok(())
}

/// A -> B -> C with identity matrices.
pub fn chain() -> Result<()> {
    let mut model = Model::new("chain");
    let a = sized(&mut model, "A", 3)?;
    let b = sized(&mut model, "B", 3)?;
    let c = sized(&mut model, "C", 3)?;
    let mut system = System::new(model, vec![ProcessSpec::new("chain", [a, b, c])], SystemConfig::new("chain"))?;
    let out = system.run(&inputs([(a, vec![Value::vector([1.0, 2.0, 3.0])])]), RunOptions::new())?;
    report(&system, &out)
}

/// A controller doubles B's slope from the second trial on.
pub fn control() -> Result<()> {
    let mut model = Model::new("control");
    let a = sized(&mut model, "A", 3)?;
    let b = model.add_mechanism(
        MechanismSpec::transfer()
            .named("B")
            .with_size(3)
            .with_param(SLOPE, ModulatoryKeyword::Control),
    )?;
    let c = sized(&mut model, "C", 3)?;
    model.add_control_mechanism(
        ControlMechanismSpec::new()
            .named("Controller")
            .with_default_allocation(Value::vector([2.0])),
    )?;
    let mut system = System::new(model, vec![ProcessSpec::new("chain", [a, b, c])], SystemConfig::new("control"))?;
    let out = system.run(&inputs([(a, vec![Value::vector([1.0, 2.0, 3.0])])]), RunOptions::new().trials(3))?;
    report(&system, &out)
}

/// Additive gating on B's primary input.
pub fn gating() -> Result<()> {
    let mut model = Model::new("gating");
    let a = sized(&mut model, "A", 3)?;
    let b = sized(&mut model, "B", 3)?;
    let c = sized(&mut model, "C", 3)?;
    model.add_gating_mechanism(
        GatingMechanismSpec::new()
            .named("Gate")
            .with_default_allocation(Value::vector([0.5, 0.5, 0.5]))
            .with_signal(
                GatingSignalSpec::new()
                    .targeting(Endpoint::Mechanism(b))
                    .with_modulation(Modulation::Additive),
            ),
    )?;
    let mut system = System::new(model, vec![ProcessSpec::new("chain", [a, b, c])], SystemConfig::new("gating"))?;
    let out = system.run(&inputs([(a, vec![Value::vector([1.0, 2.0, 3.0])])]), RunOptions::new().trials(3))?;
    report(&system, &out)
}

/// Three-layer backpropagation on two patterns.
pub fn learning(trials: u64) -> Result<()> {
    let mut model = Model::with_seed("learning", 3);
    let input = sized(&mut model, "Input", 2)?;
    let hidden = model.add_mechanism(
        MechanismSpec::transfer()
            .named("Hidden")
            .with_size(3)
            .with_function(Function::logistic(1.0, 0.0)),
    )?;
    let output = model.add_mechanism(
        MechanismSpec::transfer()
            .named("Output")
            .with_size(1)
            .with_function(Function::logistic(1.0, 0.0)),
    )?;
    let random = || MatrixSpec::Random { low: -0.5, high: 0.5 };
    let process = ProcessSpec::new(
        "net",
        vec![
            PathwayItem::from(input),
            random().into(),
            hidden.into(),
            random().into(),
            output.into(),
        ],
    )
    .with_learning(LearningSpec::new(LearningRule::BackPropagation).with_learning_rate(0.5));
    let mut system = System::new(model, vec![process], SystemConfig::new("learning"))?;

    let stim = inputs([(input, vec![Value::vector([0.0, 1.0]), Value::vector([1.0, 0.0])])]);
    let targets = inputs([(output, vec![Value::vector([1.0]), Value::vector([0.0])])]);
    let mut last_error = 0.0;
    let mut track = |o: &TrialOutput| {
        if let Some(v) = o.of(output) {
            let target = if o.trial % 2 == 0 { 1.0 } else { 0.0 };
            last_error = (target - v[0].as_slice()[0]).abs();
        }
        std::ops::ControlFlow::Continue(())
    };
    let out = system.run(
        &stim,
        RunOptions::new().trials(trials).with_targets(&targets).after_trial(&mut track),
    )?;
    if let Some(tail) = out.len().checked_sub(2) {
        report(&system, &out[tail..])?;
    }
    println!("absolute error on the last trial: {last_error:.4}");
    Ok(())
}

/// Scheduling conditions: the last mechanism waits for an integrator.
pub fn scheduling() -> Result<()> {
    let mut model = Model::new("scheduling");
    let m1 = sized(&mut model, "M1", 1)?;
    let m2 = model.add_mechanism(
        MechanismSpec::transfer()
            .named("M2")
            .with_function(Function::adaptive_integrator(0.5))
            .with_convergence_threshold(0.05),
    )?;
    let m3 = sized(&mut model, "M3", 1)?;
    let mut system = System::new(model, vec![ProcessSpec::new("p", [m1, m2, m3])], SystemConfig::new("scheduling"))?;
    let scheduler = system.scheduler_mut();
    scheduler.add_condition(m1, Condition::AtPass(0))?;
    scheduler.add_condition(m3, Condition::any([Condition::WhenFinished(m2), Condition::AfterNCalls(m2, 10)]))?;

    let out = system.run(
        &inputs([(m1, vec![Value::vector([1.0])])]),
        RunOptions::new().terminate_processing(Condition::AfterNCalls(m3, 1)),
    )?;
    let Some(first) = out.first() else { return Ok(()) };
    for (clock, set) in &first.trace.sets {
        let names: Vec<&str> = set
            .iter()
            .filter_map(|m| system.model().mechanism(*m).ok().map(|m| m.name()))
            .collect();
        println!("{clock}  {}", names.join(", "));
    }
    Ok(())
}

/// DOT text for a system with every adaptive layer.
pub fn graph() -> Result<()> {
    let mut model = Model::new("graph");
    let a = sized(&mut model, "A", 2)?;
    let b = model.add_mechanism(
        MechanismSpec::transfer()
            .named("B")
            .with_size(2)
            .with_param(SLOPE, ModulatoryKeyword::Control),
    )?;
    let c = sized(&mut model, "C", 1)?;
    model.add_control_mechanism(
        ControlMechanismSpec::new()
            .named("Controller")
            .monitoring(MonitorSpec::new(Endpoint::Mechanism(c))),
    )?;
    let process = ProcessSpec::new("p", [a, b, c]).with_learning(LearningSpec::new(LearningRule::BackPropagation));
    let system = System::new(model, vec![process], SystemConfig::new("graph"))?;
    print!("{}", SystemAdapter::new(&system).show_graph(GraphOptions::all()));
    Ok(())
}
