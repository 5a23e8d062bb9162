//! Criterion benchmarks for running neuromech systems.
//!
//! Run with:
//!   cargo bench
//!
//! Results are saved to target/criterion/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use neuromech::prelude::*;

fn make_chain(length: usize, width: usize) -> (System, MechanismId) {
    let mut model = Model::with_seed("bench", 42);
    let ids: Vec<MechanismId> = (0..length)
        .map(|i| {
            model
                .add_mechanism(MechanismSpec::transfer().named(&format!("M{i}")).with_size(width))
                .unwrap()
        })
        .collect();
    let origin = ids[0];
    let system = System::new(model, vec![ProcessSpec::new("chain", ids)], SystemConfig::new("chain")).unwrap();
    (system, origin)
}

/// One trial through chains of growing length.
fn bench_chain_length(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_length");

    for length in [2usize, 4, 8, 16, 32].iter() {
        group.throughput(Throughput::Elements(*length as u64));

        group.bench_with_input(BenchmarkId::new("trial", length), length, |b, &length| {
            let (mut system, origin) = make_chain(length, 8);
            let stim = inputs([(origin, vec![Value::vector(vec![1.0; 8])])]);
            b.iter(|| {
                let out = system.run(&stim, RunOptions::new()).unwrap();
                black_box(out.len())
            });
        });
    }

    group.finish();
}

/// One trial through a fixed chain with growing layer width.
fn bench_layer_width(c: &mut Criterion) {
    let mut group = c.benchmark_group("layer_width");

    for width in [4usize, 16, 64, 256].iter() {
        group.throughput(Throughput::Elements((*width * *width) as u64));

        group.bench_with_input(BenchmarkId::new("trial", width), width, |b, &width| {
            let (mut system, origin) = make_chain(4, width);
            let stim = inputs([(origin, vec![Value::vector(vec![0.5; width])])]);
            b.iter(|| {
                let out = system.run(&stim, RunOptions::new()).unwrap();
                black_box(out.len())
            });
        });
    }

    group.finish();
}

/// Processing plus backpropagation for a three-layer network.
fn bench_learning_trial(c: &mut Criterion) {
    let mut group = c.benchmark_group("learning");

    for hidden in [4usize, 16, 64].iter() {
        group.bench_with_input(BenchmarkId::new("backprop", hidden), hidden, |b, &hidden| {
            let mut model = Model::with_seed("bench", 7);
            let input = model.add_mechanism(MechanismSpec::transfer().named("In").with_size(4)).unwrap();
            let mid = model
                .add_mechanism(
                    MechanismSpec::transfer()
                        .named("Hidden")
                        .with_size(hidden)
                        .with_function(Function::logistic(1.0, 0.0)),
                )
                .unwrap();
            let out = model.add_mechanism(MechanismSpec::transfer().named("Out").with_size(2)).unwrap();
            let random = || MatrixSpec::Random { low: -0.1, high: 0.1 };
            let process = ProcessSpec::new(
                "net",
                vec![PathwayItem::from(input), random().into(), mid.into(), random().into(), out.into()],
            )
            .with_learning(LearningSpec::new(LearningRule::BackPropagation).with_learning_rate(0.1));
            let mut system = System::new(model, vec![process], SystemConfig::new("net")).unwrap();

            let stim = inputs([(input, vec![Value::vector([1.0, 0.0, 1.0, 0.0])])]);
            let targets = inputs([(out, vec![Value::vector([1.0, 0.0])])]);
            b.iter(|| {
                let trials = system.run(&stim, RunOptions::new().with_targets(&targets)).unwrap();
                black_box(trials.len())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_chain_length, bench_layer_width, bench_learning_trial);
criterion_main!(benches);
