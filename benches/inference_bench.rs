use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use loglinear::train::{DifferentiableFunction, LogLikelihood};
use loglinear::{CliqueTree, ConcatVector, ConcatVectorNamespace, GraphicalModel};

/// Linear chain of `len` variables with `labels` values each
fn chain(namespace: &mut ConcatVectorNamespace, len: usize, labels: usize) -> GraphicalModel {
    let mut model = GraphicalModel::new();
    for i in 0..len {
        let mut emissions = Vec::with_capacity(labels);
        for label in 0..labels {
            let mut features = namespace.new_vector();
            namespace.set_sparse_feature(&mut features, "emission", &format!("{}:{}", i % 7, label), 1.0);
            emissions.push(features);
        }
        model.add_factor(&[i], &[labels], move |a| emissions[a[0]].clone());
        model.set_training_label(i, i % labels);
    }
    for i in 1..len {
        let mut transitions = Vec::with_capacity(labels * labels);
        for prev in 0..labels {
            for next in 0..labels {
                let mut features = namespace.new_vector();
                namespace.set_sparse_feature(&mut features, "transition", &format!("{}-{}", prev, next), 1.0);
                transitions.push(features);
            }
        }
        model.add_factor(&[i - 1, i], &[labels, labels], move |a| {
            transitions[a[0] * labels + a[1]].clone()
        });
    }
    model
}

fn weights(namespace: &ConcatVectorNamespace) -> ConcatVector {
    let mut weights = namespace.new_vector();
    for family in 0..namespace.num_families() {
        weights.set_dense_component(family, (0..128).map(|k| ((k * 37) % 11) as f64 * 0.1 - 0.5).collect());
    }
    weights
}

fn benchmark_marginals_by_labels(c: &mut Criterion) {
    let mut group = c.benchmark_group("marginals_by_labels");
    for labels in [2, 4, 8, 12] {
        let mut namespace = ConcatVectorNamespace::new();
        let model = chain(&mut namespace, 10, labels);
        let weights = weights(&namespace);
        group.bench_with_input(BenchmarkId::from_parameter(labels), &labels, |b, _| {
            b.iter(|| {
                let result = CliqueTree::new(&model, &weights).calculate_marginals();
                black_box(result)
            });
        });
    }
    group.finish();
}

fn benchmark_map(c: &mut Criterion) {
    let mut namespace = ConcatVectorNamespace::new();
    let model = chain(&mut namespace, 20, 5);
    let weights = weights(&namespace);
    c.bench_function("map_chain_20x5", |b| {
        b.iter(|| black_box(CliqueTree::new(&model, &weights).calculate_map()))
    });
}

fn benchmark_gradient(c: &mut Criterion) {
    let mut namespace = ConcatVectorNamespace::new();
    let mut model = chain(&mut namespace, 10, 5);
    let weights = weights(&namespace);
    c.bench_function("log_likelihood_gradient_10x5", |b| {
        b.iter(|| {
            let mut gradient = weights.new_empty_clone();
            let value = LogLikelihood.get_summary_for_instance(&mut model, &weights, &mut gradient);
            black_box((value, gradient))
        })
    });
}

criterion_group!(benches, benchmark_marginals_by_labels, benchmark_map, benchmark_gradient);
criterion_main!(benches);
