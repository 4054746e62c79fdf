use std::thread;
use std::time::Duration;

use loglinear::train::{
    BacktrackingAdaGrad, BatchOptimizer, DifferentiableFunction, LogLikelihood, TrainingCost,
};
use loglinear::{CliqueTree, ConcatVector, ConcatVectorNamespace, GraphicalModel, Result};

/// One unary factor over a three-valued variable labeled 2
fn single_example() -> GraphicalModel {
    let mut model = GraphicalModel::new();
    model.add_factor(&[0], &[3], |a| {
        let mut features = ConcatVector::new(2);
        features.set_sparse_component(0, a[0], 1.0);
        features.set_sparse_component(1, 0, if a[0] == 2 { 1.0 } else { -1.0 });
        features
    });
    model.set_training_label(0, 2);
    model
}

fn squared_gradient_norm(model: &mut GraphicalModel, weights: &ConcatVector) -> f64 {
    let mut gradient = weights.new_empty_clone();
    LogLikelihood
        .get_summary_for_instance(model, weights, &mut gradient)
        .unwrap();
    gradient.dot_product(&gradient)
}

#[test]
fn test_single_example_converges() {
    let mut dataset = vec![single_example()];
    let optimizer = BatchOptimizer::<BacktrackingAdaGrad>::backtracking_adagrad()
        .with_num_threads(1)
        .unwrap()
        .with_max_rounds(10_000)
        .unwrap();
    let weights = optimizer
        .optimize(&mut dataset, &LogLikelihood, ConcatVector::new(2), 0.0, 0.1, true)
        .unwrap();

    assert!(squared_gradient_norm(&mut dataset[0], &weights) < 0.1);
    let map = CliqueTree::new(&dataset[0], &weights).calculate_map().unwrap();
    assert_eq!(map[&0], 2);
}

#[test]
fn test_constraint_stays_fixed() {
    for max_rounds in [1, 2, 5, 50] {
        let mut dataset = vec![single_example()];
        let mut optimizer = BatchOptimizer::<BacktrackingAdaGrad>::backtracking_adagrad()
            .with_max_rounds(max_rounds)
            .unwrap();
        optimizer.add_sparse_constraint(1, 0, 0.25);
        let weights = optimizer
            .optimize(&mut dataset, &LogLikelihood, ConcatVector::new(2), 0.0, 1e-6, true)
            .unwrap();
        assert!(weights.is_component_sparse(1));
        assert_eq!(weights.sparse_index(1), Some(0));
        assert_eq!(weights.value_at(1, 0), 0.25);
        // the unconstrained component still learns
        assert!(weights.value_at(0, 2) > 0.0);
    }
}

#[test]
fn test_dense_constraint() {
    let mut dataset = vec![single_example()];
    let mut optimizer = BatchOptimizer::<BacktrackingAdaGrad>::backtracking_adagrad()
        .with_max_rounds(20)
        .unwrap();
    optimizer.add_dense_constraint(0, vec![0.0, 0.0, -1.0]);
    let weights = optimizer
        .optimize(&mut dataset, &LogLikelihood, ConcatVector::new(2), 0.0, 1e-6, true)
        .unwrap();
    assert_eq!(weights.dense_component(0), Some(&[0.0, 0.0, -1.0][..]));
    assert!(weights.value_at(1, 0) > 0.0);
}

/// Two examples, each holding two (A, B, label) triples; label is 1 when A == B
fn xor_dataset() -> (Vec<GraphicalModel>, ConcatVectorNamespace) {
    let mut namespace = ConcatVectorNamespace::new();
    let mut table = Vec::new();
    for a in 0..2 {
        for b in 0..2 {
            for label in 0..2 {
                let mut features = namespace.new_vector();
                namespace.set_sparse_feature(
                    &mut features,
                    "xor",
                    &format!("{},{},{}", a, b, label),
                    1.0,
                );
                table.push(features);
            }
        }
    }

    let examples = [[(0, 0), (1, 1)], [(0, 1), (1, 0)]];
    let models = examples
        .iter()
        .map(|pairs| {
            let mut model = GraphicalModel::new();
            for (i, &(a, b)) in pairs.iter().enumerate() {
                let (va, vb, vl) = (3 * i, 3 * i + 1, 3 * i + 2);
                let table = table.clone();
                model.add_factor(&[va, vb, vl], &[2, 2, 2], move |x| {
                    table[x[0] * 4 + x[1] * 2 + x[2]].clone()
                });
                model.observe(va, a);
                model.observe(vb, b);
                model.set_training_label(vl, usize::from(a == b));
            }
            model
        })
        .collect();
    (models, namespace)
}

fn total_log_likelihood(dataset: &[GraphicalModel], weights: &ConcatVector) -> f64 {
    dataset
        .iter()
        .map(|model| LogLikelihood::log_likelihood(model, weights).unwrap())
        .sum()
}

#[test]
fn test_xor_end_to_end() {
    let (mut dataset, namespace) = xor_dataset();
    let initial = namespace.new_vector();
    let before = total_log_likelihood(&dataset, &initial);

    let optimizer = BatchOptimizer::<BacktrackingAdaGrad>::backtracking_adagrad()
        .with_num_threads(2)
        .unwrap()
        .with_max_rounds(5_000)
        .unwrap();
    let weights = optimizer
        .optimize(&mut dataset, &LogLikelihood, initial, 0.0, 5e-3, true)
        .unwrap();

    let after = total_log_likelihood(&dataset, &weights);
    assert!(after > before);
    assert!(after > -0.25, "log-likelihood {}", after);

    for model in &dataset {
        let map = CliqueTree::new(model, &weights).calculate_map().unwrap();
        for i in 0..2 {
            let (a, b, label) = (map[&(3 * i)], map[&(3 * i + 1)], map[&(3 * i + 2)]);
            assert_eq!(Some(a), model.observed_value(3 * i).unwrap());
            assert_eq!(Some(b), model.observed_value(3 * i + 1).unwrap());
            assert_eq!(label, usize::from(a == b));
            assert_eq!(Some(label), model.training_label(3 * i + 2).unwrap());
        }
    }
}

#[test]
fn test_thread_count_does_not_change_result() {
    let run = |threads: usize| {
        let (mut dataset, namespace) = xor_dataset();
        BatchOptimizer::<BacktrackingAdaGrad>::backtracking_adagrad()
            .with_num_threads(threads)
            .unwrap()
            .with_max_rounds(25)
            .unwrap()
            .optimize(&mut dataset, &LogLikelihood, namespace.new_vector(), 0.01, 0.0, true)
            .unwrap()
    };
    assert!(run(1).value_equals(&run(2), 1e-9));
}

/// Linear objective that never converges
struct Unbounded;

struct Item;

impl TrainingCost for Item {}

impl DifferentiableFunction<Item> for Unbounded {
    fn get_summary_for_instance(
        &self,
        _datum: &mut Item,
        weights: &ConcatVector,
        gradient: &mut ConcatVector,
    ) -> Result<f64> {
        thread::sleep(Duration::from_micros(200));
        let mut ones = ConcatVector::new(1);
        ones.set_dense_component(0, vec![1.0]);
        gradient.add_vector_in_place(&ones, 1.0);
        Ok(weights.dot_product(&ones))
    }
}

#[test]
fn test_background_training_can_be_cancelled() {
    let optimizer = BatchOptimizer::<BacktrackingAdaGrad>::backtracking_adagrad()
        .with_num_threads(2)
        .unwrap();
    let dataset: Vec<Item> = (0..16).map(|_| Item).collect();
    let handle = optimizer
        .optimize_in_background(dataset, Unbounded, ConcatVector::new(1), 0.0, 1e-9, true)
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    handle.cancel();
    let weights = handle.wait().unwrap();
    assert!(optimizer.cancellation_token().is_cancelled());
    assert!(weights.value_at(0, 0).is_finite());
    assert!(weights.value_at(0, 0) >= 0.0);
}
