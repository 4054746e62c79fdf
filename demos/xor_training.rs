//! Train a tiny XOR-style model and decode it again.
//!
//! Per-round progress is logged at info level:
//! `cargo run --example xor_training`

use loglinear::train::{BacktrackingAdaGrad, BatchOptimizer, LogLikelihood};
use loglinear::{CliqueTree, ConcatVectorNamespace, GraphicalModel};

fn main() -> loglinear::Result<()> {
    tracing_subscriber::fmt::init();

    let mut namespace = ConcatVectorNamespace::new();
    let mut table = Vec::new();
    for a in 0..2 {
        for b in 0..2 {
            for label in 0..2 {
                let mut features = namespace.new_vector();
                let key = format!("{},{},{}", a, b, label);
                namespace.set_sparse_feature(&mut features, "xor", &key, 1.0);
                table.push(features);
            }
        }
    }

    let mut dataset = Vec::new();
    for pairs in [[(0, 0), (1, 1)], [(0, 1), (1, 0)]] {
        let mut model = GraphicalModel::new();
        for (i, (a, b)) in pairs.into_iter().enumerate() {
            let table = table.clone();
            model.add_factor(&[3 * i, 3 * i + 1, 3 * i + 2], &[2, 2, 2], move |x| {
                table[x[0] * 4 + x[1] * 2 + x[2]].clone()
            });
            model.observe(3 * i, a);
            model.observe(3 * i + 1, b);
            model.set_training_label(3 * i + 2, usize::from(a == b));
        }
        dataset.push(model);
    }

    let optimizer = BatchOptimizer::<BacktrackingAdaGrad>::backtracking_adagrad()
        .with_max_rounds(5_000)?;
    let weights = optimizer.optimize(
        &mut dataset,
        &LogLikelihood,
        namespace.new_vector(),
        0.0,
        5e-3,
        false,
    )?;
    print!("{}", namespace.debug_vector(&weights));

    for model in &dataset {
        let map = CliqueTree::new(model, &weights).calculate_map()?;
        for i in 0..2 {
            println!(
                "{} xor {} -> {}",
                map[&(3 * i)],
                map[&(3 * i + 1)],
                map[&(3 * i + 2)]
            );
        }
    }
    Ok(())
}
