//! Log-linear graphical models in pure Rust
//!
//! This library provides hybrid sparse/dense feature vectors, factor graphs
//! whose factors score assignments as `weights · features`, exact inference
//! by clique tree message passing, and multi-threaded CRF training.
//!
//! # Examples
//!
//! ## Inference
//!
//! ```no_run
//! use loglinear::{CliqueTree, ConcatVectorNamespace, GraphicalModel};
//!
//! let mut namespace = ConcatVectorNamespace::new();
//! let mut diagonal = namespace.new_vector();
//! namespace.set_sparse_feature(&mut diagonal, "pair", "same", 1.0);
//! let off_diagonal = namespace.new_vector();
//!
//! let mut model = GraphicalModel::new();
//! model.add_factor(&[0, 1], &[2, 2], move |assignment| {
//!     if assignment[0] == assignment[1] {
//!         diagonal.clone()
//!     } else {
//!         off_diagonal.clone()
//!     }
//! });
//!
//! let mut weights = namespace.new_vector();
//! namespace.set_sparse_feature(&mut weights, "pair", "same", 2.0);
//!
//! let tree = CliqueTree::new(&model, &weights);
//! let result = tree.calculate_marginals()?;
//! println!("Z = {}", result.partition_function);
//! let map = tree.calculate_map()?;
//! assert_eq!(map[&0], map[&1]);
//! # Ok::<(), loglinear::Error>(())
//! ```
//!
//! ## Training
//!
//! ```no_run
//! use loglinear::train::{BacktrackingAdaGrad, BatchOptimizer, LogLikelihood};
//! use loglinear::{ConcatVector, GraphicalModel};
//!
//! let mut model = GraphicalModel::new();
//! model.add_factor(&[0], &[3], |assignment| {
//!     let mut features = ConcatVector::new(1);
//!     features.set_sparse_component(0, assignment[0], 1.0);
//!     features
//! });
//! model.set_training_label(0, 2);
//!
//! let optimizer = BatchOptimizer::<BacktrackingAdaGrad>::backtracking_adagrad()
//!     .with_num_threads(4)?;
//! let mut dataset = vec![model];
//! let weights = optimizer.optimize(
//!     &mut dataset,
//!     &LogLikelihood,
//!     ConcatVector::new(1),
//!     0.01,
//!     1e-4,
//!     false,
//! )?;
//! # Ok::<(), loglinear::Error>(())
//! ```

mod clique_tree;
mod codec;
mod concat_vector;
mod error;
mod model;
mod namespace;
mod nd_array;
mod table;
mod table_factor;

/// Training module containing the objective and the batch optimizer
pub mod train;

// Re-export main types
pub use self::clique_tree::{CliqueTree, MarginalResult};
pub use self::concat_vector::{Component, ConcatVector};
pub use self::error::{Error, Result};
pub use self::model::{Factor, GraphicalModel, VARIABLE_OBSERVED_VALUE, VARIABLE_TRAINING_VALUE};
pub use self::namespace::ConcatVectorNamespace;
pub use self::nd_array::{AssignmentIter, FastAssignments, NDArray};
pub use self::table::{Cell, ConcatVectorTable, Generator};
