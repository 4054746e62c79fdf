//! Training module for log-linear models
//!
//! This module contains the learning objective, the concurrent batch
//! optimizer with its update rules, and the load balancing and cancellation
//! machinery the optimizer runs on.

mod balance;
mod cancel;
mod objective;
mod optimizer;

// Re-export public types
pub use self::balance::TrainingCost;
pub use self::cancel::{CancellationToken, TrainingHandle};
pub use self::objective::{DifferentiableFunction, LogLikelihood};
pub use self::optimizer::{
    AdaGradParams, AdaGradState, BacktrackingAdaGrad, BatchOptimizer, Constraint, OptimizerParams,
    UpdateRule,
};
