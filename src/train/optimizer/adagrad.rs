use tracing::debug;

use super::{BatchOptimizer, UpdateRule};
use crate::concat_vector::ConcatVector;
use crate::error::{Error, Result};

/// Update rule marker for AdaGrad with backtracking.
#[derive(Debug, Clone, Copy)]
pub struct BacktrackingAdaGrad;

/// AdaGrad parameters.
#[derive(Debug, Clone)]
pub struct AdaGradParams {
    learning_rate: f64,
    rollback_threshold: f64,
}

impl Default for AdaGradParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            rollback_threshold: 1e-10,
        }
    }
}

impl AdaGradParams {
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) -> Result<()> {
        if !(learning_rate > 0.0) {
            return Err(Error::invalid_input("learning_rate must be positive"));
        }
        self.learning_rate = learning_rate;
        Ok(())
    }

    pub fn rollback_threshold(&self) -> f64 {
        self.rollback_threshold
    }

    /// Squared norm of a halved rollback below which training stops
    pub fn set_rollback_threshold(&mut self, rollback_threshold: f64) -> Result<()> {
        if !(rollback_threshold > 0.0) {
            return Err(Error::invalid_input("rollback_threshold must be positive"));
        }
        self.rollback_threshold = rollback_threshold;
        Ok(())
    }
}

/// Per-run AdaGrad scratch
#[derive(Debug)]
pub struct AdaGradState {
    /// Running sum of squared gradients
    accumulator: ConcatVector,
    last_delta: ConcatVector,
    last_objective: f64,
}

impl UpdateRule for BacktrackingAdaGrad {
    type Params = AdaGradParams;
    type State = AdaGradState;

    fn new_state(_params: &AdaGradParams, weights: &ConcatVector) -> AdaGradState {
        AdaGradState {
            accumulator: weights.new_empty_clone(),
            last_delta: weights.new_empty_clone(),
            last_objective: f64::NEG_INFINITY,
        }
    }

    fn update_weights(
        params: &AdaGradParams,
        weights: &mut ConcatVector,
        gradient: &ConcatVector,
        objective: f64,
        state: &mut AdaGradState,
        quiet: bool,
    ) -> bool {
        if objective < state.last_objective {
            // Overshot: take back half of the last step and try again from there
            weights.add_vector_in_place(&state.last_delta, -0.5);
            state.last_delta.map_in_place(|d| d * 0.5);
            let rollback_norm = state.last_delta.dot_product(&state.last_delta);
            if !quiet {
                debug!(
                    objective,
                    last_objective = state.last_objective,
                    rollback_norm,
                    "objective decreased, backing off"
                );
            }
            return rollback_norm < params.rollback_threshold;
        }
        if objective == state.last_objective {
            return true;
        }

        let mut squared = gradient.deep_clone();
        squared.elementwise_product_in_place(gradient);
        state.accumulator.add_vector_in_place(&squared, 1.0);

        let mut delta = state.accumulator.deep_clone();
        delta.map_in_place(|a| if a > 0.0 { 1.0 / a.sqrt() } else { 0.0 });
        delta.elementwise_product_in_place(gradient);
        let learning_rate = params.learning_rate;
        delta.map_in_place(|d| d * learning_rate);

        weights.add_vector_in_place(&delta, 1.0);
        state.last_delta = delta;
        state.last_objective = objective;
        false
    }
}

impl BatchOptimizer<BacktrackingAdaGrad> {
    /// Create an optimizer using backtracking AdaGrad
    pub fn backtracking_adagrad() -> Self {
        Self::new()
    }

    /// Set the AdaGrad step size (builder pattern)
    pub fn with_learning_rate(mut self, learning_rate: f64) -> Result<Self> {
        self.rule_params.set_learning_rate(learning_rate)?;
        Ok(self)
    }

    /// Set the rollback convergence threshold (builder pattern)
    pub fn with_rollback_threshold(mut self, rollback_threshold: f64) -> Result<Self> {
        self.rule_params.set_rollback_threshold(rollback_threshold)?;
        Ok(self)
    }
}
