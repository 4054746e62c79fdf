use std::collections::BTreeMap;

use tracing::debug;

use crate::clique_tree::{CliqueTree, MarginalResult};
use crate::concat_vector::ConcatVector;
use crate::error::{Error, Result};
use crate::model::GraphicalModel;

/// An objective that can be evaluated one datum at a time.
///
/// Implementations are shared by every worker thread, hence `Sync`.
pub trait DifferentiableFunction<T>: Sync {
    /// Objective value of `datum` at `weights`.
    ///
    /// The gradient is added into `gradient`, never written over it. `datum`
    /// is borrowed mutably so implementations can cache per-datum state.
    fn get_summary_for_instance(
        &self,
        datum: &mut T,
        weights: &ConcatVector,
        gradient: &mut ConcatVector,
    ) -> Result<f64>;
}

/// Conditional log-likelihood of the labeled assignment of a [`GraphicalModel`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LogLikelihood;

impl LogLikelihood {
    /// Objective value alone, without touching any gradient
    pub fn log_likelihood(model: &GraphicalModel, weights: &ConcatVector) -> Result<f64> {
        Self::summarize(model, weights, None)
    }

    fn summarize(
        model: &GraphicalModel,
        weights: &ConcatVector,
        gradient: Option<&mut ConcatVector>,
    ) -> Result<f64> {
        let result = CliqueTree::new(model, weights).calculate_marginals()?;
        if !result.partition_function.is_finite() || !result.log_partition_function.is_finite() {
            debug!(
                log_partition_function = result.log_partition_function,
                "skipping instance with degenerate partition function"
            );
            return Ok(0.0);
        }

        let gold = gold_assignment(model, &result)?;
        let mut objective = -result.log_partition_function;
        let mut observed_features = Vec::with_capacity(model.factors().len());
        for factor in model.factors() {
            let assignment: Vec<usize> = factor.neighbor_indices.iter().map(|v| gold[v]).collect();
            let features = factor.features_table.get_assignment_value(&assignment);
            objective += weights.dot_product(&features);
            observed_features.push(features);
        }

        if let Some(gradient) = gradient {
            for features in &observed_features {
                gradient.add_vector_in_place(features, 1.0);
            }
            for (i, factor) in model.factors().iter().enumerate() {
                let joint = match result.joint_marginal(i) {
                    Some(joint) => joint,
                    None => continue,
                };
                let table = &factor.features_table;
                for (assignment, &probability) in joint.assignments().zip(joint.values()) {
                    if probability == 0.0 {
                        continue;
                    }
                    gradient.add_vector_in_place(
                        &table.get_assignment_value(&assignment),
                        -probability,
                    );
                }
            }
        }
        Ok(objective)
    }
}

/// Value of every variable in the labeled assignment.
///
/// An observed value wins, then a deterministic marginal, then the training
/// label.
fn gold_assignment(model: &GraphicalModel, result: &MarginalResult) -> Result<BTreeMap<usize, usize>> {
    result
        .marginals
        .iter()
        .map(|(&variable, marginal)| {
            let value = match model.observed_value(variable)? {
                Some(value) => value,
                None => match marginal.iter().position(|&p| p == 1.0) {
                    Some(value) => value,
                    None => model
                        .training_label(variable)?
                        .ok_or(Error::MissingLabel { variable })?,
                },
            };
            if value >= marginal.len() {
                return Err(Error::invalid_input(format!(
                    "variable {} labeled {} but has only {} values",
                    variable, value, marginal.len()
                )));
            }
            Ok((variable, value))
        })
        .collect()
}

impl DifferentiableFunction<GraphicalModel> for LogLikelihood {
    fn get_summary_for_instance(
        &self,
        model: &mut GraphicalModel,
        weights: &ConcatVector,
        gradient: &mut ConcatVector,
    ) -> Result<f64> {
        for factor in model.factors_mut() {
            factor.features_table.cache_vectors();
        }
        let summary = Self::summarize(model, weights, Some(gradient));
        for factor in model.factors_mut() {
            factor.features_table.release_cache();
        }
        summary
    }
}
