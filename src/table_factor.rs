//! Log-space potential tables used by clique tree message passing.

use std::collections::HashMap;

use crate::concat_vector::ConcatVector;
use crate::model::Factor;
use crate::nd_array::{FastAssignments, NDArray};

/// How variables are summed out of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reduce {
    /// log-sum-exp, for marginals and the partition function
    Sum,
    /// max, for MAP decoding
    Max,
}

/// Log-sum-exp trick for numerical stability.
///
/// Returns NEG_INFINITY for empty input or when every value is NEG_INFINITY,
/// and INFINITY as soon as one value is INFINITY.
pub(crate) fn logsumexp<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64> + Clone,
{
    let max_val = values
        .clone()
        .into_iter()
        .fold(f64::NEG_INFINITY, f64::max);
    if max_val.is_infinite() {
        return max_val;
    }
    let sum: f64 = values.into_iter().map(|v| (v - max_val).exp()).sum();
    max_val + sum.ln()
}

#[inline]
fn log_add(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    if max == f64::INFINITY {
        return max;
    }
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// A table of log potentials over a list of variables.
#[derive(Debug, Clone)]
pub(crate) struct TableFactor {
    pub(crate) variables: Vec<usize>,
    pub(crate) values: NDArray<f64>,
}

impl TableFactor {
    /// The neutral table (log 1 everywhere)
    pub(crate) fn ones(variables: Vec<usize>, dimensions: &[usize]) -> Self {
        Self {
            variables,
            values: NDArray::from_elem(dimensions, 0.0),
        }
    }

    fn filled(variables: Vec<usize>, dimensions: &[usize], value: f64) -> Self {
        Self {
            variables,
            values: NDArray::from_elem(dimensions, value),
        }
    }

    /// Score every assignment of `factor` as `weights · features`.
    ///
    /// Assignments that contradict an entry of `observed` get log potential
    /// NEG_INFINITY.
    pub(crate) fn from_factor(
        factor: &Factor,
        weights: &ConcatVector,
        observed: &HashMap<usize, usize>,
    ) -> Self {
        let clamps: Vec<Option<usize>> = factor
            .neighbor_indices
            .iter()
            .map(|variable| observed.get(variable).copied())
            .collect();
        let table = &factor.features_table;
        let values = NDArray::from_fn(factor.neighbor_dimensions(), |assignment| {
            let consistent = assignment
                .iter()
                .zip(&clamps)
                .all(|(value, clamp)| clamp.map_or(true, |c| c == *value));
            if consistent {
                weights.dot_product(&table.get_assignment_value(assignment))
            } else {
                f64::NEG_INFINITY
            }
        });
        Self {
            variables: factor.neighbor_indices.clone(),
            values,
        }
    }

    pub(crate) fn dimensions(&self) -> &[usize] {
        self.values.dimensions()
    }

    /// Positions of `variables` inside this table's variable list
    fn positions(&self, variables: &[usize]) -> Vec<usize> {
        variables
            .iter()
            .map(|v| {
                self.variables
                    .iter()
                    .position(|own| own == v)
                    .unwrap_or_else(|| panic!("variable {} is not in {:?}", v, self.variables))
            })
            .collect()
    }

    /// Pointwise product (log-space sum) with a table over a subset of our variables
    pub(crate) fn multiply_in(&mut self, other: &TableFactor) {
        let positions = self.positions(&other.variables);
        let mut projected = vec![0; positions.len()];
        let mut assignments = FastAssignments::new(self.dimensions());
        while let Some(assignment) = assignments.next_assignment() {
            for (slot, &p) in projected.iter_mut().zip(&positions) {
                *slot = assignment[p];
            }
            let add = *other.values.get_assignment_value(&projected);
            *self.values.get_assignment_value_mut(assignment) += add;
        }
    }

    /// Reduce every variable not in `keep`, producing a table ordered like `keep`
    pub(crate) fn marginalize_onto(&self, keep: &[usize], reduce: Reduce) -> TableFactor {
        let positions = self.positions(keep);
        let dimensions: Vec<usize> = positions.iter().map(|&p| self.dimensions()[p]).collect();
        let mut out = TableFactor::filled(keep.to_vec(), &dimensions, f64::NEG_INFINITY);
        let mut projected = vec![0; positions.len()];
        let mut assignments = FastAssignments::new(self.dimensions());
        while let Some(assignment) = assignments.next_assignment() {
            for (slot, &p) in projected.iter_mut().zip(&positions) {
                *slot = assignment[p];
            }
            let value = *self.values.get_assignment_value(assignment);
            let cell = out.values.get_assignment_value_mut(&projected);
            *cell = match reduce {
                Reduce::Sum => log_add(*cell, value),
                Reduce::Max => cell.max(value),
            };
        }
        out
    }

    /// log of the sum of all potentials
    pub(crate) fn log_sum(&self) -> f64 {
        logsumexp(self.values.values().copied())
    }

    /// Highest scoring assignment agreeing with `fixed`; ties go to the first one visited
    pub(crate) fn argmax(&self, fixed: &HashMap<usize, usize>) -> Vec<usize> {
        let clamps: Vec<Option<usize>> = self
            .variables
            .iter()
            .map(|variable| fixed.get(variable).copied())
            .collect();
        let mut best: Option<(f64, Vec<usize>)> = None;
        let mut assignments = FastAssignments::new(self.dimensions());
        while let Some(assignment) = assignments.next_assignment() {
            let consistent = assignment
                .iter()
                .zip(&clamps)
                .all(|(value, clamp)| clamp.map_or(true, |c| c == *value));
            if !consistent {
                continue;
            }
            let score = *self.values.get_assignment_value(assignment);
            match &best {
                Some((best_score, _)) if score <= *best_score => {}
                _ => best = Some((score, assignment.to_vec())),
            }
        }
        best.map(|(_, assignment)| assignment)
            .unwrap_or_else(|| clamps.iter().map(|c| c.unwrap_or(0)).collect())
    }

    /// Probabilities `exp(value - log_z)` in this table's variable order.
    ///
    /// A component with no possible assignment (`log_z` is NEG_INFINITY)
    /// yields all zeros.
    pub(crate) fn normalized(&self, log_z: f64) -> NDArray<f64> {
        let mut out = self.values.clone_array();
        for value in out.values_mut() {
            *value = if log_z == f64::NEG_INFINITY {
                0.0
            } else {
                (*value - log_z).exp()
            };
        }
        out
    }
}
