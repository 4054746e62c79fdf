use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};

use crate::codec::{
    bounded_capacity, expect_magic, read_len, read_metadata, write_len, write_metadata,
};
use crate::concat_vector::ConcatVector;
use crate::error::{Error, Result};
use crate::table::ConcatVectorTable;

const MAGIC: &[u8; 4] = b"lGMF";

/// Variable metadata key holding the gold value index used for training.
pub const VARIABLE_TRAINING_VALUE: &str = "VariableTrainingValue";

/// Variable metadata key clamping a variable to a single value during inference.
pub const VARIABLE_OBSERVED_VALUE: &str = "VariableObservedValue";

/// A factor: a feature table over the joint assignments of its neighbors.
#[derive(Debug, Clone)]
pub struct Factor {
    /// Variable ids, in the order of the table's dimensions
    pub neighbor_indices: Vec<usize>,
    /// Feature vector for every joint assignment of the neighbors
    pub features_table: ConcatVectorTable,
    /// Free-form annotations
    pub metadata: HashMap<String, String>,
}

impl Factor {
    /// Domain size of each neighbor
    pub fn neighbor_dimensions(&self) -> &[usize] {
        self.features_table.dimensions()
    }

    pub fn value_equals(&self, other: &Factor, tolerance: f64) -> bool {
        self.neighbor_indices == other.neighbor_indices
            && self.metadata == other.metadata
            && self
                .features_table
                .value_equals(&other.features_table, tolerance)
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        write_len(w, self.neighbor_indices.len(), "number of neighbors")?;
        for &index in &self.neighbor_indices {
            write_len(w, index, "variable id")?;
        }
        self.features_table.write_to(w)?;
        write_metadata(w, &self.metadata)
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Factor> {
        let num_neighbors = read_len(r)?;
        let mut neighbor_indices = Vec::with_capacity(bounded_capacity(num_neighbors));
        for _ in 0..num_neighbors {
            neighbor_indices.push(read_len(r)?);
        }
        let features_table = ConcatVectorTable::read_from(r)?;
        if features_table.dimensions().len() != neighbor_indices.len() {
            return Err(Error::invalid_data(
                "factor table arity does not match its neighbors",
            ));
        }
        let metadata = read_metadata(r)?;
        Ok(Factor {
            neighbor_indices,
            features_table,
            metadata,
        })
    }
}

/// A log-linear factor graph.
///
/// Variables exist only through the factors that reference them; their ids
/// are chosen by the caller. Metadata maps are handed out by reference so
/// featurizers and inference can annotate a model in place.
#[derive(Debug, Clone, Default)]
pub struct GraphicalModel {
    factors: Vec<Factor>,
    variable_metadata: HashMap<usize, HashMap<String, String>>,
    model_metadata: HashMap<String, String>,
}

impl GraphicalModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factor whose feature vectors are produced lazily by `generator`.
    ///
    /// # Panics
    ///
    /// When `neighbor_indices` and `neighbor_dimensions` differ in length.
    pub fn add_factor<F>(
        &mut self,
        neighbor_indices: &[usize],
        neighbor_dimensions: &[usize],
        generator: F,
    ) -> &mut Factor
    where
        F: Fn(&[usize]) -> ConcatVector + Send + Sync + 'static,
    {
        assert_eq!(
            neighbor_indices.len(),
            neighbor_dimensions.len(),
            "every neighbor needs a dimension"
        );
        let table = ConcatVectorTable::from_fn(neighbor_dimensions, generator);
        self.add_factor_from_table(neighbor_indices, table)
    }

    /// Add a factor over an already built table
    pub fn add_factor_from_table(
        &mut self,
        neighbor_indices: &[usize],
        features_table: ConcatVectorTable,
    ) -> &mut Factor {
        assert_eq!(
            neighbor_indices.len(),
            features_table.dimensions().len(),
            "table arity must match the number of neighbors"
        );
        self.factors.push(Factor {
            neighbor_indices: neighbor_indices.to_vec(),
            features_table,
            metadata: HashMap::new(),
        });
        let last = self.factors.len() - 1;
        &mut self.factors[last]
    }

    /// Append an existing factor, e.g. one taken back with [`pop_factor`](Self::pop_factor)
    pub fn push_factor(&mut self, factor: Factor) {
        self.factors.push(factor);
    }

    /// Remove and return the most recently added factor
    pub fn pop_factor(&mut self) -> Option<Factor> {
        self.factors.pop()
    }

    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    pub fn factors_mut(&mut self) -> &mut [Factor] {
        &mut self.factors
    }

    pub fn model_metadata(&self) -> &HashMap<String, String> {
        &self.model_metadata
    }

    pub fn model_metadata_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.model_metadata
    }

    pub fn variable_metadata(&self, variable: usize) -> Option<&HashMap<String, String>> {
        self.variable_metadata.get(&variable)
    }

    /// Metadata of `variable`, created empty on first access
    pub fn variable_metadata_mut(&mut self, variable: usize) -> &mut HashMap<String, String> {
        self.variable_metadata.entry(variable).or_default()
    }

    fn variable_value(&self, variable: usize, key: &str) -> Result<Option<usize>> {
        let raw = match self.variable_metadata.get(&variable).and_then(|m| m.get(key)) {
            Some(raw) => raw,
            None => return Ok(None),
        };
        raw.parse().map(Some).map_err(|_| {
            Error::invalid_input(format!(
                "variable {} has non-numeric {} value {:?}",
                variable, key, raw
            ))
        })
    }

    /// Clamp `variable` to `value` for subsequent inference
    pub fn observe(&mut self, variable: usize, value: usize) {
        self.variable_metadata_mut(variable)
            .insert(VARIABLE_OBSERVED_VALUE.to_string(), value.to_string());
    }

    /// Remove a clamp set by [`observe`](Self::observe)
    pub fn unobserve(&mut self, variable: usize) {
        if let Some(metadata) = self.variable_metadata.get_mut(&variable) {
            metadata.remove(VARIABLE_OBSERVED_VALUE);
        }
    }

    /// Clamped value of `variable`, failing on a value that is not an integer
    pub fn observed_value(&self, variable: usize) -> Result<Option<usize>> {
        self.variable_value(variable, VARIABLE_OBSERVED_VALUE)
    }

    /// Record the gold value of `variable` for training
    pub fn set_training_label(&mut self, variable: usize, value: usize) {
        self.variable_metadata_mut(variable)
            .insert(VARIABLE_TRAINING_VALUE.to_string(), value.to_string());
    }

    pub fn training_label(&self, variable: usize) -> Result<Option<usize>> {
        self.variable_value(variable, VARIABLE_TRAINING_VALUE)
    }

    /// Domain size of every variable referenced by a factor.
    ///
    /// Fails when two factors disagree about the size of the same variable.
    pub fn variable_sizes(&self) -> Result<BTreeMap<usize, usize>> {
        let mut sizes = BTreeMap::new();
        for factor in &self.factors {
            for (&variable, &size) in factor
                .neighbor_indices
                .iter()
                .zip(factor.neighbor_dimensions())
            {
                let known = *sizes.entry(variable).or_insert(size);
                if known != size {
                    return Err(Error::StructuralInconsistency {
                        variable,
                        first: known,
                        second: size,
                    });
                }
            }
        }
        Ok(sizes)
    }

    /// Independent copy of factors, tables and all metadata
    pub fn clone_model(&self) -> GraphicalModel {
        self.clone()
    }

    /// Structural equality; empty variable metadata maps count as absent
    pub fn value_equals(&self, other: &GraphicalModel, tolerance: f64) -> bool {
        fn non_empty(
            map: &HashMap<usize, HashMap<String, String>>,
        ) -> BTreeMap<usize, &HashMap<String, String>> {
            map.iter()
                .filter(|(_, m)| !m.is_empty())
                .map(|(k, m)| (*k, m))
                .collect()
        }

        self.factors.len() == other.factors.len()
            && self.model_metadata == other.model_metadata
            && non_empty(&self.variable_metadata) == non_empty(&other.variable_metadata)
            && self
                .factors
                .iter()
                .zip(&other.factors)
                .all(|(a, b)| a.value_equals(b, tolerance))
    }

    /// Serialize factors, tables and metadata. Lazy cells are evaluated.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(MAGIC)?;
        write_metadata(w, &self.model_metadata)?;
        write_len(w, self.factors.len(), "number of factors")?;
        for factor in &self.factors {
            factor.write_to(w)?;
        }
        let variables: BTreeMap<_, _> = self.variable_metadata.iter().collect();
        write_len(w, variables.len(), "number of annotated variables")?;
        for (&variable, metadata) in variables {
            write_len(w, variable, "variable id")?;
            write_metadata(w, metadata)?;
        }
        Ok(())
    }

    /// Read a model written by [`write_to`](Self::write_to)
    pub fn read_from<R: Read>(r: &mut R) -> Result<GraphicalModel> {
        expect_magic(r, MAGIC)?;
        let model_metadata = read_metadata(r)?;
        let num_factors = read_len(r)?;
        let mut factors = Vec::with_capacity(bounded_capacity(num_factors));
        for _ in 0..num_factors {
            factors.push(Factor::read_from(r)?);
        }
        let num_variables = read_len(r)?;
        let mut variable_metadata = HashMap::with_capacity(bounded_capacity(num_variables));
        for _ in 0..num_variables {
            let variable = read_len(r)?;
            variable_metadata.insert(variable, read_metadata(r)?);
        }
        Ok(GraphicalModel {
            factors,
            variable_metadata,
            model_metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn indicator(assignment: &[usize]) -> ConcatVector {
        let mut v = ConcatVector::new(1);
        v.set_sparse_component(0, assignment.iter().fold(0, |acc, &a| acc * 3 + a), 1.0);
        v
    }

    fn chain() -> GraphicalModel {
        let mut model = GraphicalModel::new();
        model.add_factor(&[0, 1], &[3, 2], indicator);
        model.add_factor(&[1, 2], &[2, 3], indicator);
        model
    }

    #[test]
    fn test_variable_sizes() {
        let sizes = chain().variable_sizes().unwrap();
        assert_eq!(sizes.into_iter().collect::<Vec<_>>(), vec![(0, 3), (1, 2), (2, 3)]);
    }

    #[test]
    fn test_conflicting_sizes() {
        let mut model = chain();
        model.add_factor(&[2], &[4], indicator);
        let err = model.variable_sizes().unwrap_err();
        assert!(matches!(
            err,
            Error::StructuralInconsistency {
                variable: 2,
                first: 3,
                second: 4
            }
        ));
    }

    #[test]
    fn test_observe_and_unobserve() {
        let mut model = chain();
        model.observe(1, 1);
        assert_eq!(model.observed_value(1).unwrap(), Some(1));
        model.unobserve(1);
        assert_eq!(model.observed_value(1).unwrap(), None);
        model.set_training_label(0, 2);
        assert_eq!(model.training_label(0).unwrap(), Some(2));
    }

    #[test]
    fn test_non_numeric_values_are_rejected() {
        let mut model = chain();
        model
            .variable_metadata_mut(1)
            .insert(VARIABLE_OBSERVED_VALUE.to_string(), "yes".to_string());
        assert!(matches!(model.observed_value(1), Err(Error::InvalidInput(_))));
        model
            .variable_metadata_mut(0)
            .insert(VARIABLE_TRAINING_VALUE.to_string(), "-1".to_string());
        assert!(matches!(model.training_label(0), Err(Error::InvalidInput(_))));
        assert_eq!(model.training_label(2).unwrap(), None);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut model = chain();
        model.model_metadata_mut().insert("name".into(), "a".into());
        model.set_training_label(0, 1);

        let mut clone = model.clone_model();
        clone.model_metadata_mut().insert("name".into(), "b".into());
        clone.variable_metadata_mut(0).insert("extra".into(), "x".into());
        clone.factors_mut()[0].metadata.insert("k".into(), "v".into());
        let popped = clone.pop_factor().unwrap();
        clone.push_factor(popped);
        clone.pop_factor();

        assert_eq!(model.model_metadata()["name"], "a");
        assert!(!model.variable_metadata(0).unwrap().contains_key("extra"));
        assert!(model.factors()[0].metadata.is_empty());
        assert_eq!(model.factors().len(), 2);
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut model = chain();
        model.model_metadata_mut().insert("source".into(), "test".into());
        model.set_training_label(2, 1);
        model.factors_mut()[1].metadata.insert("kind".into(), "pair".into());
        model.variable_metadata_mut(7);

        let mut buf = Vec::new();
        model.write_to(&mut buf).unwrap();
        let read = GraphicalModel::read_from(&mut Cursor::new(buf)).unwrap();
        assert!(read.value_equals(&model, 1e-5));
        assert_eq!(read.factors()[1].neighbor_indices, vec![1, 2]);
        assert!(read.factors()[0].features_table.is_cached());
    }

    #[test]
    fn test_value_equals_detects_changes() {
        let model = chain();
        let mut other = model.clone_model();
        assert!(model.value_equals(&other, 1e-9));
        other.observe(0, 1);
        assert!(!model.value_equals(&other, 1e-9));
    }
}
