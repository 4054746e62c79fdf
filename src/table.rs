use std::borrow::Cow;
use std::fmt;
use std::io::{Read, Write};
use std::mem;
use std::sync::Arc;

use crate::codec::{bounded_capacity, read_len, write_len};
use crate::concat_vector::ConcatVector;
use crate::error::{Error, Result};
use crate::nd_array::{AssignmentIter, FastAssignments, NDArray};

/// Deferred feature computation for one table cell.
pub type Generator = Arc<dyn Fn() -> ConcatVector + Send + Sync>;

/// A table cell: either a stored vector or a generator with an optional cache.
#[derive(Clone)]
pub enum Cell {
    Materialized(ConcatVector),
    Pending {
        generator: Generator,
        cache: Option<ConcatVector>,
    },
}

impl Default for Cell {
    fn default() -> Self {
        Cell::Materialized(ConcatVector::default())
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Materialized(vector) => f.debug_tuple("Materialized").field(vector).finish(),
            Cell::Pending { cache, .. } => f
                .debug_struct("Pending")
                .field("cached", &cache.is_some())
                .finish(),
        }
    }
}

impl Cell {
    fn value(&self) -> Cow<'_, ConcatVector> {
        match self {
            Cell::Materialized(vector) => Cow::Borrowed(vector),
            Cell::Pending {
                cache: Some(vector),
                ..
            } => Cow::Borrowed(vector),
            Cell::Pending {
                generator,
                cache: None,
            } => Cow::Owned(generator()),
        }
    }
}

/// The feature function of a factor: one [`ConcatVector`] per joint
/// assignment of the factor's neighbors.
///
/// Cells may be produced lazily. [`cache_vectors`](Self::cache_vectors) and
/// [`release_cache`](Self::release_cache) only trade memory for speed; they
/// never change what [`get_assignment_value`](Self::get_assignment_value)
/// returns.
#[derive(Debug, Clone)]
pub struct ConcatVectorTable {
    cells: NDArray<Cell>,
}

impl ConcatVectorTable {
    /// A table of `dimensions` with every cell set to an empty vector
    pub fn new(dimensions: &[usize]) -> Self {
        Self {
            cells: NDArray::new(dimensions),
        }
    }

    /// A table whose cells are computed on demand by `generator`
    pub fn from_fn<F>(dimensions: &[usize], generator: F) -> Self
    where
        F: Fn(&[usize]) -> ConcatVector + Send + Sync + 'static,
    {
        let generator = Arc::new(generator);
        let cells = NDArray::from_fn(dimensions, |assignment| {
            let generator = Arc::clone(&generator);
            let assignment = assignment.to_vec();
            Cell::Pending {
                generator: Arc::new(move || generator(&assignment)),
                cache: None,
            }
        });
        Self { cells }
    }

    pub fn dimensions(&self) -> &[usize] {
        self.cells.dimensions()
    }

    /// Store `vector` eagerly at `assignment`
    pub fn set_assignment_value(&mut self, assignment: &[usize], vector: ConcatVector) {
        self.cells
            .set_assignment_value(assignment, Cell::Materialized(vector));
    }

    /// Store a deferred computation at `assignment`
    pub fn set_assignment_generator<F>(&mut self, assignment: &[usize], generator: F)
    where
        F: Fn() -> ConcatVector + Send + Sync + 'static,
    {
        self.cells.set_assignment_value(
            assignment,
            Cell::Pending {
                generator: Arc::new(generator),
                cache: None,
            },
        );
    }

    /// The feature vector at `assignment`, computing it if it is not stored
    pub fn get_assignment_value(&self, assignment: &[usize]) -> Cow<'_, ConcatVector> {
        self.cells.get_assignment_value(assignment).value()
    }

    /// Force every pending cell and keep the results
    pub fn cache_vectors(&mut self) {
        for cell in self.cells.values_mut() {
            if let Cell::Pending { generator, cache } = cell {
                if cache.is_none() {
                    *cache = Some(generator());
                }
            }
        }
    }

    /// Drop every cached result, keeping the generators
    pub fn release_cache(&mut self) {
        for cell in self.cells.values_mut() {
            if let Cell::Pending { cache, .. } = cell {
                *cache = None;
            }
        }
    }

    /// Whether every cell can be read without running a generator
    pub fn is_cached(&self) -> bool {
        self.cells.values().all(|cell| {
            !matches!(
                cell,
                Cell::Pending {
                    cache: None,
                    ..
                }
            )
        })
    }

    pub fn assignments(&self) -> AssignmentIter {
        self.cells.assignments()
    }

    pub fn fast_pass_by_reference_iterator(&self) -> FastAssignments {
        self.cells.fast_pass_by_reference_iterator()
    }

    /// Product of the dimension sizes.
    ///
    /// Only meant as a relative cost estimate.
    pub fn combinatorial_neighbor_states_count(&self) -> usize {
        self.cells.len()
    }

    /// Copy of the table; generators are shared, cached and stored vectors are copied
    pub fn clone_table(&self) -> Self {
        self.clone()
    }

    /// Same dimensions and every cell `value_equals` within `tolerance`
    pub fn value_equals(&self, other: &ConcatVectorTable, tolerance: f64) -> bool {
        self.dimensions() == other.dimensions()
            && self.assignments().all(|assignment| {
                self.get_assignment_value(&assignment)
                    .value_equals(&other.get_assignment_value(&assignment), tolerance)
            })
    }

    /// Serialize dimensions and every cell, running generators as needed
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let dimensions = self.dimensions();
        write_len(w, dimensions.len(), "number of dimensions")?;
        for &d in dimensions {
            write_len(w, d, "dimension size")?;
        }
        for assignment in self.assignments() {
            self.get_assignment_value(&assignment).write_to(w)?;
        }
        Ok(())
    }

    /// Read a table written by [`write_to`](Self::write_to). Every cell comes back materialized.
    pub fn read_from<R: Read>(r: &mut R) -> Result<ConcatVectorTable> {
        let num_dimensions = read_len(r)?;
        let mut dimensions = Vec::with_capacity(bounded_capacity(num_dimensions));
        for _ in 0..num_dimensions {
            let d = read_len(r)?;
            if d == 0 {
                return Err(Error::invalid_data("table dimension must be positive"));
            }
            dimensions.push(d);
        }

        let max_cells = isize::MAX as usize / mem::size_of::<Cell>();
        let num_cells = dimensions
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .filter(|&n| n <= max_cells)
            .ok_or_else(|| Error::invalid_data("table too large"))?;

        // Cells arrive in assignment order; a truncated stream fails before the table is built
        let mut cells = Vec::with_capacity(bounded_capacity(num_cells));
        for _ in 0..num_cells {
            cells.push(Cell::Materialized(ConcatVector::read_from(r)?));
        }
        let cells = NDArray::from_values(&dimensions, cells)
            .ok_or_else(|| Error::invalid_data("table cells do not match its dimensions"))?;
        Ok(ConcatVectorTable { cells })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn feature(assignment: &[usize]) -> ConcatVector {
        let mut v = ConcatVector::new(2);
        v.set_sparse_component(0, assignment.iter().sum(), 1.0);
        v.set_dense_component(1, assignment.iter().map(|&a| a as f64).collect());
        v
    }

    #[test]
    fn test_cache_bracket_is_transparent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut table = ConcatVectorTable::from_fn(&[2, 3], move |a| {
            counter.fetch_add(1, Ordering::SeqCst);
            feature(a)
        });
        assert!(!table.is_cached());

        let before: Vec<_> = table
            .assignments()
            .map(|a| table.get_assignment_value(&a).into_owned())
            .collect();
        table.cache_vectors();
        assert!(table.is_cached());
        let calls_after_cache = calls.load(Ordering::SeqCst);
        for (a, expected) in table.assignments().zip(&before) {
            assert!(table.get_assignment_value(&a).value_equals(expected, 1e-12));
        }
        assert_eq!(calls.load(Ordering::SeqCst), calls_after_cache);

        table.release_cache();
        assert!(!table.is_cached());
        for (a, expected) in table.assignments().zip(&before) {
            assert!(table.get_assignment_value(&a).value_equals(expected, 1e-12));
        }
    }

    #[test]
    fn test_mixed_cells() {
        let mut table = ConcatVectorTable::new(&[2]);
        table.set_assignment_value(&[0], feature(&[3]));
        table.set_assignment_generator(&[1], || feature(&[4]));
        assert_eq!(table.get_assignment_value(&[0]).value_at(0, 3), 1.0);
        assert_eq!(table.get_assignment_value(&[1]).value_at(1, 0), 4.0);
        assert_eq!(table.combinatorial_neighbor_states_count(), 2);
    }

    #[test]
    fn test_serialization_materializes() {
        let table = ConcatVectorTable::from_fn(&[2, 2, 3], feature);
        let mut buf = Vec::new();
        table.write_to(&mut buf).unwrap();
        let read = ConcatVectorTable::read_from(&mut Cursor::new(buf)).unwrap();
        assert!(read.is_cached());
        assert!(read.value_equals(&table, 1e-5));
        assert!(table.clone_table().value_equals(&table, 1e-5));
    }

    #[test]
    fn test_oversized_header_is_rejected() {
        let mut buf = Vec::new();
        write_len(&mut buf, 3, "").unwrap();
        for _ in 0..3 {
            write_len(&mut buf, u32::MAX as usize, "").unwrap();
        }
        let err = ConcatVectorTable::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));

        // Plausible size with no cells behind it runs out of input instead of allocating
        let mut buf = Vec::new();
        write_len(&mut buf, 2, "").unwrap();
        write_len(&mut buf, 1 << 20, "").unwrap();
        write_len(&mut buf, 1 << 10, "").unwrap();
        ConcatVector::new(0).write_to(&mut buf).unwrap();
        let err = ConcatVectorTable::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
