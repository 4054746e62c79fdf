use ndarray::{ArrayD, Dimension, IxDyn};

/// Step `current` to the next assignment in row-major order.
///
/// Returns `false` once every assignment has been visited.
fn advance(dimensions: &[usize], current: &mut [usize]) -> bool {
    for i in (0..dimensions.len()).rev() {
        current[i] += 1;
        if current[i] < dimensions[i] {
            return true;
        }
        current[i] = 0;
    }
    false
}

/// Iterator over every assignment of a set of dimensions, yielding owned vectors.
#[derive(Debug, Clone)]
pub struct AssignmentIter {
    dimensions: Vec<usize>,
    current: Vec<usize>,
    done: bool,
}

impl AssignmentIter {
    pub fn new(dimensions: &[usize]) -> Self {
        Self {
            dimensions: dimensions.to_vec(),
            current: vec![0; dimensions.len()],
            done: dimensions.contains(&0),
        }
    }
}

impl Iterator for AssignmentIter {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.done {
            return None;
        }
        let out = self.current.clone();
        self.done = !advance(&self.dimensions, &mut self.current);
        Some(out)
    }
}

/// Allocation-free walk over every assignment.
///
/// Each call to [`next_assignment`](Self::next_assignment) mutates and hands
/// back the same buffer, so the returned slice is only valid until the next
/// call.
#[derive(Debug, Clone)]
pub struct FastAssignments {
    dimensions: Vec<usize>,
    current: Vec<usize>,
    started: bool,
    done: bool,
}

impl FastAssignments {
    pub fn new(dimensions: &[usize]) -> Self {
        Self {
            dimensions: dimensions.to_vec(),
            current: vec![0; dimensions.len()],
            started: false,
            done: dimensions.contains(&0),
        }
    }

    pub fn next_assignment(&mut self) -> Option<&[usize]> {
        if self.done {
            return None;
        }
        if self.started {
            if !advance(&self.dimensions, &mut self.current) {
                self.done = true;
                return None;
            }
        } else {
            self.started = true;
        }
        Some(&self.current)
    }
}

/// A dense multi-dimensional array addressed by assignment vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct NDArray<T> {
    values: ArrayD<T>,
}

impl<T: Clone> NDArray<T> {
    /// An array of `dimensions` filled with `T::default()`
    pub fn new(dimensions: &[usize]) -> Self
    where
        T: Default,
    {
        Self::from_elem(dimensions, T::default())
    }

    /// An array of `dimensions` filled with `elem`
    pub fn from_elem(dimensions: &[usize], elem: T) -> Self {
        Self::check_dimensions(dimensions);
        Self {
            values: ArrayD::from_elem(IxDyn(dimensions), elem),
        }
    }

    /// An array whose cell at each assignment is `f(assignment)`
    pub fn from_fn<F>(dimensions: &[usize], mut f: F) -> Self
    where
        F: FnMut(&[usize]) -> T,
    {
        Self::check_dimensions(dimensions);
        Self {
            values: ArrayD::from_shape_fn(IxDyn(dimensions), |index: IxDyn| f(index.slice())),
        }
    }

    /// Deep copy of every cell
    pub fn clone_array(&self) -> Self {
        self.clone()
    }
}

impl<T> NDArray<T> {
    fn check_dimensions(dimensions: &[usize]) {
        assert!(
            dimensions.iter().all(|&d| d > 0),
            "every dimension must be positive, got {:?}",
            dimensions
        );
    }

    /// Array of `dimensions` over `values` given in assignment order.
    ///
    /// `None` when the number of values does not match the dimensions.
    pub(crate) fn from_values(dimensions: &[usize], values: Vec<T>) -> Option<Self> {
        if dimensions.contains(&0) {
            return None;
        }
        ArrayD::from_shape_vec(IxDyn(dimensions), values)
            .ok()
            .map(|values| Self { values })
    }

    fn check_assignment(&self, assignment: &[usize]) {
        let dimensions = self.values.shape();
        assert!(
            assignment.len() == dimensions.len()
                && assignment.iter().zip(dimensions).all(|(a, d)| a < d),
            "assignment {:?} does not fit dimensions {:?}",
            assignment,
            dimensions
        );
    }

    /// Size of each dimension
    pub fn dimensions(&self) -> &[usize] {
        self.values.shape()
    }

    /// Number of cells, the product of the dimensions
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get_assignment_value(&self, assignment: &[usize]) -> &T {
        self.check_assignment(assignment);
        &self.values[IxDyn(assignment)]
    }

    pub fn get_assignment_value_mut(&mut self, assignment: &[usize]) -> &mut T {
        self.check_assignment(assignment);
        &mut self.values[IxDyn(assignment)]
    }

    pub fn set_assignment_value(&mut self, assignment: &[usize], value: T) {
        *self.get_assignment_value_mut(assignment) = value;
    }

    /// Every valid assignment exactly once, in row-major order
    pub fn assignments(&self) -> AssignmentIter {
        AssignmentIter::new(self.values.shape())
    }

    /// Like [`assignments`](Self::assignments), reusing one buffer for every step
    pub fn fast_pass_by_reference_iterator(&self) -> FastAssignments {
        FastAssignments::new(self.values.shape())
    }

    /// Cells in the same order as [`assignments`](Self::assignments)
    pub fn values(&self) -> impl Iterator<Item = &T> + Clone + '_ {
        self.values.iter()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        self.values.iter_mut()
    }
}

impl NDArray<f64> {
    /// Same dimensions and every cell within `tolerance`
    pub fn value_equals(&self, other: &NDArray<f64>, tolerance: f64) -> bool {
        self.dimensions() == other.dimensions()
            && self
                .values()
                .zip(other.values())
                .all(|(a, b)| a == b || (a - b).abs() <= tolerance)
    }
}
