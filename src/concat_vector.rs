use std::fmt;
use std::io::{Read, Write};

use crate::codec::{
    bounded_capacity, read_f64, read_len, read_u8, write_f64, write_len, write_u8,
};
use crate::error::{Error, Result};

const TAG_DENSE: u8 = 0;
const TAG_SPARSE: u8 = 1;

/// A single block of a [`ConcatVector`].
#[derive(Debug, Clone, PartialEq)]
pub enum Component {
    /// Explicitly stored values, implicitly zero past the end
    Dense(Vec<f64>),
    /// A single non-zero entry at `index`, zero everywhere else
    Sparse { index: usize, value: f64 },
}

/// Missing components behave exactly like this one.
static EMPTY: Component = Component::Dense(Vec::new());

impl Component {
    fn value_at(&self, offset: usize) -> f64 {
        match self {
            Component::Dense(values) => values.get(offset).copied().unwrap_or(0.0),
            Component::Sparse { index, value } => {
                if *index == offset {
                    *value
                } else {
                    0.0
                }
            }
        }
    }

    fn dot(&self, other: &Component) -> f64 {
        match (self, other) {
            (Component::Dense(a), Component::Dense(b)) => {
                a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
            }
            (Component::Dense(a), Component::Sparse { index, value })
            | (Component::Sparse { index, value }, Component::Dense(a)) => {
                a.get(*index).map_or(0.0, |d| d * value)
            }
            (
                Component::Sparse { index: i, value: v },
                Component::Sparse { index: j, value: w },
            ) => {
                if i == j {
                    v * w
                } else {
                    0.0
                }
            }
        }
    }

    fn add_scaled(&mut self, other: &Component, scale: f64) {
        match (&mut *self, other) {
            (Component::Dense(a), Component::Dense(b)) => {
                if b.len() > a.len() {
                    a.resize(b.len(), 0.0);
                }
                for (x, y) in a.iter_mut().zip(b.iter()) {
                    *x += scale * y;
                }
            }
            (Component::Dense(a), Component::Sparse { index, value }) => {
                if *index >= a.len() {
                    a.resize(index + 1, 0.0);
                }
                a[*index] += scale * value;
            }
            (Component::Sparse { index, value }, Component::Dense(b)) => {
                let mut dense: Vec<f64> = b.iter().map(|y| scale * y).collect();
                if *index >= dense.len() {
                    dense.resize(*index + 1, 0.0);
                }
                dense[*index] += *value;
                *self = Component::Dense(dense);
            }
            (
                Component::Sparse { index: i, value: v },
                Component::Sparse { index: j, value: w },
            ) => {
                if i == j {
                    *v += scale * w;
                } else {
                    let mut dense = vec![0.0; (*i).max(*j) + 1];
                    dense[*i] = *v;
                    dense[*j] += scale * w;
                    *self = Component::Dense(dense);
                }
            }
        }
    }

    fn multiply(&mut self, other: &Component) {
        match (self, other) {
            (Component::Dense(a), Component::Dense(b)) => {
                for (k, x) in a.iter_mut().enumerate() {
                    *x *= b.get(k).copied().unwrap_or(0.0);
                }
            }
            (Component::Dense(a), Component::Sparse { index, value }) => {
                for (k, x) in a.iter_mut().enumerate() {
                    if k == *index {
                        *x *= value;
                    } else {
                        *x = 0.0;
                    }
                }
            }
            (Component::Sparse { index, value }, other) => {
                *value *= other.value_at(*index);
            }
        }
    }

    fn zero(&mut self) {
        match self {
            Component::Dense(values) => values.iter_mut().for_each(|v| *v = 0.0),
            Component::Sparse { value, .. } => *value = 0.0,
        }
    }

    fn equals(&self, other: &Component, tolerance: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= tolerance;
        match (self, other) {
            (Component::Dense(a), Component::Dense(b)) => {
                let n = a.len().max(b.len());
                (0..n).all(|k| {
                    close(
                        a.get(k).copied().unwrap_or(0.0),
                        b.get(k).copied().unwrap_or(0.0),
                    )
                })
            }
            (Component::Dense(a), Component::Sparse { index, value })
            | (Component::Sparse { index, value }, Component::Dense(a)) => {
                let others_zero = a
                    .iter()
                    .enumerate()
                    .all(|(k, x)| k == *index || close(*x, 0.0));
                others_zero && close(a.get(*index).copied().unwrap_or(0.0), *value)
            }
            (
                Component::Sparse { index: i, value: v },
                Component::Sparse { index: j, value: w },
            ) => {
                if i == j {
                    close(*v, *w)
                } else {
                    close(*v, 0.0) && close(*w, 0.0)
                }
            }
        }
    }
}

/// A vector made of independently typed components.
///
/// Each component is either a dense array or a single sparse entry, which
/// keeps one-hot features (word identities, label pairs) cheap next to dense
/// blocks such as embeddings. Vectors of different lengths are compatible:
/// components past the end of a vector are treated as zero by every
/// operation, so a vector built before its [`ConcatVectorNamespace`] grew is
/// still meaningful against newer ones.
///
/// [`ConcatVectorNamespace`]: crate::ConcatVectorNamespace
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConcatVector {
    components: Vec<Component>,
}

impl ConcatVector {
    /// Create a vector with `num_components` empty (all-zero) components
    pub fn new(num_components: usize) -> Self {
        Self {
            components: vec![Component::Dense(Vec::new()); num_components],
        }
    }

    /// Number of components, including empty ones
    pub fn number_of_components(&self) -> usize {
        self.components.len()
    }

    /// Borrow component `i`, if it exists
    pub fn component(&self, i: usize) -> Option<&Component> {
        self.components.get(i)
    }

    /// Whether component `i` is stored sparsely. Missing components are dense.
    pub fn is_component_sparse(&self, i: usize) -> bool {
        matches!(self.components.get(i), Some(Component::Sparse { .. }))
    }

    /// Values of component `i` when it is stored densely
    pub fn dense_component(&self, i: usize) -> Option<&[f64]> {
        match self.components.get(i) {
            Some(Component::Dense(values)) => Some(values),
            _ => None,
        }
    }

    /// Index of the non-zero entry of component `i` when it is stored sparsely
    pub fn sparse_index(&self, i: usize) -> Option<usize> {
        match self.components.get(i) {
            Some(Component::Sparse { index, .. }) => Some(*index),
            _ => None,
        }
    }

    /// Value at `offset` inside `component`, zero when not stored
    pub fn value_at(&self, component: usize, offset: usize) -> f64 {
        self.components
            .get(component)
            .map_or(0.0, |c| c.value_at(offset))
    }

    fn ensure_components(&mut self, len: usize) {
        if self.components.len() < len {
            self.components.resize(len, Component::Dense(Vec::new()));
        }
    }

    /// Overwrite component `i` with dense values, growing the vector if needed
    pub fn set_dense_component(&mut self, i: usize, values: Vec<f64>) {
        self.ensure_components(i + 1);
        self.components[i] = Component::Dense(values);
    }

    /// Overwrite component `i` with a single sparse entry, growing the vector if needed
    pub fn set_sparse_component(&mut self, i: usize, index: usize, value: f64) {
        self.ensure_components(i + 1);
        self.components[i] = Component::Sparse { index, value };
    }

    /// Inner product. Only components present in both vectors contribute.
    pub fn dot_product(&self, other: &ConcatVector) -> f64 {
        self.components
            .iter()
            .zip(other.components.iter())
            .map(|(a, b)| a.dot(b))
            .sum()
    }

    /// `self += scale * other`
    ///
    /// A sparse component of `self` that meets a dense one (or a sparse one
    /// at another index) is upgraded to dense.
    pub fn add_vector_in_place(&mut self, other: &ConcatVector, scale: f64) {
        self.ensure_components(other.components.len());
        for (a, b) in self.components.iter_mut().zip(other.components.iter()) {
            a.add_scaled(b, scale);
        }
    }

    /// Multiply element by element. Components missing from `other` become zero.
    pub fn elementwise_product_in_place(&mut self, other: &ConcatVector) {
        for (i, a) in self.components.iter_mut().enumerate() {
            match other.components.get(i) {
                Some(b) => a.multiply(b),
                None => a.zero(),
            }
        }
    }

    /// Apply `f` to every explicitly stored scalar
    pub fn map_in_place<F>(&mut self, mut f: F)
    where
        F: FnMut(f64) -> f64,
    {
        for component in &mut self.components {
            match component {
                Component::Dense(values) => {
                    for v in values.iter_mut() {
                        *v = f(*v);
                    }
                }
                Component::Sparse { value, .. } => *value = f(*value),
            }
        }
    }

    /// A vector with the same shape and sparsity pattern, all zeros
    pub fn new_empty_clone(&self) -> ConcatVector {
        let mut clone = self.clone();
        clone.components.iter_mut().for_each(Component::zero);
        clone
    }

    /// An independent copy
    pub fn deep_clone(&self) -> ConcatVector {
        self.clone()
    }

    /// Structural equality where missing entries count as zero
    pub fn value_equals(&self, other: &ConcatVector, tolerance: f64) -> bool {
        let n = self.components.len().max(other.components.len());
        (0..n).all(|i| {
            let a = self.components.get(i).unwrap_or(&EMPTY);
            let b = other.components.get(i).unwrap_or(&EMPTY);
            a.equals(b, tolerance)
        })
    }

    /// Serialize the vector in a compact little-endian layout
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        write_len(w, self.components.len(), "number of components")?;
        for component in &self.components {
            match component {
                Component::Dense(values) => {
                    write_u8(w, TAG_DENSE)?;
                    write_len(w, values.len(), "dense component length")?;
                    for v in values {
                        write_f64(w, *v)?;
                    }
                }
                Component::Sparse { index, value } => {
                    write_u8(w, TAG_SPARSE)?;
                    write_len(w, *index, "sparse index")?;
                    write_f64(w, *value)?;
                }
            }
        }
        Ok(())
    }

    /// Read a vector written by [`write_to`](Self::write_to)
    pub fn read_from<R: Read>(r: &mut R) -> Result<ConcatVector> {
        let len = read_len(r)?;
        let mut components = Vec::with_capacity(bounded_capacity(len));
        for _ in 0..len {
            let component = match read_u8(r)? {
                TAG_DENSE => {
                    let n = read_len(r)?;
                    let mut values = Vec::with_capacity(bounded_capacity(n));
                    for _ in 0..n {
                        values.push(read_f64(r)?);
                    }
                    Component::Dense(values)
                }
                TAG_SPARSE => {
                    let index = read_len(r)?;
                    let value = read_f64(r)?;
                    Component::Sparse { index, value }
                }
                tag => {
                    return Err(Error::invalid_data(format!(
                        "unknown component tag {}",
                        tag
                    )))
                }
            };
            components.push(component);
        }
        Ok(ConcatVector { components })
    }
}

impl fmt::Display for ConcatVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match component {
                Component::Dense(values) => write!(f, "{:?}", values)?,
                Component::Sparse { index, value } => write!(f, "{{{}: {}}}", index, value)?,
            }
        }
        write!(f, "]")
    }
}
