//! Buffer-table indices for operation inputs and outputs.

use crate::graph::TensorId;
use crate::{Error, Result};
use std::fmt;

/// Index into the graph-wide buffer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferIndex(pub usize);

impl From<TensorId> for BufferIndex {
    fn from(id: TensorId) -> Self {
        BufferIndex(id)
    }
}

impl fmt::Display for BufferIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ordered, immutable list of buffer-table indices.
///
/// Insertion order is tensor argument order. There is no mutating API:
/// an operation receives its collections by value at construction and
/// keeps them unchanged for its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct IndexCollection(Vec<BufferIndex>);

impl IndexCollection {
    /// Build a collection from tensor ids.
    pub fn new(ids: &[TensorId]) -> Self {
        Self(ids.iter().copied().map(BufferIndex).collect())
    }

    /// Number of indices.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get the index at argument position `pos`.
    pub fn get(&self, pos: usize) -> Option<BufferIndex> {
        self.0.get(pos).copied()
    }

    /// Iterate over indices in argument order.
    pub fn iter(&self) -> impl Iterator<Item = BufferIndex> + '_ {
        self.0.iter().copied()
    }

    /// Check if `index` appears in the collection.
    pub fn contains(&self, index: BufferIndex) -> bool {
        self.0.contains(&index)
    }

    /// Check if any index is shared with `other`.
    pub fn overlaps(&self, other: &IndexCollection) -> bool {
        self.0.iter().any(|index| other.contains(*index))
    }

    /// Borrow the indices as a slice.
    pub fn as_slice(&self) -> &[BufferIndex] {
        &self.0
    }

    /// Check that the collection holds exactly `arity` indices.
    pub fn expect_arity(&self, arity: usize, what: &str) -> Result<()> {
        self.expect_arity_range(arity, arity, what)
    }

    /// Check that the collection holds between `min` and `max` indices.
    pub fn expect_arity_range(&self, min: usize, max: usize, what: &str) -> Result<()> {
        if self.len() < min || self.len() > max {
            let expected = if min == max {
                min.to_string()
            } else {
                format!("{min}..={max}")
            };
            return Err(Error::ShapeMismatch(format!(
                "{what} expects {expected} buffers, got {}",
                self.len()
            )));
        }
        Ok(())
    }
}

impl FromIterator<BufferIndex> for IndexCollection {
    fn from_iter<I: IntoIterator<Item = BufferIndex>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
