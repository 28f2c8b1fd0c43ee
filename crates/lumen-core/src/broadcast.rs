//! Broadcasting helpers for elementwise operations.

use crate::{Error, Result};

/// Compute NumPy-style broadcast output shape from two input shapes.
///
/// Implements NumPy broadcasting rules:
/// - Shapes are aligned from the rightmost dimension
/// - Dimensions match if they are equal or one of them is 1
/// - Missing dimensions in shorter shapes are treated as 1
///
/// # Example
///
/// ```text
/// broadcast_shape(&[2, 3, 4], &[3, 4])    -> [2, 3, 4]
/// broadcast_shape(&[1, 5, 1, 1], &[1, 5, 28, 28]) -> [1, 5, 28, 28]
/// broadcast_shape(&[8, 1, 6, 1], &[7, 1, 5]) -> [8, 7, 6, 5]
/// ```
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let max_rank = a.len().max(b.len());
    let dim = |shape: &[usize], i: usize| {
        let pad = max_rank - shape.len();
        if i < pad {
            1
        } else {
            shape[i - pad]
        }
    };

    (0..max_rank)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (da, db) if da == db => Ok(da),
            (1, db) => Ok(db),
            (da, 1) => Ok(da),
            _ => Err(Error::ShapeMismatch(format!(
                "Cannot broadcast shapes {a:?} and {b:?} at dimension {i}"
            ))),
        })
        .collect()
}

/// Element strides that read `shape` as if it had been broadcast to `target`.
///
/// Broadcast dimensions (size 1 in `shape`, or missing) get stride 0.
/// `target` must be a valid broadcast of `shape`.
pub fn broadcast_strides(shape: &[usize], target: &[usize]) -> Result<Vec<usize>> {
    if shape.len() > target.len() {
        return Err(Error::ShapeMismatch(format!(
            "Cannot broadcast rank-{} shape {shape:?} to {target:?}",
            shape.len()
        )));
    }

    let pad = target.len() - shape.len();
    let mut strides = vec![0; target.len()];
    let mut stride = 1;
    for i in (0..shape.len()).rev() {
        let (dim, want) = (shape[i], target[i + pad]);
        if dim == want {
            strides[i + pad] = if dim == 1 { 0 } else { stride };
        } else if dim != 1 {
            return Err(Error::ShapeMismatch(format!(
                "Cannot broadcast shape {shape:?} to {target:?}"
            )));
        }
        stride *= dim;
    }
    Ok(strides)
}
