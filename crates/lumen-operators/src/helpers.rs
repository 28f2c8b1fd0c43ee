//! Helper functions shared by operator implementations.

use lumen_core::{representation_of, CreationContext, ElementType, Error, NodeView, Result};

/// Element type shared by every input and output of a node.
///
/// Inputs listed in `skip_inputs` (e.g. integer axes) are not compared.
pub(crate) fn common_dtype(view: &NodeView<'_>, skip_inputs: &[usize]) -> Result<ElementType> {
    let dtype = view.output_dtype(0)?;
    for i in 0..view.input_count() {
        if skip_inputs.contains(&i) {
            continue;
        }
        let input = view.input_dtype(i)?;
        if input != dtype {
            return Err(Error::unsupported_type(
                input,
                format!(
                    "{} input {i} (output is {dtype}, mixed element types are not supported)",
                    view.display_name()
                ),
            ));
        }
    }
    Ok(dtype)
}

/// Check that `dtype` has a numeric kernel instantiation available on the device.
pub(crate) fn require_numeric(
    ctx: &CreationContext,
    dtype: ElementType,
    what: &str,
) -> Result<()> {
    representation_of(dtype)?;
    if dtype == ElementType::Boolean {
        return Err(Error::unsupported_type(dtype, what));
    }
    ctx.require_support(dtype, what)
}

/// Check that `dtype` is a floating-point type available on the device.
pub(crate) fn require_float(ctx: &CreationContext, dtype: ElementType, what: &str) -> Result<()> {
    if !dtype.is_float() {
        return Err(Error::unsupported_type(dtype, what));
    }
    ctx.require_support(dtype, what)
}

/// Fail with `ShapeMismatch` unless the declared shape equals the computed one.
pub(crate) fn expect_shape(what: &str, declared: &[usize], computed: &[usize]) -> Result<()> {
    if declared != computed {
        return Err(Error::ShapeMismatch(format!(
            "{what}: declared output shape {declared:?}, computed {computed:?}"
        )));
    }
    Ok(())
}

/// Row-major element strides of `shape`.
pub(crate) fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Offset of row-major element `linear` of `shape` under `strides`.
#[inline]
pub(crate) fn strided_offset(mut linear: usize, shape: &[usize], strides: &[usize]) -> usize {
    let mut offset = 0;
    for (dim, stride) in shape.iter().zip(strides).rev() {
        offset += (linear % dim) * stride;
        linear /= dim;
    }
    offset
}

/// Error function, accurate to about 1e-13.
///
/// Uses the Maclaurin series below 3 and the Laplace continued fraction for
/// `erfc` above it.
pub(crate) fn erf(x: f64) -> f64 {
    if x.is_nan() {
        return x;
    }
    let a = x.abs();
    let magnitude = if a < 3.0 {
        erf_series(a)
    } else if a < 6.0 {
        1.0 - erfc_continued_fraction(a)
    } else {
        1.0
    };
    magnitude.copysign(x)
}

fn erf_series(x: f64) -> f64 {
    let x2 = x * x;
    let mut power = x;
    let mut sum = x;
    for n in 1..100 {
        power *= -x2 / n as f64;
        let term = power / (2 * n + 1) as f64;
        sum += term;
        if term.abs() <= f64::EPSILON * sum.abs() {
            break;
        }
    }
    sum * std::f64::consts::FRAC_2_SQRT_PI
}

fn erfc_continued_fraction(x: f64) -> f64 {
    const TERMS: usize = 80;
    let mut tail = x;
    for k in (1..=TERMS).rev() {
        tail = x + (k as f64 / 2.0) / tail;
    }
    (-x * x).exp() / (tail * std::f64::consts::PI.sqrt())
}
