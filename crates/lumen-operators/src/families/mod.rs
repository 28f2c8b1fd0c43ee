//! Collapsed operator families.
//!
//! These families group similar operations together, implementing the shared
//! kernel once and parameterizing only the per-operation function.

pub mod activation;
pub mod binary_elementwise;
pub mod reduction;
pub mod unary_elementwise;

pub use activation::{Activation, ActivationOp};
pub use binary_elementwise::{BinaryElementwiseOp, BinaryFunction};
pub use reduction::{normalize_axes, reduced_shape, ReduceFunction, ReductionOp};
pub use unary_elementwise::{UnaryElementwiseOp, UnaryFunction};
