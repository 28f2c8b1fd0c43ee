//! Individual operations that don't fit into families.

pub mod convolution;
pub mod fused_convolution;

pub use convolution::{AutoPad, ConvolutionOp, ConvolutionParams};
pub use fused_convolution::FusedConvolutionOp;
