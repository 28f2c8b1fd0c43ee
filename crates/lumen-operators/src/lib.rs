//! Operation implementations for Lumen.
//!
//! This crate provides the closed family of device operations, implemented
//! using collapsed operator families to eliminate code duplication.
//!
//! # Operator Families
//!
//! - **Binary elementwise**: Add, Subtract, Multiply, Divide, Maximum, Minimum, Power
//! - **Unary elementwise**: Abs, Negative, Sqrt, Exp, Log
//! - **Reduction**: ReduceMax, ReduceMin, ReduceSum, ReduceMean, ReduceProd,
//!   ReduceL1, ReduceL2, ReduceLogSumExp
//! - **Activation**: Relu, LeakyRelu, Sigmoid, Tanh, Clamp, Elu, Gelu, Swish
//!
//! # Individual Operators
//!
//! - Convolution (2-D, NCHW, im2col + GEMM)
//! - FusedConvolution (convolution + per-channel bias + optional activation)

pub mod families;
pub mod operators;

mod helpers;

pub use families::{
    Activation, ActivationOp, BinaryElementwiseOp, BinaryFunction, ReduceFunction, ReductionOp,
    UnaryElementwiseOp, UnaryFunction,
};
pub use operators::{AutoPad, ConvolutionOp, ConvolutionParams, FusedConvolutionOp};

use lumen_core::{
    CreationContext, Device, DevicePtr, Error, ExecutionCtx, IndexCollection, NodeView, Operation,
    Result, WorkbufferRequest, Workbuffers,
};

/// Operation type names accepted for convolution nodes.
pub const CONVOLUTION_TYPES: [&str; 2] = ["Convolution", "Conv"];

/// Check if `op_type` names a convolution.
pub fn is_convolution(op_type: &str) -> bool {
    CONVOLUTION_TYPES.contains(&op_type)
}

/// Check if `op_type` names a bias-capable addition.
pub fn is_add(op_type: &str) -> bool {
    op_type == "Add"
}

/// The closed family of device operations.
#[derive(Debug)]
pub enum Op {
    Convolution(ConvolutionOp),
    FusedConvolution(FusedConvolutionOp),
    Reduction(ReductionOp),
    Binary(BinaryElementwiseOp),
    Unary(UnaryElementwiseOp),
    Activation(ActivationOp),
}

impl Op {
    /// Build the operation for a single node.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Creation context (device properties, current stream).
    /// * `view` - The node and its tensor metadata.
    /// * `inputs` - Buffer-table indices of the node's inputs.
    /// * `outputs` - Buffer-table indices of the node's outputs.
    ///
    /// # Returns
    ///
    /// The constructed operation, or `UnsupportedConfiguration` when no
    /// kernel backs the node's type, `ShapeMismatch` when attributes and
    /// shapes disagree, `UnsupportedElementType` when the element type has
    /// no kernel on this device.
    pub fn create(
        ctx: &CreationContext,
        view: &NodeView<'_>,
        inputs: IndexCollection,
        outputs: IndexCollection,
    ) -> Result<Self> {
        let op_type = view.op_type();
        let op = if is_convolution(op_type) {
            Op::Convolution(ConvolutionOp::create(ctx, view, inputs, outputs)?)
        } else if let Some(function) = ReduceFunction::from_op_type(op_type) {
            Op::Reduction(ReductionOp::create(ctx, view, function, inputs, outputs)?)
        } else if let Some(function) = BinaryFunction::from_op_type(op_type) {
            Op::Binary(BinaryElementwiseOp::create(
                ctx, view, function, inputs, outputs,
            )?)
        } else if let Some(function) = UnaryFunction::from_op_type(op_type) {
            Op::Unary(UnaryElementwiseOp::create(
                ctx, view, function, inputs, outputs,
            )?)
        } else if Activation::is_activation(op_type) {
            Op::Activation(ActivationOp::create(ctx, view, inputs, outputs)?)
        } else {
            return Err(Error::UnsupportedConfiguration(format!(
                "No kernel for operation type '{op_type}' ({})",
                view.display_name()
            )));
        };
        Ok(op)
    }

    /// Build a fused convolution from a matched convolution chain.
    pub fn fused_convolution(
        ctx: &CreationContext,
        conv: &NodeView<'_>,
        bias_add: &NodeView<'_>,
        activation: Option<&NodeView<'_>>,
        inputs: IndexCollection,
        outputs: IndexCollection,
    ) -> Result<Self> {
        Ok(Op::FusedConvolution(FusedConvolutionOp::create(
            ctx, conv, bias_add, activation, inputs, outputs,
        )?))
    }

    /// Variant name (for logging).
    pub fn kind(&self) -> &'static str {
        match self {
            Op::Convolution(_) => "Convolution",
            Op::FusedConvolution(_) => "FusedConvolution",
            Op::Reduction(_) => "Reduction",
            Op::Binary(_) => "BinaryElementwise",
            Op::Unary(_) => "UnaryElementwise",
            Op::Activation(_) => "Activation",
        }
    }

    fn inner(&self) -> &dyn Operation {
        match self {
            Op::Convolution(op) => op,
            Op::FusedConvolution(op) => op,
            Op::Reduction(op) => op,
            Op::Binary(op) => op,
            Op::Unary(op) => op,
            Op::Activation(op) => op,
        }
    }
}

impl Operation for Op {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn input_ids(&self) -> &IndexCollection {
        self.inner().input_ids()
    }

    fn output_ids(&self) -> &IndexCollection {
        self.inner().output_ids()
    }

    fn workbuffer_request(&self) -> WorkbufferRequest {
        self.inner().workbuffer_request()
    }

    fn initialize_workbuffers(&self, device: &dyn Device, immutable: &[DevicePtr]) -> Result<()> {
        self.inner().initialize_workbuffers(device, immutable)
    }

    fn execute(
        &self,
        ctx: &ExecutionCtx<'_>,
        inputs: &[DevicePtr],
        outputs: &[DevicePtr],
        workbuffers: &Workbuffers,
    ) -> Result<()> {
        self.inner().execute(ctx, inputs, outputs, workbuffers)
    }
}
