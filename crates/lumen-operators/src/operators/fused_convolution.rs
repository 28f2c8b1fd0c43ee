//! Convolution with a fused per-channel bias and optional activation.

use lumen_core::{
    broadcast_strides, validate_binding, CreationContext, Device, DevicePtr, Error, ExecutionCtx,
    IndexCollection, NodeView, Operation, Result, WorkbufferRequest, Workbuffers,
};

use super::convolution::{ConvolutionKernel, ConvolutionParams, Epilogue};
use crate::families::Activation;
use crate::helpers::expect_shape;

/// Convolution → bias add → activation executed as one launch.
///
/// Inputs are `[data, weights, bias]`; the single output is the output of the
/// last fused node. Only Relu, Sigmoid, Tanh, Clamp and Elu are supported as
/// the fused activation.
#[derive(Debug)]
pub struct FusedConvolutionOp {
    name: String,
    kernel: ConvolutionKernel,
    activation: Option<Activation>,
    inputs: IndexCollection,
    outputs: IndexCollection,
}

impl FusedConvolutionOp {
    /// Build a fused convolution from the nodes of a matched chain.
    ///
    /// # Arguments
    ///
    /// * `conv` - The anchor convolution node (`[data, weights]` inputs).
    /// * `bias_add` - The `Add` consuming the convolution output.
    /// * `activation` - Optional activation consuming the `Add` output.
    /// * `inputs` - Indices of `[data, weights, bias]`.
    /// * `outputs` - Index of the chain's final output.
    pub fn create(
        ctx: &CreationContext,
        conv: &NodeView<'_>,
        bias_add: &NodeView<'_>,
        activation: Option<&NodeView<'_>>,
        inputs: IndexCollection,
        outputs: IndexCollection,
    ) -> Result<Self> {
        inputs.expect_arity(3, "FusedConvolution")?;
        outputs.expect_arity(1, "FusedConvolution")?;

        let kernel = ConvolutionKernel::new(ctx, conv)?;
        let out_shape = kernel.params.output_shape();

        let conv_output = conv.node.outputs.first().copied();
        let bias_pos = match bias_add.node.inputs.as_slice() {
            [a, _] if Some(*a) == conv_output => 1,
            [_, b] if Some(*b) == conv_output => 0,
            _ => {
                return Err(Error::UnsupportedConfiguration(format!(
                    "{}: does not add a bias to the output of {}",
                    bias_add.display_name(),
                    conv.display_name()
                )))
            }
        };
        let bias = bias_add.input(bias_pos)?;
        if bias.dtype != kernel.dtype || bias_add.output_dtype(0)? != kernel.dtype {
            return Err(Error::unsupported_type(
                bias.dtype,
                format!("fused bias of {}", conv.display_name()),
            ));
        }
        check_channel_bias(&bias.shape, &kernel.params)?;
        expect_shape(bias_add.display_name(), bias_add.output_shape(0)?, &out_shape)?;

        let mut name = format!("{}+{}", conv.display_name(), bias_add.display_name());
        let activation = match activation {
            Some(view) => {
                let activation = Activation::from_node(view)?;
                if !activation.is_fusable() {
                    return Err(Error::UnsupportedConfiguration(format!(
                        "{} cannot be fused into a convolution",
                        activation.name()
                    )));
                }
                if view.output_dtype(0)? != kernel.dtype {
                    return Err(Error::unsupported_type(
                        view.output_dtype(0)?,
                        format!("fused {}", activation.name()),
                    ));
                }
                expect_shape(view.display_name(), view.output_shape(0)?, &out_shape)?;
                name.push('+');
                name.push_str(view.display_name());
                Some(activation)
            }
            None => None,
        };

        Ok(Self {
            name,
            kernel,
            activation,
            inputs,
            outputs,
        })
    }

    /// The fused activation, if any.
    pub fn activation(&self) -> Option<Activation> {
        self.activation
    }

    /// Resolved convolution geometry.
    pub fn params(&self) -> &ConvolutionParams {
        &self.kernel.params
    }
}

/// A bias is per-channel when it reads one value per output channel and
/// broadcasts over batch and spatial dimensions.
fn check_channel_bias(shape: &[usize], params: &ConvolutionParams) -> Result<()> {
    let out_shape = params.output_shape();
    let count: usize = shape.iter().product();
    let strides = broadcast_strides(shape, &out_shape)?;
    let per_channel = count == params.out_channels
        && strides[0] == 0
        && strides[2] == 0
        && strides[3] == 0
        && (params.out_channels == 1 || strides[1] == 1);
    if !per_channel {
        return Err(Error::ShapeMismatch(format!(
            "bias shape {shape:?} is not per-channel for output {out_shape:?}"
        )));
    }
    Ok(())
}

impl Operation for FusedConvolutionOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_ids(&self) -> &IndexCollection {
        &self.inputs
    }

    fn output_ids(&self) -> &IndexCollection {
        &self.outputs
    }

    fn workbuffer_request(&self) -> WorkbufferRequest {
        self.kernel.workbuffer_request()
    }

    fn initialize_workbuffers(&self, device: &dyn Device, immutable: &[DevicePtr]) -> Result<()> {
        self.kernel.initialize(&self.name, device, immutable)
    }

    fn execute(
        &self,
        ctx: &ExecutionCtx<'_>,
        inputs: &[DevicePtr],
        outputs: &[DevicePtr],
        workbuffers: &Workbuffers,
    ) -> Result<()> {
        validate_binding(self, inputs, outputs, workbuffers)?;
        let epilogue = Epilogue {
            bias: Some(inputs[2]),
            activation: self.activation,
        };
        self.kernel.launch(
            ctx,
            "fused_convolution",
            inputs[0],
            inputs[1],
            outputs[0],
            workbuffers,
            epilogue,
        )
    }
}
