//! Activation operator family.
//!
//! Covers: Relu, LeakyRelu, Sigmoid, Tanh, Clamp, Elu, Gelu, Swish

use lumen_core::{
    dispatch_element_type, validate_binding, CreationContext, DeviceElement, DevicePtr,
    ElementType, Error, ExecutionCtx, IndexCollection, NodeView, Operation, Result, Workbuffers,
};

use crate::helpers::{common_dtype, erf, expect_shape, require_float};

/// Activation function with its parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Relu,
    LeakyRelu { alpha: f64 },
    Sigmoid,
    Tanh,
    Clamp { min: f64, max: f64 },
    Elu { alpha: f64 },
    Gelu { tanh_approximation: bool },
    Swish { beta: f64 },
}

impl Activation {
    /// Operation types handled by this family.
    pub const OP_TYPES: [&'static str; 8] = [
        "Relu",
        "LeakyRelu",
        "Sigmoid",
        "Tanh",
        "Clamp",
        "Elu",
        "Gelu",
        "Swish",
    ];

    /// Check if `op_type` names an activation.
    pub fn is_activation(op_type: &str) -> bool {
        Self::OP_TYPES.contains(&op_type)
    }

    /// Read the activation and its attributes from a node.
    pub fn from_node(view: &NodeView<'_>) -> Result<Self> {
        let activation = match view.op_type() {
            "Relu" => Activation::Relu,
            "LeakyRelu" => Activation::LeakyRelu {
                alpha: view.attr_f32_or("alpha", 0.01)? as f64,
            },
            "Sigmoid" => Activation::Sigmoid,
            "Tanh" => Activation::Tanh,
            "Clamp" => {
                let min = view.attr_f32_or("min", f32::NEG_INFINITY)? as f64;
                let max = view.attr_f32_or("max", f32::INFINITY)? as f64;
                if min.is_nan() || max.is_nan() {
                    return Err(Error::Attribute(format!(
                        "{}: clamp bounds must not be NaN (min {min}, max {max})",
                        view.display_name()
                    )));
                }
                if min > max {
                    return Err(Error::Attribute(format!(
                        "{}: clamp min {min} exceeds max {max}",
                        view.display_name()
                    )));
                }
                Activation::Clamp { min, max }
            }
            "Elu" => Activation::Elu {
                alpha: view.attr_f32_or("alpha", 1.0)? as f64,
            },
            "Gelu" => {
                let mode = view.attr_string_or("approximation", "erf")?;
                let tanh_approximation = match mode {
                    "erf" | "none" => false,
                    "tanh" => true,
                    other => {
                        return Err(Error::UnsupportedConfiguration(format!(
                            "{}: unknown Gelu approximation '{other}'",
                            view.display_name()
                        )))
                    }
                };
                Activation::Gelu { tanh_approximation }
            }
            "Swish" => Activation::Swish {
                beta: view.attr_f32_or("beta", 1.0)? as f64,
            },
            other => {
                return Err(Error::UnsupportedConfiguration(format!(
                    "'{other}' is not an activation"
                )))
            }
        };
        Ok(activation)
    }

    /// Operation type name.
    pub fn name(&self) -> &'static str {
        match self {
            Activation::Relu => "Relu",
            Activation::LeakyRelu { .. } => "LeakyRelu",
            Activation::Sigmoid => "Sigmoid",
            Activation::Tanh => "Tanh",
            Activation::Clamp { .. } => "Clamp",
            Activation::Elu { .. } => "Elu",
            Activation::Gelu { .. } => "Gelu",
            Activation::Swish { .. } => "Swish",
        }
    }

    /// Whether a fused convolution epilogue implements this activation.
    pub fn is_fusable(&self) -> bool {
        matches!(
            self,
            Activation::Relu
                | Activation::Sigmoid
                | Activation::Tanh
                | Activation::Clamp { .. }
                | Activation::Elu { .. }
        )
    }

    /// Apply the activation to one value.
    #[inline]
    pub fn apply(&self, x: f64) -> f64 {
        match *self {
            Activation::Relu => x.max(0.0),
            Activation::LeakyRelu { alpha } => {
                if x >= 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            Activation::Sigmoid => sigmoid(x),
            Activation::Tanh => x.tanh(),
            Activation::Clamp { min, max } => x.clamp(min, max),
            Activation::Elu { alpha } => {
                if x >= 0.0 {
                    x
                } else {
                    alpha * x.exp_m1()
                }
            }
            Activation::Gelu { tanh_approximation } => {
                if tanh_approximation {
                    const SQRT_2_OVER_PI: f64 = 0.797_884_560_802_865_4;
                    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
                } else {
                    0.5 * x * (1.0 + erf(x / std::f64::consts::SQRT_2))
                }
            }
            Activation::Swish { beta } => x * sigmoid(beta * x),
        }
    }
}

#[inline]
fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Standalone activation operation (float types only).
#[derive(Debug)]
pub struct ActivationOp {
    name: String,
    activation: Activation,
    dtype: ElementType,
    num_elements: usize,
    inputs: IndexCollection,
    outputs: IndexCollection,
}

impl ActivationOp {
    /// Build an activation operation from a node.
    pub fn create(
        ctx: &CreationContext,
        view: &NodeView<'_>,
        inputs: IndexCollection,
        outputs: IndexCollection,
    ) -> Result<Self> {
        let activation = Activation::from_node(view)?;
        inputs.expect_arity(1, activation.name())?;
        outputs.expect_arity(1, activation.name())?;

        let dtype = common_dtype(view, &[])?;
        require_float(ctx, dtype, activation.name())?;

        let shape = view.input_shape(0)?;
        expect_shape(view.display_name(), view.output_shape(0)?, shape)?;

        Ok(Self {
            name: view.display_name().to_string(),
            activation,
            dtype,
            num_elements: shape.iter().product(),
            inputs,
            outputs,
        })
    }

    /// The activation function.
    pub fn activation(&self) -> Activation {
        self.activation
    }

    fn launch<T: DeviceElement>(
        &self,
        ctx: &ExecutionCtx<'_>,
        input: DevicePtr,
        output: DevicePtr,
    ) -> Result<()> {
        let activation = self.activation;
        let count = self.num_elements;
        ctx.launch(activation.name(), move |mem| {
            let mut values = mem.read_wide::<T>(input, count)?;
            for v in &mut values {
                *v = activation.apply(*v);
            }
            mem.write_narrow::<T>(output, &values)
        })
    }
}

impl Operation for ActivationOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_ids(&self) -> &IndexCollection {
        &self.inputs
    }

    fn output_ids(&self) -> &IndexCollection {
        &self.outputs
    }

    fn execute(
        &self,
        ctx: &ExecutionCtx<'_>,
        inputs: &[DevicePtr],
        outputs: &[DevicePtr],
        workbuffers: &Workbuffers,
    ) -> Result<()> {
        validate_binding(self, inputs, outputs, workbuffers)?;
        dispatch_element_type!(self.dtype, self.activation.name(), |T| {
            self.launch::<T>(ctx, inputs[0], outputs[0])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_values() {
        assert_eq!(Activation::Relu.apply(-2.0), 0.0);
        assert_eq!(Activation::Relu.apply(3.0), 3.0);
        assert_eq!(Activation::LeakyRelu { alpha: 0.1 }.apply(-2.0), -0.2);
        assert!((Activation::Sigmoid.apply(0.0) - 0.5).abs() < 1e-12);
        assert_eq!(
            Activation::Clamp {
                min: -1.0,
                max: 1.0
            }
            .apply(4.0),
            1.0
        );
        assert!((Activation::Elu { alpha: 1.0 }.apply(-1.0) - (-0.632_120_558)).abs() < 1e-8);
        let gelu = Activation::Gelu {
            tanh_approximation: false,
        };
        assert!((gelu.apply(1.0) - 0.841_344_7).abs() < 1e-6);
        assert!((Activation::Swish { beta: 1.0 }.apply(1.0) - 0.731_058_6).abs() < 1e-6);
    }

    #[test]
    fn test_fusable_subset() {
        assert!(Activation::Relu.is_fusable());
        assert!(Activation::Elu { alpha: 1.0 }.is_fusable());
        assert!(!Activation::Gelu {
            tanh_approximation: true
        }
        .is_fusable());
        assert!(!Activation::Swish { beta: 1.0 }.is_fusable());
        assert!(!Activation::LeakyRelu { alpha: 0.1 }.is_fusable());
    }

    #[test]
    fn test_is_activation() {
        assert!(Activation::is_activation("Tanh"));
        assert!(!Activation::is_activation("Add"));
    }
}
