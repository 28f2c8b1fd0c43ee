//! Binary elementwise operator family.
//!
//! Covers: Add, Subtract, Multiply, Divide, Maximum, Minimum, Power

use lumen_core::{
    broadcast_shape, broadcast_strides, dispatch_element_type, validate_binding, CreationContext,
    DeviceElement, DeviceError, DevicePtr, ElementType, ExecutionCtx, IndexCollection, NodeView,
    Operation, Result, Workbuffers,
};

use crate::helpers::{common_dtype, expect_shape, require_numeric, strided_offset};

/// A binary function applied element by element with broadcasting.
///
/// Float elements are widened to `f64`, combined, and narrowed back on
/// store. Integer elements use `apply_int` on exact `i128` values and wrap
/// to the element width on store.
#[derive(Debug, Clone, Copy)]
pub struct BinaryFunction {
    name: &'static str,
    apply: fn(f64, f64) -> f64,
    /// `None` reports an integer division by zero.
    apply_int: fn(i128, i128) -> Option<i128>,
}

impl BinaryFunction {
    /// Create an Add function.
    pub fn add() -> Self {
        Self {
            name: "Add",
            apply: |a, b| a + b,
            apply_int: |a, b| Some(a.wrapping_add(b)),
        }
    }

    /// Create a Subtract function.
    pub fn subtract() -> Self {
        Self {
            name: "Subtract",
            apply: |a, b| a - b,
            apply_int: |a, b| Some(a.wrapping_sub(b)),
        }
    }

    /// Create a Multiply function.
    pub fn multiply() -> Self {
        Self {
            name: "Multiply",
            apply: |a, b| a * b,
            apply_int: |a, b| Some(a.wrapping_mul(b)),
        }
    }

    /// Create a Divide function. Integer division truncates toward zero.
    pub fn divide() -> Self {
        Self {
            name: "Divide",
            apply: |a, b| a / b,
            apply_int: |a, b| a.checked_div(b),
        }
    }

    /// Create a Maximum function.
    pub fn maximum() -> Self {
        Self {
            name: "Maximum",
            apply: f64::max,
            apply_int: |a, b| Some(a.max(b)),
        }
    }

    /// Create a Minimum function.
    pub fn minimum() -> Self {
        Self {
            name: "Minimum",
            apply: f64::min,
            apply_int: |a, b| Some(a.min(b)),
        }
    }

    /// Create a Power function.
    pub fn power() -> Self {
        Self {
            name: "Power",
            apply: f64::powf,
            apply_int: integer_power,
        }
    }

    /// Look up a function by operation type.
    pub fn from_op_type(op_type: &str) -> Option<Self> {
        match op_type {
            "Add" => Some(Self::add()),
            "Subtract" | "Sub" => Some(Self::subtract()),
            "Multiply" | "Mul" => Some(Self::multiply()),
            "Divide" | "Div" => Some(Self::divide()),
            "Maximum" | "Max" => Some(Self::maximum()),
            "Minimum" | "Min" => Some(Self::minimum()),
            "Power" | "Pow" => Some(Self::power()),
            _ => None,
        }
    }

    /// Operation type name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Binary elementwise operation with NumPy-style broadcasting.
#[derive(Debug)]
pub struct BinaryElementwiseOp {
    name: String,
    function: BinaryFunction,
    dtype: ElementType,
    output_shape: Vec<usize>,
    lhs: (usize, Vec<usize>),
    rhs: (usize, Vec<usize>),
    inputs: IndexCollection,
    outputs: IndexCollection,
}

impl BinaryElementwiseOp {
    /// Build a binary operation from a node.
    pub fn create(
        ctx: &CreationContext,
        view: &NodeView<'_>,
        function: BinaryFunction,
        inputs: IndexCollection,
        outputs: IndexCollection,
    ) -> Result<Self> {
        inputs.expect_arity(2, function.name)?;
        outputs.expect_arity(1, function.name)?;

        let dtype = common_dtype(view, &[])?;
        require_numeric(ctx, dtype, function.name)?;

        let a = view.input_shape(0)?;
        let b = view.input_shape(1)?;
        let output_shape = broadcast_shape(a, b)?;
        expect_shape(view.display_name(), view.output_shape(0)?, &output_shape)?;

        Ok(Self {
            name: view.display_name().to_string(),
            function,
            dtype,
            lhs: (a.iter().product(), broadcast_strides(a, &output_shape)?),
            rhs: (b.iter().product(), broadcast_strides(b, &output_shape)?),
            output_shape,
            inputs,
            outputs,
        })
    }

    fn launch<T: DeviceElement>(
        &self,
        ctx: &ExecutionCtx<'_>,
        a: DevicePtr,
        b: DevicePtr,
        output: DevicePtr,
    ) -> Result<()> {
        let function = self.function;
        let shape = self.output_shape.clone();
        let (a_len, a_strides) = self.lhs.clone();
        let (b_len, b_strides) = self.rhs.clone();

        ctx.launch(function.name, move |mem| {
            let count: usize = shape.iter().product();
            if T::IS_INTEGER {
                let lhs = mem.read_integer::<T>(a, a_len)?;
                let rhs = mem.read_integer::<T>(b, b_len)?;
                let mut result = Vec::with_capacity(count);
                for i in 0..count {
                    let x = lhs[strided_offset(i, &shape, &a_strides)];
                    let y = rhs[strided_offset(i, &shape, &b_strides)];
                    let value = (function.apply_int)(x, y).ok_or_else(|| {
                        DeviceError::KernelFault {
                            kernel: function.name.to_string(),
                            tag: None,
                            message: format!("integer division by zero at element {i}"),
                        }
                    })?;
                    result.push(value);
                }
                mem.write_integer::<T>(output, &result)
            } else {
                let lhs = mem.read_wide::<T>(a, a_len)?;
                let rhs = mem.read_wide::<T>(b, b_len)?;
                let result: Vec<f64> = (0..count)
                    .map(|i| {
                        let x = lhs[strided_offset(i, &shape, &a_strides)];
                        let y = rhs[strided_offset(i, &shape, &b_strides)];
                        (function.apply)(x, y)
                    })
                    .collect();
                mem.write_narrow::<T>(output, &result)
            }
        })
    }
}

/// Integer power by repeated squaring, wrapping on overflow.
///
/// Negative exponents truncate `1 / base^n` toward zero, so only bases of
/// magnitude one survive and a zero base divides by zero.
fn integer_power(base: i128, exponent: i128) -> Option<i128> {
    if exponent < 0 {
        return match base {
            0 => None,
            1 => Some(1),
            -1 => Some(if exponent % 2 == 0 { 1 } else { -1 }),
            _ => Some(0),
        };
    }
    let (mut base, mut exponent, mut result) = (base, exponent, 1i128);
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exponent >>= 1;
    }
    Some(result)
}

impl Operation for BinaryElementwiseOp {
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
        dispatch_element_type!(self.dtype, self.function.name, |T| {
            self.launch::<T>(ctx, inputs[0], inputs[1], outputs[0])
        })
    }
}
