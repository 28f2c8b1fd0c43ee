//! Unary elementwise operator family.
//!
//! Covers: Abs, Negative, Sqrt, Exp, Log

use lumen_core::{
    dispatch_element_type, validate_binding, CreationContext, DeviceElement, DevicePtr,
    ElementType, Error, ExecutionCtx, IndexCollection, NodeView, Operation, Result, Workbuffers,
};

use crate::helpers::{common_dtype, expect_shape, require_float, require_numeric};

/// A unary function and the element types it accepts.
///
/// All unary elementwise operations share the same kernel: load, apply,
/// store. The only differences are the function itself and whether integer
/// instantiations exist. Integer instantiations apply `apply_int` to exact
/// values and wrap on store.
#[derive(Debug, Clone, Copy)]
pub struct UnaryFunction {
    name: &'static str,
    apply: fn(f64) -> f64,
    /// `None` for float-only functions.
    apply_int: Option<fn(i128) -> i128>,
    signed_only: bool,
}

impl UnaryFunction {
    /// Create an Abs function.
    pub fn abs() -> Self {
        Self {
            name: "Abs",
            apply: f64::abs,
            apply_int: Some(i128::wrapping_abs),
            signed_only: false,
        }
    }

    /// Create a Negative function.
    pub fn negative() -> Self {
        Self {
            name: "Negative",
            apply: |x| -x,
            apply_int: Some(i128::wrapping_neg),
            signed_only: true,
        }
    }

    /// Create a Sqrt function.
    pub fn sqrt() -> Self {
        Self {
            name: "Sqrt",
            apply: f64::sqrt,
            apply_int: None,
            signed_only: false,
        }
    }

    /// Create an Exp function.
    pub fn exp() -> Self {
        Self {
            name: "Exp",
            apply: f64::exp,
            apply_int: None,
            signed_only: false,
        }
    }

    /// Create a Log function.
    pub fn log() -> Self {
        Self {
            name: "Log",
            apply: f64::ln,
            apply_int: None,
            signed_only: false,
        }
    }

    /// Look up a function by operation type.
    pub fn from_op_type(op_type: &str) -> Option<Self> {
        match op_type {
            "Abs" => Some(Self::abs()),
            "Negative" | "Neg" => Some(Self::negative()),
            "Sqrt" => Some(Self::sqrt()),
            "Exp" => Some(Self::exp()),
            "Log" => Some(Self::log()),
            _ => None,
        }
    }

    /// Operation type name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Unary elementwise operation.
#[derive(Debug)]
pub struct UnaryElementwiseOp {
    name: String,
    function: UnaryFunction,
    dtype: ElementType,
    num_elements: usize,
    inputs: IndexCollection,
    outputs: IndexCollection,
}

impl UnaryElementwiseOp {
    /// Build a unary operation from a node.
    pub fn create(
        ctx: &CreationContext,
        view: &NodeView<'_>,
        function: UnaryFunction,
        inputs: IndexCollection,
        outputs: IndexCollection,
    ) -> Result<Self> {
        inputs.expect_arity(1, function.name)?;
        outputs.expect_arity(1, function.name)?;

        let dtype = common_dtype(view, &[])?;
        if function.apply_int.is_none() {
            require_float(ctx, dtype, function.name)?;
        } else {
            require_numeric(ctx, dtype, function.name)?;
        }
        if function.signed_only && !dtype.is_signed() {
            return Err(Error::unsupported_type(dtype, function.name));
        }

        let shape = view.input_shape(0)?;
        expect_shape(view.display_name(), view.output_shape(0)?, shape)?;

        Ok(Self {
            name: view.display_name().to_string(),
            function,
            dtype,
            num_elements: shape.iter().product(),
            inputs,
            outputs,
        })
    }

    fn launch<T: DeviceElement>(
        &self,
        ctx: &ExecutionCtx<'_>,
        input: DevicePtr,
        output: DevicePtr,
    ) -> Result<()> {
        let UnaryFunction { apply, apply_int, .. } = self.function;
        let count = self.num_elements;
        ctx.launch(self.function.name, move |mem| {
            if let (true, Some(apply_int)) = (T::IS_INTEGER, apply_int) {
                let values: Vec<i128> = mem
                    .read_integer::<T>(input, count)?
                    .into_iter()
                    .map(apply_int)
                    .collect();
                return mem.write_integer::<T>(output, &values);
            }
            let values: Vec<f64> = mem
                .read_wide::<T>(input, count)?
                .into_iter()
                .map(apply)
                .collect();
            mem.write_narrow::<T>(output, &values)
        })
    }
}

impl Operation for UnaryElementwiseOp {
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
            self.launch::<T>(ctx, inputs[0], outputs[0])
        })
    }
}
