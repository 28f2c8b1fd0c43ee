//! Reduction operator family.
//!
//! Covers: ReduceMax, ReduceMin, ReduceSum, ReduceMean, ReduceProd,
//! ReduceL1, ReduceL2, ReduceLogSumExp

use lumen_core::{
    dispatch_element_type, validate_binding, CreationContext, DeviceElement, DevicePtr,
    ElementType, Error, ExecutionCtx, IndexCollection, NodeView, Operation, Result, Workbuffers,
};

use crate::helpers::{common_dtype, expect_shape, require_float, require_numeric, row_major_strides};

/// Reduction function applied over the reduced axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceFunction {
    Max,
    Min,
    Sum,
    Mean,
    Prod,
    L1,
    L2,
    LogSumExp,
}

impl ReduceFunction {
    /// Look up a reduction by operation type.
    pub fn from_op_type(op_type: &str) -> Option<Self> {
        let function = match op_type {
            "ReduceMax" => ReduceFunction::Max,
            "ReduceMin" => ReduceFunction::Min,
            "ReduceSum" => ReduceFunction::Sum,
            "ReduceMean" => ReduceFunction::Mean,
            "ReduceProd" => ReduceFunction::Prod,
            "ReduceL1" => ReduceFunction::L1,
            "ReduceL2" => ReduceFunction::L2,
            "ReduceLogSumExp" => ReduceFunction::LogSumExp,
            _ => return None,
        };
        Some(function)
    }

    /// Operation type name.
    pub fn name(self) -> &'static str {
        match self {
            ReduceFunction::Max => "ReduceMax",
            ReduceFunction::Min => "ReduceMin",
            ReduceFunction::Sum => "ReduceSum",
            ReduceFunction::Mean => "ReduceMean",
            ReduceFunction::Prod => "ReduceProd",
            ReduceFunction::L1 => "ReduceL1",
            ReduceFunction::L2 => "ReduceL2",
            ReduceFunction::LogSumExp => "ReduceLogSumExp",
        }
    }

    fn float_only(self) -> bool {
        matches!(self, ReduceFunction::L2 | ReduceFunction::LogSumExp)
    }

    fn init(self) -> Accumulator {
        let value = match self {
            ReduceFunction::Max | ReduceFunction::LogSumExp => f64::NEG_INFINITY,
            ReduceFunction::Min => f64::INFINITY,
            ReduceFunction::Prod => 1.0,
            _ => 0.0,
        };
        Accumulator {
            value,
            scale: 0.0,
            count: 0,
        }
    }

    #[inline]
    fn accumulate(self, acc: &mut Accumulator, x: f64) {
        acc.count += 1;
        match self {
            ReduceFunction::Max => acc.value = acc.value.max(x),
            ReduceFunction::Min => acc.value = acc.value.min(x),
            ReduceFunction::Sum | ReduceFunction::Mean => acc.value += x,
            ReduceFunction::Prod => acc.value *= x,
            ReduceFunction::L1 => acc.value += x.abs(),
            ReduceFunction::L2 => acc.value += x * x,
            ReduceFunction::LogSumExp => {
                // Running max in `value`, sum of exp(x - max) in `scale`.
                // exp(-inf) adds nothing, and equal infinities must not
                // meet in `x - max`.
                if x == f64::NEG_INFINITY {
                    return;
                }
                if x > acc.value {
                    acc.scale = acc.scale * (acc.value - x).exp() + 1.0;
                    acc.value = x;
                } else if x == acc.value {
                    acc.scale += 1.0;
                } else {
                    acc.scale += (x - acc.value).exp();
                }
            }
        }
    }

    /// Integer accumulation on exact values, wrapping like the element type.
    #[inline]
    fn accumulate_int(self, acc: &mut IntAccumulator, x: i128) {
        let first = acc.count == 0;
        acc.count += 1;
        acc.value = match self {
            ReduceFunction::Max if first => x,
            ReduceFunction::Max => acc.value.max(x),
            ReduceFunction::Min if first => x,
            ReduceFunction::Min => acc.value.min(x),
            ReduceFunction::Prod if first => x,
            ReduceFunction::Prod => acc.value.wrapping_mul(x),
            ReduceFunction::L1 => acc.value.wrapping_add(x.wrapping_abs()),
            _ => acc.value.wrapping_add(x),
        };
    }

    fn finish_int(self, acc: &IntAccumulator) -> i128 {
        match self {
            ReduceFunction::Prod if acc.count == 0 => 1,
            ReduceFunction::Mean if acc.count > 0 => acc.value / acc.count as i128,
            _ => acc.value,
        }
    }

    fn finish(self, acc: &Accumulator) -> f64 {
        match self {
            ReduceFunction::Mean if acc.count > 0 => acc.value / acc.count as f64,
            ReduceFunction::L2 => acc.value.sqrt(),
            ReduceFunction::LogSumExp if acc.count > 0 => acc.value + acc.scale.ln(),
            _ => acc.value,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    value: f64,
    scale: f64,
    count: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct IntAccumulator {
    value: i128,
    count: usize,
}

/// Normalise reduction axes against `rank`.
///
/// Negative axes count from the end. Axes outside `[-rank, rank)` or listed
/// twice fail with `ShapeMismatch`. The result is sorted.
pub fn normalize_axes(axes: &[i64], rank: usize) -> Result<Vec<usize>> {
    let rank_i = rank as i64;
    let mut normalized = Vec::with_capacity(axes.len());
    for &axis in axes {
        if axis < -rank_i || axis >= rank_i {
            return Err(Error::ShapeMismatch(format!(
                "Reduction axis {axis} is out of range for rank {rank}"
            )));
        }
        let axis = (if axis < 0 { axis + rank_i } else { axis }) as usize;
        if normalized.contains(&axis) {
            return Err(Error::ShapeMismatch(format!(
                "Reduction axis {axis} is listed more than once"
            )));
        }
        normalized.push(axis);
    }
    normalized.sort_unstable();
    Ok(normalized)
}

/// Output shape of a reduction over normalised `axes`.
///
/// Reduced axes are removed, or kept with extent 1 when `keep_dims` is set.
/// Reducing every axis without `keep_dims` yields the scalar shape `[]`.
pub fn reduced_shape(input: &[usize], axes: &[usize], keep_dims: bool) -> Vec<usize> {
    input
        .iter()
        .enumerate()
        .filter_map(|(i, &dim)| match (axes.contains(&i), keep_dims) {
            (false, _) => Some(dim),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect()
}

/// Reduction over a set of axes.
#[derive(Debug)]
pub struct ReductionOp {
    name: String,
    function: ReduceFunction,
    dtype: ElementType,
    input_shape: Vec<usize>,
    /// Output offset stride per input dimension (0 on reduced axes).
    output_strides: Vec<usize>,
    output_len: usize,
    axes: Vec<usize>,
    keep_dims: bool,
    inputs: IndexCollection,
    outputs: IndexCollection,
}

impl ReductionOp {
    /// Build a reduction from a node.
    ///
    /// Axes come from the `axes` attribute or from a constant second input.
    /// Missing or empty axes reduce every axis. `keep_dims` defaults to false.
    pub fn create(
        ctx: &CreationContext,
        view: &NodeView<'_>,
        function: ReduceFunction,
        inputs: IndexCollection,
        outputs: IndexCollection,
    ) -> Result<Self> {
        let name = function.name();
        inputs.expect_arity_range(1, 2, name)?;
        outputs.expect_arity(1, name)?;

        let dtype = common_dtype(view, &[1])?;
        if function.float_only() {
            require_float(ctx, dtype, name)?;
        } else {
            require_numeric(ctx, dtype, name)?;
        }

        let input_shape = view.input_shape(0)?.to_vec();
        let rank = input_shape.len();

        let raw_axes = match (view.attr_ints("axes")?, view.input_count()) {
            (Some(axes), 1) => axes.to_vec(),
            (None, 2) => view.constant_ints(1)?.ok_or_else(|| {
                Error::UnsupportedConfiguration(format!(
                    "{}: reduction axes must be a constant input",
                    view.display_name()
                ))
            })?,
            (None, _) => Vec::new(),
            (Some(_), _) => {
                return Err(Error::Attribute(format!(
                    "{}: axes given both as attribute and as input",
                    view.display_name()
                )))
            }
        };
        let axes = if raw_axes.is_empty() {
            (0..rank).collect()
        } else {
            normalize_axes(&raw_axes, rank)?
        };
        let keep_dims = view.attr_i64_or("keep_dims", 0)? != 0;

        let output_shape = reduced_shape(&input_shape, &axes, keep_dims);
        expect_shape(view.display_name(), view.output_shape(0)?, &output_shape)?;

        let kept_shape = reduced_shape(&input_shape, &axes, true);
        let output_strides = row_major_strides(&kept_shape)
            .into_iter()
            .enumerate()
            .map(|(i, stride)| if axes.contains(&i) { 0 } else { stride })
            .collect();

        tracing::trace!(op = name, ?axes, keep_dims, "built reduction");

        Ok(Self {
            name: view.display_name().to_string(),
            function,
            dtype,
            output_len: output_shape.iter().product(),
            input_shape,
            output_strides,
            axes,
            keep_dims,
            inputs,
            outputs,
        })
    }

    /// Normalised reduction axes.
    pub fn axes(&self) -> &[usize] {
        &self.axes
    }

    /// Whether reduced axes are kept with extent 1.
    pub fn keep_dims(&self) -> bool {
        self.keep_dims
    }

    fn launch<T: DeviceElement>(
        &self,
        ctx: &ExecutionCtx<'_>,
        input: DevicePtr,
        output: DevicePtr,
    ) -> Result<()> {
        let function = self.function;
        let shape = self.input_shape.clone();
        let strides = self.output_strides.clone();
        let output_len = self.output_len;

        ctx.launch(function.name(), move |mem| {
            let count: usize = shape.iter().product();
            if T::IS_INTEGER {
                let values = mem.read_integer::<T>(input, count)?;
                let mut accumulators = vec![IntAccumulator::default(); output_len];
                for (i, &x) in values.iter().enumerate() {
                    let slot = crate::helpers::strided_offset(i, &shape, &strides);
                    function.accumulate_int(&mut accumulators[slot], x);
                }
                let result: Vec<i128> =
                    accumulators.iter().map(|acc| function.finish_int(acc)).collect();
                return mem.write_integer::<T>(output, &result);
            }

            let values = mem.read_wide::<T>(input, count)?;
            let mut accumulators = vec![function.init(); output_len];
            for (i, &x) in values.iter().enumerate() {
                let slot = crate::helpers::strided_offset(i, &shape, &strides);
                function.accumulate(&mut accumulators[slot], x);
            }
            let result: Vec<f64> = accumulators.iter().map(|acc| function.finish(acc)).collect();
            mem.write_narrow::<T>(output, &result)
        })
    }
}

impl Operation for ReductionOp {
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
        dispatch_element_type!(self.dtype, self.function.name(), |T| {
            self.launch::<T>(ctx, inputs[0], outputs[0])
        })
    }
}
