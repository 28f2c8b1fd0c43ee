//! 2-D convolution (NCHW) via im2col and GEMM.
//!
//! The gather table mapping every column-matrix cell to an input offset is
//! shape-only, so it lives in an immutable workbuffer populated once. The
//! column matrix itself is rebuilt on every launch in a mutable workbuffer.

use lumen_core::{
    dispatch_element_type, validate_binding, CreationContext, Device, DeviceElement, DevicePtr,
    ElementType, Error, ExecutionCtx, IndexCollection, NodeView, Operation, Result,
    WorkbufferRequest, Workbuffers,
};

use crate::families::Activation;
use crate::helpers::{common_dtype, expect_shape, require_float};

/// Padding mode of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoPad {
    /// Use `pads_begin` / `pads_end` as given.
    Explicit,
    /// No padding.
    Valid,
    /// Pad so that `out = ceil(in / stride)`, extra padding at the end.
    SameUpper,
    /// Pad so that `out = ceil(in / stride)`, extra padding at the beginning.
    SameLower,
}

impl AutoPad {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "explicit" | "notset" => Ok(AutoPad::Explicit),
            "valid" => Ok(AutoPad::Valid),
            "same_upper" => Ok(AutoPad::SameUpper),
            "same_lower" => Ok(AutoPad::SameLower),
            other => Err(Error::UnsupportedConfiguration(format!(
                "Unknown auto_pad mode '{other}'"
            ))),
        }
    }
}

/// Resolved geometry of a 2-D convolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvolutionParams {
    pub batch: usize,
    pub in_channels: usize,
    pub in_size: [usize; 2],
    pub out_channels: usize,
    pub kernel: [usize; 2],
    pub out_size: [usize; 2],
    pub strides: [usize; 2],
    pub dilations: [usize; 2],
    pub pads_begin: [usize; 2],
    pub pads_end: [usize; 2],
    pub group: usize,
}

fn pair(view: &NodeView<'_>, name: &str, default: usize, min: i64) -> Result<[usize; 2]> {
    let Some(values) = view.attr_ints(name)? else {
        return Ok([default, default]);
    };
    if values.len() != 2 {
        return Err(Error::ShapeMismatch(format!(
            "{}: '{name}' must have 2 values for a 2-D convolution, got {values:?}",
            view.display_name()
        )));
    }
    if values.iter().any(|&v| v < min) {
        return Err(Error::Attribute(format!(
            "{}: '{name}' values must be >= {min}, got {values:?}",
            view.display_name()
        )));
    }
    Ok([values[0] as usize, values[1] as usize])
}

impl ConvolutionParams {
    /// Resolve convolution geometry from a node with inputs `[data, weights, ..]`.
    ///
    /// Checks ranks, channel/group divisibility, that the dilated kernel fits
    /// the padded input, and that the declared output shape matches.
    pub fn from_node(view: &NodeView<'_>) -> Result<Self> {
        let name = view.display_name();
        let input = view.input_shape(0)?;
        let weights = view.input_shape(1)?;
        if input.len() != 4 || weights.len() != 4 {
            return Err(Error::ShapeMismatch(format!(
                "{name}: expected 4-D data and weights, got {input:?} and {weights:?}"
            )));
        }

        let group = view.attr_i64_or("group", 1)?;
        if group < 1 {
            return Err(Error::Attribute(format!("{name}: group must be >= 1")));
        }
        let group = group as usize;

        let (batch, in_channels) = (input[0], input[1]);
        let out_channels = weights[0];
        if in_channels % group != 0 || out_channels % group != 0 {
            return Err(Error::ShapeMismatch(format!(
                "{name}: channels ({in_channels} in, {out_channels} out) not divisible by group {group}"
            )));
        }
        if weights[1] != in_channels / group {
            return Err(Error::ShapeMismatch(format!(
                "{name}: weights expect {} input channels per group, data has {}",
                weights[1],
                in_channels / group
            )));
        }

        let strides = pair(view, "strides", 1, 1)?;
        let dilations = pair(view, "dilations", 1, 1)?;
        let auto_pad = AutoPad::parse(view.attr_string_or("auto_pad", "explicit")?)?;
        let mut pads_begin = pair(view, "pads_begin", 0, 0)?;
        let mut pads_end = pair(view, "pads_end", 0, 0)?;

        let in_size = [input[2], input[3]];
        let kernel = [weights[2], weights[3]];
        let mut out_size = [0; 2];
        for d in 0..2 {
            let extent = (kernel[d].max(1) - 1) * dilations[d] + 1;
            match auto_pad {
                AutoPad::Explicit => {}
                AutoPad::Valid => {
                    pads_begin[d] = 0;
                    pads_end[d] = 0;
                }
                AutoPad::SameUpper | AutoPad::SameLower => {
                    let out = in_size[d].div_ceil(strides[d]);
                    let total = ((out.max(1) - 1) * strides[d] + extent).saturating_sub(in_size[d]);
                    let small = total / 2;
                    let (begin, end) = if auto_pad == AutoPad::SameUpper {
                        (small, total - small)
                    } else {
                        (total - small, small)
                    };
                    pads_begin[d] = begin;
                    pads_end[d] = end;
                }
            }
            let padded = in_size[d] + pads_begin[d] + pads_end[d];
            if kernel[d] == 0 || padded < extent {
                return Err(Error::ShapeMismatch(format!(
                    "{name}: dilated kernel extent {extent} exceeds padded input {padded} in spatial dim {d}"
                )));
            }
            out_size[d] = (padded - extent) / strides[d] + 1;
        }

        let params = Self {
            batch,
            in_channels,
            in_size,
            out_channels,
            kernel,
            out_size,
            strides,
            dilations,
            pads_begin,
            pads_end,
            group,
        };
        expect_shape(name, view.output_shape(0)?, &params.output_shape())?;

        if params.group_in_channels() * in_size[0] * in_size[1] > i32::MAX as usize {
            return Err(Error::UnsupportedConfiguration(format!(
                "{name}: input image too large for 32-bit gather offsets"
            )));
        }
        Ok(params)
    }

    /// Output shape `[N, K, OH, OW]`.
    pub fn output_shape(&self) -> Vec<usize> {
        vec![
            self.batch,
            self.out_channels,
            self.out_size[0],
            self.out_size[1],
        ]
    }

    pub fn group_in_channels(&self) -> usize {
        self.in_channels / self.group
    }

    pub fn group_out_channels(&self) -> usize {
        self.out_channels / self.group
    }

    /// Rows of the column matrix: input channels per group times kernel area.
    pub fn column_rows(&self) -> usize {
        self.group_in_channels() * self.kernel[0] * self.kernel[1]
    }

    /// Columns of the column matrix: output pixels.
    pub fn column_cols(&self) -> usize {
        self.out_size[0] * self.out_size[1]
    }

    /// im2col gather table, row-major `[rows, cols]`.
    ///
    /// Each entry is an element offset into one group's input channels, or
    /// -1 where the kernel tap falls on padding.
    pub fn gather_offsets(&self) -> Vec<i32> {
        let [h, w] = self.in_size;
        let [kh, kw] = self.kernel;
        let [oh, ow] = self.out_size;
        let mut offsets = Vec::with_capacity(self.column_rows() * self.column_cols());

        for c in 0..self.group_in_channels() {
            for ky in 0..kh {
                for kx in 0..kw {
                    for oy in 0..oh {
                        let iy = (oy * self.strides[0] + ky * self.dilations[0]) as i64
                            - self.pads_begin[0] as i64;
                        for ox in 0..ow {
                            let ix = (ox * self.strides[1] + kx * self.dilations[1]) as i64
                                - self.pads_begin[1] as i64;
                            let inside = (0..h as i64).contains(&iy) && (0..w as i64).contains(&ix);
                            offsets.push(if inside {
                                (c * h * w) as i32 + (iy as i32) * w as i32 + ix as i32
                            } else {
                                -1
                            });
                        }
                    }
                }
            }
        }
        offsets
    }
}

/// Per-channel work applied to each accumulated output value.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Epilogue {
    pub bias: Option<DevicePtr>,
    pub activation: Option<Activation>,
}

impl Epilogue {
    /// Final value for an accumulator, rounding to `T` between stages.
    #[inline]
    fn finish<T: DeviceElement>(&self, acc: f64, bias: Option<f64>) -> f64 {
        let round = |v: f64| T::from_f64(v).to_f64();
        let mut value = acc;
        if let Some(bias) = bias {
            value = round(value) + bias;
        }
        if let Some(activation) = self.activation {
            value = activation.apply(round(value));
        }
        value
    }
}

/// Convolution kernel shared by the plain and fused operations.
#[derive(Debug, Clone)]
pub(crate) struct ConvolutionKernel {
    pub params: ConvolutionParams,
    pub dtype: ElementType,
    request: WorkbufferRequest,
}

impl ConvolutionKernel {
    /// Validate types and geometry for a node with inputs `[data, weights, ..]`.
    pub fn new(ctx: &CreationContext, view: &NodeView<'_>) -> Result<Self> {
        let dtype = common_dtype(view, &[])?;
        require_float(ctx, dtype, "Convolution")?;
        let params = ConvolutionParams::from_node(view)?;

        let cells = params.column_rows() * params.column_cols();
        let request = WorkbufferRequest::none()
            .with_immutable(cells * std::mem::size_of::<i32>())
            .with_mutable(cells * dtype.size()?);
        Ok(Self {
            params,
            dtype,
            request,
        })
    }

    pub fn workbuffer_request(&self) -> WorkbufferRequest {
        self.request.clone()
    }

    pub fn initialize(&self, name: &str, device: &dyn Device, immutable: &[DevicePtr]) -> Result<()> {
        let [table] = immutable else {
            return Err(Error::InitializationFailure(format!(
                "{name}: expected 1 immutable workbuffer, got {}",
                immutable.len()
            )));
        };
        let bytes: Vec<u8> = self
            .params
            .gather_offsets()
            .iter()
            .flat_map(|offset| offset.to_le_bytes())
            .collect();
        device
            .copy_to_device(*table, &bytes)
            .map_err(|e| Error::InitializationFailure(format!("{name}: {e}")))
    }

    pub fn launch(
        &self,
        ctx: &ExecutionCtx<'_>,
        name: &'static str,
        input: DevicePtr,
        weights: DevicePtr,
        output: DevicePtr,
        workbuffers: &Workbuffers,
        epilogue: Epilogue,
    ) -> Result<()> {
        let (table, column) = (workbuffers.immutable[0], workbuffers.mutable[0]);
        dispatch_element_type!(self.dtype, name, |T| {
            self.launch_typed::<T>(ctx, name, [input, weights, output, table, column], epilogue)
        })
    }

    fn launch_typed<T: DeviceElement>(
        &self,
        ctx: &ExecutionCtx<'_>,
        name: &'static str,
        [input, weights, output, table, column_ptr]: [DevicePtr; 5],
        epilogue: Epilogue,
    ) -> Result<()> {
        let p = self.params.clone();
        ctx.launch(name, move |mem| {
            let (rows, cols) = (p.column_rows(), p.column_cols());
            let (cg, kg) = (p.group_in_channels(), p.group_out_channels());
            let plane = p.in_size[0] * p.in_size[1];
            let image_len = p.in_channels * plane;

            let offsets = mem.read::<i32>(table, rows * cols)?;
            let weights = mem.read_wide::<T>(weights, p.out_channels * rows)?;
            let bias = match epilogue.bias {
                Some(ptr) => Some(mem.read_wide::<T>(ptr, p.out_channels)?),
                None => None,
            };

            let mut result = Vec::with_capacity(p.batch * p.out_channels * cols);
            for n in 0..p.batch {
                let image = mem.read_wide::<T>(
                    input.add(n * image_len * std::mem::size_of::<T>()),
                    image_len,
                )?;
                for g in 0..p.group {
                    let channels = &image[g * cg * plane..(g + 1) * cg * plane];
                    let gathered: Vec<f64> = offsets
                        .iter()
                        .map(|&o| if o < 0 { 0.0 } else { channels[o as usize] })
                        .collect();
                    mem.write_narrow::<T>(column_ptr, &gathered)?;
                    let column = mem.read_wide::<T>(column_ptr, rows * cols)?;

                    for k in 0..kg {
                        let oc = g * kg + k;
                        let mut acc = vec![0.0f64; cols];
                        for (r, &w) in weights[oc * rows..(oc + 1) * rows].iter().enumerate() {
                            let row = &column[r * cols..(r + 1) * cols];
                            for (a, &x) in acc.iter_mut().zip(row) {
                                *a += w * x;
                            }
                        }
                        let channel_bias = bias.as_ref().map(|b| b[oc]);
                        result.extend(acc.into_iter().map(|a| epilogue.finish::<T>(a, channel_bias)));
                    }
                }
            }
            mem.write_narrow::<T>(output, &result)
        })
    }
}

/// Plain 2-D convolution.
#[derive(Debug)]
pub struct ConvolutionOp {
    name: String,
    kernel: ConvolutionKernel,
    inputs: IndexCollection,
    outputs: IndexCollection,
}

impl ConvolutionOp {
    /// Build a convolution from a node with inputs `[data, weights]`.
    pub fn create(
        ctx: &CreationContext,
        view: &NodeView<'_>,
        inputs: IndexCollection,
        outputs: IndexCollection,
    ) -> Result<Self> {
        inputs.expect_arity(2, "Convolution")?;
        outputs.expect_arity(1, "Convolution")?;
        let kernel = ConvolutionKernel::new(ctx, view)?;
        tracing::trace!(op = view.display_name(), params = ?kernel.params, "built convolution");
        Ok(Self {
            name: view.display_name().to_string(),
            kernel,
            inputs,
            outputs,
        })
    }

    /// Resolved geometry.
    pub fn params(&self) -> &ConvolutionParams {
        &self.kernel.params
    }
}

impl Operation for ConvolutionOp {
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
        self.kernel.launch(
            ctx,
            "convolution",
            inputs[0],
            inputs[1],
            outputs[0],
            workbuffers,
            Epilogue::default(),
        )
    }
}
