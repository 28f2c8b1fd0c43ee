//! Common test utilities for operation tests.
//!
//! Graph builders for single-node graphs, a helper that runs one operation
//! on a `HostDevice`, and a naive convolution reference.

#![allow(dead_code)]

use lumen_core::{
    AttributeValue, CreationContext, Device, DeviceProperties, ElementType, ExecutionCtx, GraphDesc,
    HostDevice, HostDeviceConfig, IndexCollection, NodeDesc, NodeView, Operation, TensorKind,
    Workbuffers,
};
use std::sync::Arc;

pub use lumen_operators::Op;

/// Creation context over a fresh host device.
pub fn host_ctx() -> CreationContext {
    CreationContext::new(Arc::new(HostDevice::new()))
}

/// Creation context over a host device reporting `compute_capability`.
pub fn host_ctx_with_capability(compute_capability: (u32, u32)) -> CreationContext {
    CreationContext::new(Arc::new(HostDevice::with_config(HostDeviceConfig {
        properties: DeviceProperties {
            compute_capability,
            ..DeviceProperties::default()
        },
        memory_limit: None,
    })))
}

/// Create a two-input, one-output graph for binary elementwise operations.
pub fn make_binary_graph(
    op_type: &str,
    dtype: ElementType,
    a_shape: &[usize],
    b_shape: &[usize],
    out_shape: &[usize],
) -> GraphDesc {
    let mut graph = GraphDesc::new(format!("test_{}", op_type.to_lowercase()));
    let a = graph.add_input("a", dtype, a_shape);
    let b = graph.add_input("b", dtype, b_shape);
    let c = graph.add_output("c", dtype, out_shape);
    graph.add_node(NodeDesc::new(op_type).named(op_type).with_io(&[a, b], &[c]));
    graph
}

/// Create a single-input, single-output graph.
pub fn make_unary_graph(
    op_type: &str,
    dtype: ElementType,
    shape: &[usize],
    attrs: &[(&str, AttributeValue)],
) -> GraphDesc {
    let mut graph = GraphDesc::new(format!("test_{}", op_type.to_lowercase()));
    let x = graph.add_input("x", dtype, shape);
    let y = graph.add_output("y", dtype, shape);
    let mut node = NodeDesc::new(op_type).with_io(&[x], &[y]);
    for (name, value) in attrs {
        node = node.with_attr(name, value.clone());
    }
    graph.add_node(node);
    graph
}

/// Where a reduction graph takes its axes from.
pub enum Axes<'a> {
    None,
    Attribute(&'a [i64]),
    Constant(&'a [i64]),
    Runtime(usize),
}

/// Create a reduction graph.
pub fn make_reduce_graph(
    op_type: &str,
    dtype: ElementType,
    input_shape: &[usize],
    output_shape: &[usize],
    axes: Axes<'_>,
    keep_dims: bool,
) -> GraphDesc {
    let mut graph = GraphDesc::new(format!("test_{}", op_type.to_lowercase()));
    let x = graph.add_input("data", dtype, input_shape);
    let mut inputs = vec![x];
    let mut node = NodeDesc::new(op_type)
        .with_attr("keep_dims", AttributeValue::Int(keep_dims as i64));
    match axes {
        Axes::None => {}
        Axes::Attribute(values) => {
            node = node.with_attr("axes", AttributeValue::Ints(values.to_vec()));
        }
        Axes::Constant(values) => {
            let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            inputs.push(graph.add_constant("axes", ElementType::I64, &[values.len()], bytes));
        }
        Axes::Runtime(len) => {
            inputs.push(graph.add_input("axes", ElementType::I64, &[len]));
        }
    }
    let y = graph.add_output("reduced", dtype, output_shape);
    graph.add_node(node.with_io(&inputs, &[y]));
    graph
}

/// Convolution geometry for `make_conv_graph`.
#[derive(Debug, Clone)]
pub struct ConvSpec {
    pub input: [usize; 4],
    pub out_channels: usize,
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    pub dilations: [usize; 2],
    pub pads_begin: [usize; 2],
    pub pads_end: [usize; 2],
}

impl ConvSpec {
    pub fn new(input: [usize; 4], out_channels: usize, kernel: [usize; 2]) -> Self {
        Self {
            input,
            out_channels,
            kernel,
            strides: [1, 1],
            dilations: [1, 1],
            pads_begin: [0, 0],
            pads_end: [0, 0],
        }
    }

    pub fn output_shape(&self) -> Vec<usize> {
        let dim = |d: usize| {
            let extent = (self.kernel[d] - 1) * self.dilations[d] + 1;
            (self.input[2 + d] + self.pads_begin[d] + self.pads_end[d] - extent) / self.strides[d]
                + 1
        };
        vec![self.input[0], self.out_channels, dim(0), dim(1)]
    }

    pub fn weight_shape(&self) -> Vec<usize> {
        vec![self.out_channels, self.input[1], self.kernel[0], self.kernel[1]]
    }

    pub fn attributes(&self) -> Vec<(&'static str, AttributeValue)> {
        let ints = |v: [usize; 2]| AttributeValue::Ints(v.iter().map(|&x| x as i64).collect());
        vec![
            ("strides", ints(self.strides)),
            ("dilations", ints(self.dilations)),
            ("pads_begin", ints(self.pads_begin)),
            ("pads_end", ints(self.pads_end)),
            ("auto_pad", AttributeValue::String("explicit".into())),
        ]
    }
}

/// Create a single convolution graph with inputs `x`, `w` and output `y`.
pub fn make_conv_graph(spec: &ConvSpec, dtype: ElementType) -> GraphDesc {
    let mut graph = GraphDesc::new("test_conv");
    let x = graph.add_input("x", dtype, &spec.input);
    let w = graph.add_input("w", dtype, &spec.weight_shape());
    let y = graph.add_output("y", dtype, &spec.output_shape());
    let mut node = NodeDesc::new("Convolution").named("conv").with_io(&[x, w], &[y]);
    for (name, value) in spec.attributes() {
        node = node.with_attr(name, value);
    }
    graph.add_node(node);
    graph
}

/// Build the operation for node `index` of `graph`.
pub fn build(ctx: &CreationContext, graph: &GraphDesc, index: usize) -> lumen_core::Result<Op> {
    let node = &graph.nodes[index];
    Op::create(
        ctx,
        &NodeView::new(node, graph),
        IndexCollection::new(&node.inputs),
        IndexCollection::new(&node.outputs),
    )
}

/// Run `op` once on the context's device.
///
/// Every tensor of `graph` gets its own allocation; graph inputs are filled
/// from `inputs` (in `graph.inputs` order) and constants from their data.
/// Returns the bytes of every graph output, or the deferred device error.
pub fn run_op(
    ctx: &CreationContext,
    graph: &GraphDesc,
    op: &Op,
    inputs: &[Vec<u8>],
) -> Result<Vec<Vec<u8>>, lumen_core::Error> {
    let device = ctx.device().as_ref();
    let mut table = Vec::new();
    for tensor in &graph.tensors {
        let ptr = device.allocate(tensor.size_bytes()?.max(1))?;
        if tensor.kind == TensorKind::Constant {
            if let Some(data) = &tensor.data {
                device.copy_to_device(ptr, data)?;
            }
        }
        table.push(ptr);
    }
    for (&id, data) in graph.inputs.iter().zip(inputs) {
        device.copy_to_device(table[id], data)?;
    }

    let request = op.workbuffer_request();
    let mut workbuffers = Workbuffers::default();
    for &size in &request.immutable {
        workbuffers.immutable.push(device.allocate(size.max(1))?);
    }
    for &size in &request.mutable {
        workbuffers.mutable.push(device.allocate(size.max(1))?);
    }
    op.initialize_workbuffers(device, &workbuffers.immutable)?;

    let bound_inputs: Vec<_> = op.input_ids().iter().map(|i| table[i.0]).collect();
    let bound_outputs: Vec<_> = op.output_ids().iter().map(|i| table[i.0]).collect();
    let exec = ExecutionCtx::new(device, ctx.stream(), 0);
    op.execute(&exec, &bound_inputs, &bound_outputs, &workbuffers)?;
    device.synchronize(ctx.stream())?;

    graph
        .outputs
        .iter()
        .map(|&id| {
            let mut bytes = vec![0u8; graph.tensors[id].size_bytes()?];
            device.copy_to_host(table[id], &mut bytes)?;
            Ok(bytes)
        })
        .collect()
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn i32_values(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn i64_bytes(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn i64_values(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().expect("8-byte chunk")))
        .collect()
}

/// Deterministic pseudo-random values in [-1, 1).
pub fn pattern(len: usize, seed: u32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state % 2000) as f32 / 1000.0 - 1.0
        })
        .collect()
}

/// Naive direct convolution used as a reference (group 1).
pub fn reference_conv(spec: &ConvSpec, x: &[f32], w: &[f32]) -> Vec<f32> {
    let [n, c, h, wd] = spec.input;
    let out = spec.output_shape();
    let (k, oh, ow) = (out[1], out[2], out[3]);
    let mut y = vec![0.0f32; n * k * oh * ow];
    for b in 0..n {
        for oc in 0..k {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = 0.0f64;
                    for ic in 0..c {
                        for ky in 0..spec.kernel[0] {
                            for kx in 0..spec.kernel[1] {
                                let iy = (oy * spec.strides[0] + ky * spec.dilations[0]) as i64
                                    - spec.pads_begin[0] as i64;
                                let ix = (ox * spec.strides[1] + kx * spec.dilations[1]) as i64
                                    - spec.pads_begin[1] as i64;
                                if iy < 0 || ix < 0 || iy >= h as i64 || ix >= wd as i64 {
                                    continue;
                                }
                                let xv = x[((b * c + ic) * h + iy as usize) * wd + ix as usize];
                                let wv = w[((oc * c + ic) * spec.kernel[0] + ky) * spec.kernel[1]
                                    + kx];
                                acc += xv as f64 * wv as f64;
                            }
                        }
                    }
                    y[((b * k + oc) * oh + oy) * ow + ox] = acc as f32;
                }
            }
        }
    }
    y
}

/// Assert that two f32 vectors are approximately equal element-wise.
pub fn assert_vec_approx_eq(actual: &[f32], expected: &[f32], epsilon: f32) {
    assert_eq!(actual.len(), expected.len(), "Vector lengths differ");
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        let diff = (a - e).abs();
        assert!(
            diff <= epsilon * e.abs().max(1.0),
            "Element {} differs: {} vs {} (diff: {})",
            i,
            a,
            e,
            diff
        );
    }
}

/// Create a convolution → bias add → optional activation chain.
///
/// Graph structure:
///   x, w -> Convolution -> conv_out
///   conv_out, bias -> Add -> add_out
///   add_out -> activation -> y        (when `activation` is given)
///
/// # Arguments
///
/// * `spec` - Convolution geometry.
/// * `bias_shape` - Shape of the constant bias operand.
/// * `bias` - Bias values (f32, converted to `dtype` when needed).
/// * `activation` - Optional activation op type.
pub fn make_conv_bias_graph(
    spec: &ConvSpec,
    dtype: ElementType,
    bias_shape: &[usize],
    bias: &[f32],
    activation: Option<&str>,
) -> GraphDesc {
    let out_shape = spec.output_shape();
    let mut graph = GraphDesc::new("test_conv_bias");
    let x = graph.add_input("x", dtype, &spec.input);
    let w = graph.add_input("w", dtype, &spec.weight_shape());
    let b = graph.add_constant("bias", dtype, bias_shape, encode(dtype, bias));
    let conv_out = graph.add_intermediate("conv_out", dtype, &out_shape);
    let add_out = match activation {
        Some(_) => graph.add_intermediate("add_out", dtype, &out_shape),
        None => graph.add_output("add_out", dtype, &out_shape),
    };

    let mut conv = NodeDesc::new("Convolution")
        .named("conv")
        .with_io(&[x, w], &[conv_out]);
    for (name, value) in spec.attributes() {
        conv = conv.with_attr(name, value);
    }
    graph.add_node(conv);
    graph.add_node(NodeDesc::new("Add").named("bias").with_io(&[conv_out, b], &[add_out]));
    if let Some(op_type) = activation {
        let y = graph.add_output("y", dtype, &out_shape);
        graph.add_node(NodeDesc::new(op_type).named("act").with_io(&[add_out], &[y]));
    }
    graph
}

/// Build the fused operation for the chain made by `make_conv_bias_graph`.
pub fn build_fused(ctx: &CreationContext, graph: &GraphDesc) -> lumen_core::Result<Op> {
    let conv = &graph.nodes[0];
    let add = &graph.nodes[1];
    let activation = graph.nodes.get(2).map(|node| NodeView::new(node, graph));
    let bias = add.inputs[1];
    let last = graph.nodes.last().unwrap_or(add);
    Op::fused_convolution(
        ctx,
        &NodeView::new(conv, graph),
        &NodeView::new(add, graph),
        activation.as_ref(),
        IndexCollection::new(&[conv.inputs[0], conv.inputs[1], bias]),
        IndexCollection::new(&last.outputs),
    )
}

/// Encode f32 values as little-endian `dtype` elements (F32 or F16).
pub fn encode(dtype: ElementType, values: &[f32]) -> Vec<u8> {
    match dtype {
        ElementType::F16 => values
            .iter()
            .flat_map(|&v| half::f16::from_f32(v).to_le_bytes())
            .collect(),
        _ => f32_bytes(values),
    }
}

/// Decode little-endian `dtype` elements (F32 or F16) to f32.
pub fn decode(dtype: ElementType, bytes: &[u8]) -> Vec<f32> {
    match dtype {
        ElementType::F16 => bytes
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        _ => f32_values(bytes),
    }
}
