//! Common test utilities for runtime tests.

#![allow(dead_code)]

use lumen_core::{
    AttributeValue, Device, DeviceProperties, ElementType, GraphDesc, HostDevice,
    HostDeviceConfig, NodeDesc, TensorId,
};
use lumen_runtime::Tensor;
use std::sync::Arc;

/// Install a test subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Host device reporting the given compute capability.
pub fn host_device_with_capability(compute_capability: (u32, u32)) -> Arc<dyn Device> {
    Arc::new(HostDevice::with_config(HostDeviceConfig {
        properties: DeviceProperties {
            compute_capability,
            ..DeviceProperties::default()
        },
        memory_limit: None,
    }))
}

/// Convolution geometry.
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

    pub fn output_shape(&self) -> [usize; 4] {
        let dim = |d: usize| {
            let extent = (self.kernel[d] - 1) * self.dilations[d] + 1;
            (self.input[2 + d] + self.pads_begin[d] + self.pads_end[d] - extent) / self.strides[d]
                + 1
        };
        [self.input[0], self.out_channels, dim(0), dim(1)]
    }

    pub fn weight_shape(&self) -> [usize; 4] {
        [self.out_channels, self.input[1], self.kernel[0], self.kernel[1]]
    }

    fn ints(values: [usize; 2]) -> AttributeValue {
        AttributeValue::Ints(values.iter().map(|&v| v as i64).collect())
    }
}

/// Weights and bias of a conv chain, as f32 values.
#[derive(Debug, Clone)]
pub struct ConvParams {
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

impl ConvParams {
    pub fn generate(spec: &ConvSpec, seed: u32) -> Self {
        let weight_len = spec.weight_shape().iter().product();
        Self {
            weights: pattern(weight_len, seed),
            bias: pattern(spec.out_channels, seed + 1),
        }
    }
}

/// Create a convolution → bias → optional activation graph with constant
/// weights and bias.
///
/// Graph structure:
///   x -> Convolution(weight) -> conv.out
///   conv.out, bias [1, K, 1, 1] -> Add -> add.out
///   add.out -> `activation` -> y        (or add.out is the output)
pub fn make_conv_chain(
    spec: &ConvSpec,
    dtype: ElementType,
    params: &ConvParams,
    activation: Option<&str>,
) -> GraphDesc {
    let mut graph = GraphDesc::new("conv_chain");
    let out_shape = spec.output_shape();
    let x = graph.add_input("x", dtype, &spec.input);
    let w = graph.add_constant(
        "conv.weight",
        dtype,
        &spec.weight_shape(),
        encode(dtype, &params.weights),
    );
    let b = graph.add_constant(
        "bias",
        dtype,
        &[1, spec.out_channels, 1, 1],
        encode(dtype, &params.bias),
    );
    let c = graph.add_intermediate("conv.out", dtype, &out_shape);
    graph.add_node(
        NodeDesc::new("Convolution")
            .named("conv")
            .with_attr("strides", ConvSpec::ints(spec.strides))
            .with_attr("dilations", ConvSpec::ints(spec.dilations))
            .with_attr("pads_begin", ConvSpec::ints(spec.pads_begin))
            .with_attr("pads_end", ConvSpec::ints(spec.pads_end))
            .with_io(&[x, w], &[c]),
    );

    let a = match activation {
        Some(_) => graph.add_intermediate("add.out", dtype, &out_shape),
        None => graph.add_output("add.out", dtype, &out_shape),
    };
    graph.add_node(NodeDesc::new("Add").named("add").with_io(&[c, b], &[a]));

    if let Some(op_type) = activation {
        let y = graph.add_output("y", dtype, &out_shape);
        graph.add_node(NodeDesc::new(op_type).named("act").with_io(&[a], &[y]));
    }
    graph
}

/// Create an integer graph whose second operation divides.
///
/// Graph structure:
///   x -> Abs -> abs.out
///   abs.out, d -> Div -> y
pub fn make_divide_graph(len: usize) -> GraphDesc {
    let mut graph = GraphDesc::new("divide");
    let x = graph.add_input("x", ElementType::I32, &[len]);
    let d = graph.add_input("d", ElementType::I32, &[len]);
    let a = graph.add_intermediate("abs.out", ElementType::I32, &[len]);
    let y = graph.add_output("y", ElementType::I32, &[len]);
    graph.add_node(NodeDesc::new("Abs").with_io(&[x], &[a]));
    graph.add_node(NodeDesc::new("Div").with_io(&[a, d], &[y]));
    graph
}

/// Create two independent convolution chains with separate inputs.
///
/// Graph structure:
///   x0 -> Convolution -> Add(bias0) -> Relu -> y0
///   x1 -> Convolution -> Add(bias1) -> Sigmoid -> y1
///   y0, y1 -> Add -> sum          (joins the branches)
pub fn make_two_branch_graph(spec: &ConvSpec) -> GraphDesc {
    let mut graph = GraphDesc::new("two_branch");
    let out_shape = spec.output_shape();
    let mut branch_outputs: Vec<TensorId> = Vec::new();

    for (i, activation) in ["Relu", "Sigmoid"].into_iter().enumerate() {
        let params = ConvParams::generate(spec, 10 + i as u32);
        let x = graph.add_input(&format!("x{i}"), ElementType::F32, &spec.input);
        let w = graph.add_constant(
            &format!("conv{i}.weight"),
            ElementType::F32,
            &spec.weight_shape(),
            f32_bytes(&params.weights),
        );
        let b = graph.add_constant(
            &format!("bias{i}"),
            ElementType::F32,
            &[1, spec.out_channels, 1, 1],
            f32_bytes(&params.bias),
        );
        let c = graph.add_intermediate(&format!("conv{i}.out"), ElementType::F32, &out_shape);
        let a = graph.add_intermediate(&format!("add{i}.out"), ElementType::F32, &out_shape);
        let y = graph.add_output(&format!("y{i}"), ElementType::F32, &out_shape);
        graph.add_node(NodeDesc::new("Convolution").with_io(&[x, w], &[c]));
        graph.add_node(NodeDesc::new("Add").with_io(&[c, b], &[a]));
        graph.add_node(NodeDesc::new(activation).with_io(&[a], &[y]));
        branch_outputs.push(y);
    }

    let sum = graph.add_output("sum", ElementType::F32, &out_shape);
    graph.add_node(NodeDesc::new("Add").named("join").with_io(&branch_outputs, &[sum]));
    graph
}

/// Naive direct convolution with bias and optional activation.
///
/// Intermediate values are rounded to `dtype` after the convolution and
/// after the bias add, like a graph that runs each stage separately.
pub fn reference_conv_chain(
    spec: &ConvSpec,
    dtype: ElementType,
    x: &[f32],
    params: &ConvParams,
    activation: Option<&str>,
) -> Vec<f32> {
    let round = |v: f64| match dtype {
        ElementType::F16 => half::f16::from_f64(v).to_f64(),
        _ => v as f32 as f64,
    };
    let [n, c, h, wd] = spec.input;
    let [_, k, oh, ow] = spec.output_shape();
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
                                let wv = params.weights
                                    [((oc * c + ic) * spec.kernel[0] + ky) * spec.kernel[1] + kx];
                                acc += xv as f64 * wv as f64;
                            }
                        }
                    }
                    let value = round(round(acc) + params.bias[oc] as f64);
                    let value = match activation {
                        Some("Relu") => value.max(0.0),
                        Some("Sigmoid") => 1.0 / (1.0 + (-value).exp()),
                        _ => value,
                    };
                    y[((b * k + oc) * oh + oy) * ow + ox] = value as f32;
                }
            }
        }
    }
    y
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

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
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

/// Host tensor of `dtype` holding `values`.
pub fn tensor(dtype: ElementType, values: &[f32], shape: &[usize]) -> Tensor {
    match dtype {
        ElementType::F16 => Tensor::from_vec(
            values.iter().map(|&v| half::f16::from_f32(v)).collect(),
            shape,
        ),
        _ => Tensor::from_vec(values.to_vec(), shape),
    }
    .expect("tensor construction")
}

/// Tensor contents as f32 values.
pub fn values(tensor: &Tensor) -> Vec<f32> {
    match tensor.dtype() {
        ElementType::F16 => tensor
            .to_vec::<half::f16>()
            .expect("f16 tensor")
            .into_iter()
            .map(half::f16::to_f32)
            .collect(),
        _ => tensor.to_vec::<f32>().expect("f32 tensor"),
    }
}

/// Assert element-wise closeness with tolerance `epsilon * max(1, |expected|)`.
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
