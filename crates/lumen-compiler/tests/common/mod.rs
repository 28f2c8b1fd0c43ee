//! Common test utilities for compiler tests.

#![allow(dead_code)]

use lumen_core::{
    AttributeValue, CreationContext, ElementType, GraphDesc, HostDevice, NodeDesc, TensorId,
};
use std::sync::Arc;

/// Install a test subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Creation context over a fresh host device.
pub fn host_ctx() -> CreationContext {
    CreationContext::new(Arc::new(HostDevice::new()))
}

fn f32_bytes(values: impl IntoIterator<Item = f32>) -> Vec<u8> {
    values.into_iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Convolution output spatial size for stride 1, no padding.
fn conv_out(input: usize, kernel: usize) -> usize {
    input - kernel + 1
}

/// Add a 3x3 convolution node reading `x` and return its output tensor.
pub fn add_conv(
    graph: &mut GraphDesc,
    name: &str,
    x: TensorId,
    in_shape: [usize; 4],
    out_channels: usize,
) -> (TensorId, [usize; 4]) {
    let out_shape = [
        in_shape[0],
        out_channels,
        conv_out(in_shape[2], 3),
        conv_out(in_shape[3], 3),
    ];
    let count = out_channels * in_shape[1] * 9;
    let w = graph.add_constant(
        &format!("{name}.weight"),
        ElementType::F32,
        &[out_channels, in_shape[1], 3, 3],
        f32_bytes((0..count).map(|i| (i % 7) as f32 * 0.1 - 0.3)),
    );
    let y = graph.add_intermediate(&format!("{name}.out"), ElementType::F32, &out_shape);
    graph.add_node(
        NodeDesc::new("Convolution")
            .named(name)
            .with_attr("strides", AttributeValue::Ints(vec![1, 1]))
            .with_attr("pads_begin", AttributeValue::Ints(vec![0, 0]))
            .with_attr("pads_end", AttributeValue::Ints(vec![0, 0]))
            .with_io(&[x, w], &[y]),
    );
    (y, out_shape)
}

/// Add a constant per-channel bias tensor of shape `[1, K, 1, 1]`.
pub fn add_bias(graph: &mut GraphDesc, name: &str, channels: usize) -> TensorId {
    graph.add_constant(
        name,
        ElementType::F32,
        &[1, channels, 1, 1],
        f32_bytes((0..channels).map(|c| c as f32 * 0.25 - 0.5)),
    )
}

/// Create a convolution → bias → activation graph.
///
/// Graph structure:
///   x [1, 3, 30, 30] -> Convolution(5 x 3x3) -> conv.out
///   conv.out, bias [1, 5, 1, 1] -> Add -> add.out
///   add.out -> `activation` -> y        (or add.out is the output)
///
/// # Arguments
///
/// * `activation` - Activation op type, or `None` for conv + bias only.
pub fn make_conv_bias_act_graph(activation: Option<&str>) -> GraphDesc {
    let mut graph = GraphDesc::new("conv_bias_act");
    let in_shape = [1, 3, 30, 30];
    let x = graph.add_input("x", ElementType::F32, &in_shape);
    let (c, out_shape) = add_conv(&mut graph, "conv", x, in_shape, 5);
    let b = add_bias(&mut graph, "bias", 5);

    let a = match activation {
        Some(_) => graph.add_intermediate("add.out", ElementType::F32, &out_shape),
        None => graph.add_output("add.out", ElementType::F32, &out_shape),
    };
    graph.add_node(NodeDesc::new("Add").named("add").with_io(&[c, b], &[a]));

    if let Some(op_type) = activation {
        let y = graph.add_output("y", ElementType::F32, &out_shape);
        graph.add_node(NodeDesc::new(op_type).named("act").with_io(&[a], &[y]));
    }
    graph
}

/// Create a graph where the convolution output feeds two consumers.
///
/// Graph structure:
///   x -> Convolution -> conv.out
///   conv.out, bias -> Add -> y1
///   conv.out -> Relu -> y2
pub fn make_branching_graph() -> GraphDesc {
    let mut graph = GraphDesc::new("branching");
    let in_shape = [1, 2, 8, 8];
    let x = graph.add_input("x", ElementType::F32, &in_shape);
    let (c, out_shape) = add_conv(&mut graph, "conv", x, in_shape, 4);
    let b = add_bias(&mut graph, "bias", 4);
    let y1 = graph.add_output("y1", ElementType::F32, &out_shape);
    let y2 = graph.add_output("y2", ElementType::F32, &out_shape);
    graph.add_node(NodeDesc::new("Add").with_io(&[c, b], &[y1]));
    graph.add_node(NodeDesc::new("Relu").with_io(&[c], &[y2]));
    graph
}

/// Create two independent convolution chains.
///
/// Graph structure:
///   x1 -> Convolution -> Add(bias) -> Relu -> y1
///   x2 -> Convolution -> Add(bias) -> Sigmoid -> y2
pub fn make_two_branch_graph() -> GraphDesc {
    let mut graph = GraphDesc::new("two_branch");
    let in_shape = [1, 2, 10, 10];
    for (i, activation) in ["Relu", "Sigmoid"].into_iter().enumerate() {
        let x = graph.add_input(&format!("x{i}"), ElementType::F32, &in_shape);
        let (c, out_shape) = add_conv(&mut graph, &format!("conv{i}"), x, in_shape, 3);
        let b = add_bias(&mut graph, &format!("bias{i}"), 3);
        let a = graph.add_intermediate(&format!("add{i}.out"), ElementType::F32, &out_shape);
        let y = graph.add_output(&format!("y{i}"), ElementType::F32, &out_shape);
        graph.add_node(NodeDesc::new("Add").with_io(&[c, b], &[a]));
        graph.add_node(NodeDesc::new(activation).with_io(&[a], &[y]));
    }
    graph
}
