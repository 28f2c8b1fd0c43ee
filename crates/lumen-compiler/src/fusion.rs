//! Convolution fusion and operation construction.
//!
//! The matcher scans the ordered node list left to right looking for
//! `Convolution → Add(constant per-channel bias) → [activation]` chains whose
//! intermediate tensors have exactly one consumer and are not graph outputs.
//! Every match becomes one `FusedConvolution`; when the composite cannot be
//! built the chain is lowered node by node instead.

use lumen_core::{
    CreationContext, Error, GraphDesc, IndexCollection, NodeId, NodeView, Operation, Result,
    TensorId, TensorKind,
};
use lumen_operators::{is_add, is_convolution, Activation, Op};
use std::collections::{HashMap, HashSet};

/// A matched `Convolution → Add → [activation]` chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusionMatch {
    /// The anchor convolution.
    pub conv: NodeId,

    /// The `Add` consuming the convolution output.
    pub bias_add: NodeId,

    /// Optional activation consuming the `Add` output.
    pub activation: Option<NodeId>,

    /// The constant bias operand of the `Add`.
    pub bias: TensorId,
}

impl FusionMatch {
    /// Nodes covered by the match, in list order.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes = vec![self.conv, self.bias_add];
        nodes.extend(self.activation);
        nodes
    }
}

/// An operation produced from one node or one fused chain.
#[derive(Debug)]
pub struct LoweredOp {
    pub op: Op,

    /// Source nodes, in list order.
    pub nodes: Vec<NodeId>,
}

/// Find fusable chains with a greedy left-to-right scan.
///
/// A node that joined one match never joins another.
pub fn find_fusions(graph: &GraphDesc) -> Vec<FusionMatch> {
    let mut consumed = HashSet::new();
    let mut matches = Vec::new();

    for (id, node) in graph.nodes.iter().enumerate() {
        if consumed.contains(&id) || !is_convolution(&node.op_type) {
            continue;
        }
        let Some(found) = match_chain(graph, id, &consumed) else {
            continue;
        };
        tracing::debug!(
            conv = id,
            bias_add = found.bias_add,
            activation = ?found.activation,
            "matched convolution chain"
        );
        consumed.extend(found.nodes());
        matches.push(found);
    }

    matches
}

fn match_chain(
    graph: &GraphDesc,
    conv: NodeId,
    consumed: &HashSet<NodeId>,
) -> Option<FusionMatch> {
    let conv_node = &graph.nodes[conv];
    let [conv_out] = conv_node.outputs.as_slice() else {
        return None;
    };
    let conv_out = *conv_out;
    let out_shape = &graph.tensors.get(conv_out)?.shape;

    let bias_add = sole_consumer(graph, conv_out, consumed)?;
    let add_node = &graph.nodes[bias_add];
    if !is_add(&add_node.op_type) || add_node.outputs.len() != 1 {
        return None;
    }
    let bias = match add_node.inputs.as_slice() {
        [a, b] if *a == conv_out && *b != conv_out => *b,
        [a, b] if *b == conv_out && *a != conv_out => *a,
        _ => return None,
    };
    let bias_desc = graph.tensors.get(bias)?;
    if bias_desc.kind != TensorKind::Constant || !is_channel_bias(&bias_desc.shape, out_shape) {
        return None;
    }

    let add_out = add_node.outputs[0];
    let activation = sole_consumer(graph, add_out, consumed).filter(|&id| {
        let node = &graph.nodes[id];
        Activation::is_activation(&node.op_type)
            && node.inputs.as_slice() == [add_out]
            && node.outputs.len() == 1
    });

    Some(FusionMatch {
        conv,
        bias_add,
        activation,
        bias,
    })
}

/// The only consumer of `tensor`, if it has exactly one and is not a graph output.
fn sole_consumer(
    graph: &GraphDesc,
    tensor: TensorId,
    consumed: &HashSet<NodeId>,
) -> Option<NodeId> {
    if graph.is_graph_output(tensor) {
        return None;
    }
    match graph.consumers(tensor).as_slice() {
        [id] if !consumed.contains(id) => {
            let reads = graph.nodes[*id].inputs.iter().filter(|&&t| t == tensor).count();
            (reads == 1).then_some(*id)
        }
        _ => None,
    }
}

/// Check that `shape` holds one value per output channel of an NCHW `output`.
///
/// After right-alignment every dimension must be 1 except the channel
/// dimension, which must equal the output channel count.
pub fn is_channel_bias(shape: &[usize], output: &[usize]) -> bool {
    if output.len() != 4 || shape.len() > output.len() {
        return false;
    }
    let pad = output.len() - shape.len();
    (0..output.len()).all(|d| {
        let dim = if d < pad { 1 } else { shape[d - pad] };
        if d == 1 {
            dim == output[1]
        } else {
            dim == 1
        }
    })
}

/// Construct operations for every node, fusing the matched chains.
///
/// A composite is placed at its convolution's position. When a composite
/// fails to build, its nodes are constructed individually at their own
/// positions. Any other construction error aborts.
pub fn build_operations(
    ctx: &CreationContext,
    graph: &GraphDesc,
    matches: &[FusionMatch],
) -> Result<Vec<LoweredOp>> {
    let by_anchor: HashMap<NodeId, &FusionMatch> = matches.iter().map(|m| (m.conv, m)).collect();
    let mut fused_away = HashSet::new();
    let mut ops = Vec::with_capacity(graph.nodes.len());

    for (id, node) in graph.nodes.iter().enumerate() {
        if fused_away.contains(&id) {
            continue;
        }

        if let Some(found) = by_anchor.get(&id) {
            match build_fused(ctx, graph, found) {
                Ok(op) => {
                    tracing::debug!(op = op.name(), nodes = ?found.nodes(), "fused convolution chain");
                    fused_away.insert(found.bias_add);
                    fused_away.extend(found.activation);
                    ops.push(LoweredOp {
                        op,
                        nodes: found.nodes(),
                    });
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        conv = %NodeView::new(node, graph).display_name(),
                        error = %e,
                        "cannot fuse convolution chain, falling back to unfused operations"
                    );
                }
            }
        }

        let view = NodeView::new(node, graph);
        let op = Op::create(
            ctx,
            &view,
            IndexCollection::new(&node.inputs),
            IndexCollection::new(&node.outputs),
        )?;
        tracing::trace!(node = id, kind = op.kind(), "constructed operation");
        ops.push(LoweredOp {
            op,
            nodes: vec![id],
        });
    }

    Ok(ops)
}

fn build_fused(ctx: &CreationContext, graph: &GraphDesc, found: &FusionMatch) -> Result<Op> {
    let conv = graph.node(found.conv)?;
    let bias_add = graph.node(found.bias_add)?;
    let activation = found.activation.map(|id| graph.node(id)).transpose()?;
    let last = activation.unwrap_or(bias_add);

    let [data, weights] = conv.inputs.as_slice() else {
        return Err(Error::UnsupportedConfiguration(format!(
            "{}: fused convolution takes exactly data and weights",
            NodeView::new(conv, graph).display_name()
        )));
    };
    let activation_view = activation.map(|node| NodeView::new(node, graph));

    Op::fused_convolution(
        ctx,
        &NodeView::new(conv, graph),
        &NodeView::new(bias_add, graph),
        activation_view.as_ref(),
        IndexCollection::new(&[*data, *weights, found.bias]),
        IndexCollection::new(&last.outputs),
    )
}
