//! Stream assignment for lowered operations.
//!
//! Operations keep their list order. Each one continues on the stream of its
//! most recent in-graph producer; operations without one are distributed
//! round-robin. A dependency that crosses streams becomes an event recorded
//! after the producer and waited on by the consumer's stream.

use lumen_core::{Error, GraphDesc, Operation, Result, TensorId, TensorKind};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

use crate::fusion::LoweredOp;

/// Stream and synchronization decisions for one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamAssignment {
    /// Logical stream index.
    pub stream: usize,

    /// Operations (plan indices) on other streams that must finish first.
    pub waits: Vec<usize>,

    /// Whether an event is recorded after this operation.
    pub records_event: bool,
}

/// Assign streams to operations in plan order.
///
/// # Arguments
///
/// * `graph` - The source graph (tensor kinds).
/// * `ops` - Lowered operations in plan order.
/// * `stream_count` - Number of streams to distribute over (at least 1).
///
/// # Returns
///
/// One assignment per operation. Fails with `InvalidGraph` when the
/// dependencies contain a cycle or an operation reads a tensor that a later
/// operation writes.
pub fn assign_streams(
    graph: &GraphDesc,
    ops: &[LoweredOp],
    stream_count: usize,
) -> Result<Vec<StreamAssignment>> {
    if stream_count == 0 {
        return Err(Error::UnsupportedConfiguration(
            "stream_count must be at least 1".to_string(),
        ));
    }

    let deps = build_dependency_graph(graph, ops)?;
    if petgraph::algo::is_cyclic_directed(&deps) {
        return Err(Error::InvalidGraph(
            "Operation dependencies contain a cycle".to_string(),
        ));
    }

    let mut assignments: Vec<StreamAssignment> = Vec::with_capacity(ops.len());
    let mut next_stream = 0;

    for index in 0..ops.len() {
        let mut producers: Vec<usize> = deps
            .neighbors_directed(NodeIndex::new(index), Direction::Incoming)
            .map(|p| deps[p])
            .collect();
        producers.sort_unstable();
        producers.dedup();

        if let Some(&late) = producers.iter().find(|&&p| p >= index) {
            return Err(Error::InvalidGraph(format!(
                "Operation {index} ('{}') depends on later operation {late}",
                ops[index].op.name()
            )));
        }

        let stream = match producers.last() {
            Some(&latest) => assignments[latest].stream,
            None => {
                let stream = next_stream;
                next_stream = (next_stream + 1) % stream_count;
                stream
            }
        };

        let waits: Vec<usize> = producers
            .iter()
            .copied()
            .filter(|&p| assignments[p].stream != stream)
            .collect();
        for &p in &waits {
            assignments[p].records_event = true;
        }

        tracing::debug!(
            op = index,
            name = ops[index].op.name(),
            stream,
            waits = ?waits,
            "scheduled operation"
        );

        assignments.push(StreamAssignment {
            stream,
            waits,
            records_event: false,
        });
    }

    Ok(assignments)
}

/// Build a dependency graph where nodes are operations and edges run from
/// the producer of a tensor to each of its consumers.
fn build_dependency_graph(
    graph: &GraphDesc,
    ops: &[LoweredOp],
) -> Result<DiGraph<usize, TensorId>> {
    let mut deps = DiGraph::with_capacity(ops.len(), ops.len());
    for index in 0..ops.len() {
        deps.add_node(index);
    }

    let mut producers: HashMap<TensorId, usize> = HashMap::new();
    for (index, lowered) in ops.iter().enumerate() {
        for output in lowered.op.output_ids().iter() {
            if producers.insert(output.0, index).is_some() {
                return Err(Error::InvalidGraph(format!(
                    "Tensor {output} is written by more than one operation"
                )));
            }
        }
    }

    for (consumer, lowered) in ops.iter().enumerate() {
        for input in lowered.op.input_ids().iter() {
            let kind = graph.tensor(input.0)?.kind;
            if matches!(kind, TensorKind::Input | TensorKind::Constant) {
                continue;
            }
            let Some(&producer) = producers.get(&input.0) else {
                return Err(Error::InvalidGraph(format!(
                    "Tensor {input} is read by operation {consumer} but never produced"
                )));
            };
            deps.add_edge(NodeIndex::new(producer), NodeIndex::new(consumer), input.0);
        }
    }

    Ok(deps)
}
