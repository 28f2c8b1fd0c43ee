//! Compiled execution plan.

use lumen_core::NodeId;
use lumen_operators::Op;

use crate::scheduler::StreamAssignment;
use crate::workbuffers::{WorkbufferLayout, WorkbufferSlots};

/// One operation of a compiled plan.
#[derive(Debug)]
pub struct PlannedOp {
    /// The constructed operation.
    pub op: Op,

    /// Source nodes (more than one for a fused chain).
    pub nodes: Vec<NodeId>,

    /// Stream index, plan indices to wait on, and event recording.
    pub schedule: StreamAssignment,

    /// Workbuffer offsets inside the arenas.
    pub workbuffers: WorkbufferSlots,
}

impl PlannedOp {
    pub fn is_fused(&self) -> bool {
        self.nodes.len() > 1
    }
}

/// Output of compilation: operations in dispatch order plus arena layout.
#[derive(Debug)]
pub struct CompiledPlan {
    pub ops: Vec<PlannedOp>,
    pub layout: WorkbufferLayout,
    pub stream_count: usize,
}

impl CompiledPlan {
    /// Number of fused composites in the plan.
    pub fn fused_count(&self) -> usize {
        self.ops.iter().filter(|op| op.is_fused()).count()
    }

    /// Plan index of the operation built from `node`, if any.
    pub fn op_for_node(&self, node: NodeId) -> Option<usize> {
        self.ops.iter().position(|op| op.nodes.contains(&node))
    }

    /// Streams that carry at least one operation.
    pub fn used_streams(&self) -> Vec<usize> {
        let mut streams: Vec<usize> = self.ops.iter().map(|op| op.schedule.stream).collect();
        streams.sort_unstable();
        streams.dedup();
        streams
    }
}
