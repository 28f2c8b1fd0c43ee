//! Execution plan compiler for Lumen.
//!
//! This crate takes an ordered `GraphDesc` and compiles it into a
//! `CompiledPlan` that `lumen-runtime` binds to device memory and executes.
//!
//! Compilation runs in fixed stages:
//! 1. **Validation** - Check graph structure and options
//! 2. **Fusion** - Match `Convolution → Add → [activation]` chains
//! 3. **Construction** - Build one operation per node or fused chain
//! 4. **Scheduling** - Assign streams and cross-stream events
//! 5. **Workbuffers** - Query requests and lay out the arenas
//!
//! # Example
//!
//! ```no_run
//! use lumen_compiler::{compile, CompileOptions};
//! use lumen_core::{CreationContext, GraphDesc, HostDevice};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let graph = GraphDesc::new("model");
//! let ctx = CreationContext::new(Arc::new(HostDevice::new()));
//! let plan = compile(&graph, &ctx, &CompileOptions::default())?;
//!
//! println!("Compiled {} operations", plan.ops.len());
//! # Ok(())
//! # }
//! ```

pub mod fusion;
pub mod plan;
pub mod scheduler;
pub mod workbuffers;

pub use fusion::{build_operations, find_fusions, is_channel_bias, FusionMatch, LoweredOp};
pub use plan::{CompiledPlan, PlannedOp};
pub use scheduler::{assign_streams, StreamAssignment};
pub use workbuffers::{align_up, plan_workbuffers, Region, WorkbufferLayout, WorkbufferSlots};

use lumen_core::{CreationContext, Error, GraphDesc, Operation, Result};

/// Compiler options.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Fuse convolution chains into single launches.
    pub enable_fusion: bool,

    /// Number of device streams to distribute independent work over.
    pub stream_count: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            enable_fusion: true,
            stream_count: 1,
        }
    }
}

/// Compile a graph into an execution plan.
///
/// # Arguments
///
/// * `graph` - Ordered graph descriptor
/// * `ctx` - Creation context (device properties, current stream)
/// * `options` - Fusion and stream options
///
/// # Returns
///
/// Returns a `CompiledPlan` with operations in dispatch order.
///
/// # Errors
///
/// Returns an error if:
/// - The graph is structurally invalid
/// - Any operation fails construction (fusion composites fall back instead)
/// - Stream assignment or workbuffer planning fails
#[tracing::instrument(skip_all, fields(graph = %graph.name, num_nodes = graph.nodes.len(), num_tensors = graph.tensors.len()))]
pub fn compile(
    graph: &GraphDesc,
    ctx: &CreationContext,
    options: &CompileOptions,
) -> Result<CompiledPlan> {
    {
        let _span = tracing::debug_span!("validate").entered();
        if options.stream_count == 0 {
            return Err(Error::UnsupportedConfiguration(
                "stream_count must be at least 1".to_string(),
            ));
        }
        graph.validate()?;
    }

    let matches = {
        let _span = tracing::debug_span!("fusion", enabled = options.enable_fusion).entered();
        if options.enable_fusion {
            find_fusions(graph)
        } else {
            Vec::new()
        }
    };

    let lowered = {
        let _span = tracing::debug_span!("construction", matches = matches.len()).entered();
        build_operations(ctx, graph, &matches)?
    };

    let schedule = {
        let _span = tracing::debug_span!("scheduling", streams = options.stream_count).entered();
        assign_streams(graph, &lowered, options.stream_count)?
    };

    let layout = {
        let _span = tracing::debug_span!("workbuffers").entered();
        let requests: Vec<_> = lowered.iter().map(|l| l.op.workbuffer_request()).collect();
        let streams: Vec<_> = schedule.iter().map(|s| s.stream).collect();
        plan_workbuffers(
            &requests,
            &streams,
            options.stream_count,
            ctx.properties().workbuffer_alignment,
        )?
    };

    let ops = lowered
        .into_iter()
        .zip(schedule)
        .zip(layout.slots.iter().cloned())
        .map(|((lowered, schedule), workbuffers)| PlannedOp {
            op: lowered.op,
            nodes: lowered.nodes,
            schedule,
            workbuffers,
        })
        .collect::<Vec<_>>();

    let plan = CompiledPlan {
        ops,
        layout,
        stream_count: options.stream_count,
    };
    tracing::debug!(
        ops = plan.ops.len(),
        fused = plan.fused_count(),
        immutable_bytes = plan.layout.immutable_size,
        mutable_bytes = plan.layout.mutable_size,
        "compiled plan"
    );
    Ok(plan)
}
